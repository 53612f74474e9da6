//! The raw datagram socket abstraction.
//!
//! Kept as a trait, the same way the reactor's `dial`/`listen` free functions wrap `socket2`
//! without committing callers to a concrete transport, so tests can substitute a loopback or
//! mock implementation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::Error;

/// The socket interface the transport core is driven through.
pub trait NetSocket: Send + Sync {
    /// Bind to `port` on the requested address families. Returns `Ok(true)` on success,
    /// `Ok(false)` if neither family was requested.
    fn bind(&self, v4: bool, v6: bool, port: u16, reuse_address: bool) -> Result<bool, Error>;

    /// Send `bytes` to `endpoint`.
    fn send_to(&self, bytes: &[u8], endpoint: SocketAddr) -> Result<usize, Error>;

    /// Send `bytes` as a subnet broadcast on `port`.
    fn send_broadcast(&self, bytes: &[u8], port: u16) -> Result<bool, Error>;

    /// Close the socket, unblocking any thread parked in `recv_from`.
    fn close(&self);

    /// The locally bound port, if bound.
    fn local_port(&self) -> Option<u16>;

    /// Block until a datagram arrives, or the socket is closed.
    ///
    /// Returns `Ok((len, from))` on a datagram, `Err` on a socket error. A closed socket should
    /// unblock a pending call with an `Err` rather than hanging forever.
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error>;
}

/// A real UDP socket, built the same way the reference reactor constructs its listener sockets:
/// via `socket2` for reuse-address control, then converted into a `std::net::UdpSocket`.
pub struct UdpNetSocket {
    inner: std::sync::RwLock<Option<std::net::UdpSocket>>,
}

impl UdpNetSocket {
    pub fn new() -> Self {
        Self {
            inner: std::sync::RwLock::new(None),
        }
    }

    fn bind_one(domain: Domain, addr: SocketAddr, reuse_address: bool) -> Result<Socket, Error> {
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(reuse_address)?;
        socket.set_nonblocking(false)?;
        socket.bind(&addr.into())?;
        Ok(socket)
    }
}

impl Default for UdpNetSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl NetSocket for UdpNetSocket {
    fn bind(&self, v4: bool, v6: bool, port: u16, reuse_address: bool) -> Result<bool, Error> {
        if !v4 && !v6 {
            return Ok(false);
        }
        // This core binds a single socket; v4-mapped-v6 is left to the OS, matching the
        // reference's single-listener-per-reactor model.
        let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
        let addr = if v6 {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        };
        let socket = Self::bind_one(domain, addr, reuse_address)?;
        socket.set_broadcast(true).ok();
        let mut guard = self.inner.write().expect("socket lock poisoned");
        *guard = Some(socket.into());
        Ok(true)
    }

    fn send_to(&self, bytes: &[u8], endpoint: SocketAddr) -> Result<usize, Error> {
        let guard = self.inner.read().expect("socket lock poisoned");
        let socket = guard.as_ref().ok_or(Error::NotRunning)?;
        Ok(socket.send_to(bytes, endpoint)?)
    }

    fn send_broadcast(&self, bytes: &[u8], port: u16) -> Result<bool, Error> {
        let guard = self.inner.read().expect("socket lock poisoned");
        let socket = guard.as_ref().ok_or(Error::NotRunning)?;
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);
        socket.send_to(bytes, dest)?;
        Ok(true)
    }

    fn close(&self) {
        let mut guard = self.inner.write().expect("socket lock poisoned");
        *guard = None;
    }

    fn local_port(&self) -> Option<u16> {
        let guard = self.inner.read().expect("socket lock poisoned");
        guard.as_ref().and_then(|s| s.local_addr().ok()).map(|a| a.port())
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        // Cloning the handle lets us read without holding the lock across a blocking syscall,
        // while `close` still drops the original and causes the OS handle to error out on reads
        // racing the clear.
        let socket = {
            let guard = self.inner.read().expect("socket lock poisoned");
            guard.as_ref().ok_or(Error::NotRunning)?.try_clone()?
        };
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        Ok(socket.recv_from(buf)?)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    /// A socket double recording every send, for deterministic unit tests of peer state
    /// machines that don't need real network I/O.
    #[derive(Default)]
    pub struct LoopbackSocket {
        pub sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl NetSocket for LoopbackSocket {
        fn bind(&self, _v4: bool, _v6: bool, _port: u16, _reuse_address: bool) -> Result<bool, Error> {
            Ok(true)
        }

        fn send_to(&self, bytes: &[u8], endpoint: SocketAddr) -> Result<usize, Error> {
            self.sent
                .lock()
                .unwrap()
                .push((endpoint, bytes.to_vec()));
            Ok(bytes.len())
        }

        fn send_broadcast(&self, bytes: &[u8], port: u16) -> Result<bool, Error> {
            self.send_to(bytes, SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port))
                .map(|_| true)
        }

        fn close(&self) {}

        fn local_port(&self) -> Option<u16> {
            Some(0)
        }

        fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
            Err(Error::NotRunning)
        }
    }

    #[test]
    fn loopback_records_sends() {
        let socket = LoopbackSocket::default();
        let dest: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        socket.send_to(&[1, 2, 3], dest).unwrap();
        assert_eq!(socket.sent.lock().unwrap().len(), 1);
    }
}
