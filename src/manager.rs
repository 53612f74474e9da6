//! The `NetManager` facade: lifecycle, send/connect API, and event polling.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::debug_sim::DebugDelayQueue;
use crate::demux::Demultiplexer;
use crate::error::Error;
use crate::event::{Event, NetEventListener};
use crate::packet::DeliveryMethod;
use crate::peer::{ConnectionState, ConnectionStateMask, Peer, SimplePeerStateMachine};
use crate::shared::Shared;
use crate::socket::{NetSocket, UdpNetSocket};
use crate::stats::StatisticsSnapshot;
use crate::time::LocalTime;
use crate::logic_tick;

struct Threads {
    receive: Option<JoinHandle<()>>,
    logic: Option<JoinHandle<()>>,
}

/// The central multiplexer: owns the datagram socket, the peer table, the logic tick, and the
/// event queue, and exposes the user-facing API.
pub struct NetManager {
    shared: Arc<Shared>,
    threads: Mutex<Threads>,
}

impl NetManager {
    /// Construct a manager bound to a real UDP socket, not yet started.
    pub fn new(config: Config, listener: Arc<dyn NetEventListener>) -> Self {
        Self::with_socket(config, Arc::new(UdpNetSocket::new()), listener)
    }

    /// Construct a manager over a caller-supplied socket (e.g. a test double).
    pub fn with_socket(
        config: Config,
        socket: Arc<dyn NetSocket>,
        listener: Arc<dyn NetEventListener>,
    ) -> Self {
        Self {
            shared: Shared::new(config, socket, listener),
            threads: Mutex::new(Threads {
                receive: None,
                logic: None,
            }),
        }
    }

    /// Bind the socket and spawn the receive and logic-tick threads.
    ///
    /// Returns `Ok(false)` (not an error) if the manager is already running.
    pub fn start(&self, v4: bool, v6: bool, port: u16) -> Result<bool, Error> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        if !self
            .shared
            .socket
            .bind(v4, v6, port, self.shared.config.reuse_address)?
        {
            self.shared.running.store(false, Ordering::SeqCst);
            return Ok(false);
        }

        let mut threads = self.threads.lock().expect("threads lock poisoned");

        let receive_shared = self.shared.clone();
        threads.receive = Some(
            std::thread::Builder::new()
                .name("net-manager-recv".into())
                .spawn(move || receive_loop(receive_shared))
                .expect("failed to spawn receive thread"),
        );

        let logic_shared = self.shared.clone();
        threads.logic = Some(
            std::thread::Builder::new()
                .name("net-manager-logic".into())
                .spawn(move || logic_tick::run(logic_shared))
                .expect("failed to spawn logic thread"),
        );

        info!(port, "net manager started");
        Ok(true)
    }

    /// Stop the manager: gracefully shut down every peer, join both threads, and reset state.
    ///
    /// Idempotent: calling `stop` on an already-stopped manager is a no-op.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for peer in self.shared.table.snapshot() {
            peer.shutdown(&[], false);
        }

        self.shared.socket.close();

        let mut threads = self.threads.lock().expect("threads lock poisoned");
        if let Some(handle) = threads.receive.take() {
            let _ = handle.join();
        }
        if let Some(handle) = threads.logic.take() {
            let _ = handle.join();
        }

        self.shared.table.clear();
        self.shared.events.drain();
        self.shared
            .connected_peers_count
            .store(0, Ordering::SeqCst);
        info!("net manager stopped");
    }

    /// Drain and dispatch every event currently queued.
    ///
    /// A no-op under `Config::unsynced_events`, since events are already dispatched inline.
    pub fn poll_events(&self) {
        for event in self.shared.events.drain() {
            crate::event::dispatch(
                self.shared.listener.as_ref(),
                event,
                &self.shared.pool,
                self.shared.config.auto_recycle,
            );
        }
    }

    /// Flush every connected peer's outgoing buffer immediately.
    pub fn flush(&self) {
        for peer in self.shared.table.snapshot() {
            peer.flush();
        }
    }

    /// Begin (or rejoin) a connection to `endpoint`, carrying `payload` in the handshake.
    pub fn connect(&self, endpoint: SocketAddr, payload: &[u8]) -> Result<Peer, Error> {
        if !self.shared.is_running() {
            return Err(Error::NotRunning);
        }

        let mut connection_number = 0u8;
        if let Some(existing) = self.shared.table.try_get(endpoint) {
            match existing.connection_state() {
                ConnectionState::Connected
                | ConnectionState::OutgoingInProgress
                | ConnectionState::IncomingInProgress => return Ok(existing),
                ConnectionState::ShutdownRequested | ConnectionState::Disconnected => {
                    connection_number = existing.connection_num().wrapping_add(1);
                    self.shared.table.remove_peer(&existing);
                }
            }
        }

        let connection_id = self.shared.allocate_connection_id();
        let peer: Peer = Arc::new(SimplePeerStateMachine::new(
            endpoint,
            self.shared.socket.clone(),
            ConnectionState::OutgoingInProgress,
            connection_id,
            connection_number,
            LocalTime::now(),
        ));
        let resident = self.shared.table.try_add(peer);

        let mut request = vec![crate::packet::PacketProperty::ConnectRequest.as_byte()];
        request.extend_from_slice(&connection_id.to_le_bytes());
        request.push(resident.connection_num());
        request.extend_from_slice(payload);
        match self.shared.socket.send_to(&request, endpoint) {
            Ok(sent) => {
                self.shared.stats.record_sent(sent);
                Ok(resident)
            }
            Err(err) => {
                self.shared.table.remove_peer(&resident);
                Err(err)
            }
        }
    }

    /// Send `bytes` to every connected peer, optionally skipping `exclude`.
    pub fn send_to_all(&self, bytes: &[u8], method: DeliveryMethod, exclude: Option<&Peer>) {
        for peer in self.shared.table.snapshot() {
            if let Some(excluded) = exclude {
                if Arc::ptr_eq(&peer, excluded) {
                    continue;
                }
            }
            if peer.connection_state() == ConnectionState::Connected {
                match peer.send(bytes, method) {
                    Ok(sent) => self.shared.stats.record_sent(sent),
                    Err(err) => self.shared.handle_send_failure(&peer, &err),
                }
            }
        }
    }

    /// Send an unconnected message directly to `endpoint`, bypassing any peer session.
    pub fn send_unconnected_message(&self, bytes: &[u8], endpoint: SocketAddr) -> Result<usize, Error> {
        let mut buf = vec![crate::packet::PacketProperty::UnconnectedMessage.as_byte()];
        buf.extend_from_slice(bytes);
        let sent = self.shared.socket.send_to(&buf, endpoint)?;
        self.shared.stats.record_sent(sent);
        Ok(sent)
    }

    /// Broadcast a discovery request on `port`.
    pub fn send_discovery_request(&self, bytes: &[u8], port: u16) -> Result<bool, Error> {
        let mut buf = vec![crate::packet::PacketProperty::DiscoveryRequest.as_byte()];
        buf.extend_from_slice(bytes);
        let sent = self.shared.socket.send_broadcast(&buf, port)?;
        if sent {
            self.shared.stats.record_sent(buf.len());
        }
        Ok(sent)
    }

    /// Reply to a discovery request with a unicast discovery response.
    pub fn send_discovery_response(&self, bytes: &[u8], endpoint: SocketAddr) -> Result<usize, Error> {
        let mut buf = vec![crate::packet::PacketProperty::DiscoveryResponse.as_byte()];
        buf.extend_from_slice(bytes);
        let sent = self.shared.socket.send_to(&buf, endpoint)?;
        self.shared.stats.record_sent(sent);
        Ok(sent)
    }

    /// Gracefully disconnect `peer`, sending a final `Disconnect` datagram carrying `data`.
    pub fn disconnect_peer(&self, peer: &Peer, data: Option<&[u8]>) {
        if peer.shutdown(data.unwrap_or(&[]), false) {
            self.shared.table.remove_peer(peer);
        }
    }

    /// Disconnect `peer` without sending a final datagram.
    pub fn disconnect_peer_force(&self, peer: &Peer) {
        peer.shutdown(&[], true);
        self.shared.table.remove_peer(peer);
    }

    /// Gracefully disconnect every peer.
    pub fn disconnect_all(&self, data: Option<&[u8]>) {
        for peer in self.shared.table.snapshot() {
            self.disconnect_peer(&peer, data);
        }
    }

    /// Peers matching `mask`, allocating a fresh `Vec`.
    pub fn get_peers(&self, mask: ConnectionStateMask) -> Vec<Peer> {
        self.shared
            .table
            .snapshot()
            .into_iter()
            .filter(|p| mask.contains(p.connection_state()))
            .collect()
    }

    /// Peers matching `mask`, appended into a caller-supplied buffer to avoid allocating.
    pub fn get_peers_non_alloc(&self, out: &mut Vec<Peer>, mask: ConnectionStateMask) {
        out.clear();
        for peer in self.shared.table.snapshot() {
            if mask.contains(peer.connection_state()) {
                out.push(peer);
            }
        }
    }

    /// The first resident peer, if any.
    pub fn get_first_peer(&self) -> Option<Peer> {
        self.shared.table.snapshot().into_iter().next()
    }

    /// Eventually-consistent count of peers in `ConnectionState::Connected`.
    pub fn connected_peers_count(&self) -> usize {
        self.shared.connected_peers_count()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.shared.socket.local_port()
    }
}

impl Drop for NetManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The blocking socket-receive loop run on its own OS thread.
fn receive_loop(shared: Arc<Shared>) {
    debug!("receive loop starting");
    let mut buf = vec![0u8; 65535];

    while shared.running.load(Ordering::SeqCst) {
        match shared.socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let now = LocalTime::now();
                if DebugDelayQueue::should_drop(&shared.config) {
                    shared.stats.record_dropped();
                    continue;
                }
                if shared.delay_queue.try_delay(&shared.config, &buf[..len], from, now) {
                    continue;
                }
                Demultiplexer::handle_datagram(&shared, &buf[..len], from);
            }
            Err(Error::Io(ref io_err))
                if matches!(io_err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(Error::NotRunning) => break,
            Err(err) => {
                error!(%err, "socket receive error");
                Demultiplexer::handle_socket_error(&shared, io_error_code(&err));
            }
        }
    }
    debug!("receive loop stopped");
}

fn io_error_code(err: &Error) -> i32 {
    match err {
        Error::Io(io_err) => io_err.raw_os_error().unwrap_or(-1),
        _ => -1,
    }
}
