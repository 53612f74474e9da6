//! The peer record and the reliability-layer interface it is driven through.
//!
//! The actual reliability protocol (acknowledgment, sequencing, fragmentation, retransmit) is an
//! external collaborator: [`PeerStateMachine`] is the seam between this crate's transport core
//! and that logic. [`SimplePeerStateMachine`] is a minimal, fully-synchronous implementation
//! sufficient to exercise the core end to end; it does not retransmit or reorder.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::packet::{DeliveryMethod, Packet, PacketProperty};
use crate::socket::NetSocket;
use crate::time::LocalTime;

/// A [`crate::peer::PeerStateMachine::connection_num`] wraps through all 256 values of a `u8`;
/// advancing to the next one is exactly `wrapping_add(1)`, with no separate modulus needed.

/// Lifecycle state of a peer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    OutgoingInProgress,
    IncomingInProgress,
    Connected,
    ShutdownRequested,
    Disconnected,
}

/// Bitmask selecting a subset of [`ConnectionState`]s, used by `NetManager::get_peers`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStateMask(u8);

impl ConnectionStateMask {
    pub const OUTGOING_IN_PROGRESS: ConnectionStateMask = ConnectionStateMask(1 << 0);
    pub const INCOMING_IN_PROGRESS: ConnectionStateMask = ConnectionStateMask(1 << 1);
    pub const CONNECTED: ConnectionStateMask = ConnectionStateMask(1 << 2);
    pub const SHUTDOWN_REQUESTED: ConnectionStateMask = ConnectionStateMask(1 << 3);
    pub const DISCONNECTED: ConnectionStateMask = ConnectionStateMask(1 << 4);
    pub const ANY: ConnectionStateMask = ConnectionStateMask(0b1_1111);

    pub fn contains(&self, state: ConnectionState) -> bool {
        self.0 & Self::bit(state) != 0
    }

    pub fn union(self, other: ConnectionStateMask) -> ConnectionStateMask {
        ConnectionStateMask(self.0 | other.0)
    }

    fn bit(state: ConnectionState) -> u8 {
        match state {
            ConnectionState::OutgoingInProgress => Self::OUTGOING_IN_PROGRESS.0,
            ConnectionState::IncomingInProgress => Self::INCOMING_IN_PROGRESS.0,
            ConnectionState::Connected => Self::CONNECTED.0,
            ConnectionState::ShutdownRequested => Self::SHUTDOWN_REQUESTED.0,
            ConnectionState::Disconnected => Self::DISCONNECTED.0,
        }
    }
}

/// Outcome of classifying an incoming `ConnectRequest` against an existing peer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRequestResult {
    /// The remote believes the old session is lost and is reconnecting; replace the peer.
    Reconnection,
    /// The existing record is stale; replace it.
    NewConnection,
    /// Simultaneous peer-to-peer handshake; keep the existing peer, surface a request.
    P2PConnection,
    /// The request matches the peer's current session; no action.
    None,
}

/// Outcome of processing an incoming `Disconnect` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectResult {
    /// The peer was torn down; a `Disconnect(reason = RemoteConnectionClose)` event is due.
    Disconnect,
    /// The disconnect amounts to a handshake rejection; reason is `ConnectionRejected`.
    Rejected,
    /// The packet carried no actionable disconnect (e.g. stale or malformed); ignore it.
    None,
}

/// Why a peer was disconnected, surfaced on [`crate::event::Event::Disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    RemoteConnectionClose,
    ConnectionRejected,
    Timeout,
    SocketSendError,
    DisconnectCalled,
}

/// The interface the transport core drives each peer's reliability layer through.
///
/// Implementations must be safe to call from both the socket-receive thread and the logic-tick
/// thread; the reference implementation below does so with a single internal mutex.
pub trait PeerStateMachine: Send + Sync {
    /// Advance internal timers by `elapsed_ms` (called once per logic tick).
    fn update(&self, elapsed_ms: u64);

    /// Handle a packet addressed to this peer that isn't a connect/disconnect control packet.
    fn process_packet(&self, packet: &Packet);

    /// Classify an incoming `ConnectRequest` relative to this peer's current session.
    fn process_connect_request(&self, connection_id: u64, connection_number: u8) -> ConnectRequestResult;

    /// Handle a `ConnectAccept` packet. Returns `true` if it completed this peer's handshake.
    fn process_connect_accept(&self, packet: &Packet) -> bool;

    /// Handle a `Disconnect` packet.
    fn process_disconnect(&self, packet: &Packet) -> DisconnectResult;

    /// Complete an incoming handshake the listener chose to accept.
    fn accept(&self, connection_id: u64, connection_number: u8);

    /// Fail an incoming handshake the listener chose to reject.
    fn reject(&self, connection_id: u64, connection_number: u8, data: &[u8]);

    /// Begin graceful shutdown. Returns `false` if already shut down.
    fn shutdown(&self, data: &[u8], force: bool) -> bool;

    /// Queue application data for delivery per `method`.
    ///
    /// A returned `Err` carries the raw socket failure; the caller (the `NetManager` facade) is
    /// responsible for classifying it per the error taxonomy in §7 of the spec (message-too-large
    /// is logged and dropped, host-unreachable/connection-reset tear the peer down, anything else
    /// is surfaced as an `Error` event) rather than the peer tearing itself down here.
    fn send(&self, data: &[u8], method: DeliveryMethod) -> Result<usize, crate::error::Error>;

    /// Force any buffered sends out immediately.
    fn flush(&self);

    fn connection_state(&self) -> ConnectionState;
    fn connect_id(&self) -> u64;
    fn connection_num(&self) -> u8;
    fn endpoint(&self) -> SocketAddr;
    fn time_since_last_packet(&self, now: LocalTime) -> LocalDurationMillis;

    /// Record that a packet was just received from this peer, resetting the idle timer.
    fn touch(&self, now: LocalTime);

    /// Transition `Connected` to `Disconnected` because the peer went idle past the configured
    /// timeout. Returns `false` without effect if the peer isn't currently `Connected` (the
    /// logic tick may observe the same idle peer more than once before it is reaped).
    fn mark_timed_out(&self) -> bool;
}

/// Milliseconds since the last packet from a peer, returned by
/// [`PeerStateMachine::time_since_last_packet`].
pub type LocalDurationMillis = u64;

struct SimplePeerInner {
    state: ConnectionState,
    connection_id: u64,
    connection_number: u8,
    last_packet_time: LocalTime,
    shutdown: bool,
}

/// A minimal [`PeerStateMachine`] with unreliable-only delivery: no retransmit, no reordering, no
/// fragmentation. Sufficient to drive the demultiplexer/negotiator/logic-tick end to end.
pub struct SimplePeerStateMachine {
    endpoint: SocketAddr,
    socket: Arc<dyn NetSocket>,
    inner: Mutex<SimplePeerInner>,
    connect_id_hint: AtomicU64,
    connection_num_hint: AtomicU8,
}

impl SimplePeerStateMachine {
    pub fn new(
        endpoint: SocketAddr,
        socket: Arc<dyn NetSocket>,
        state: ConnectionState,
        connection_id: u64,
        connection_number: u8,
        now: LocalTime,
    ) -> Self {
        Self {
            endpoint,
            socket,
            inner: Mutex::new(SimplePeerInner {
                state,
                connection_id,
                connection_number,
                last_packet_time: now,
                shutdown: false,
            }),
            connect_id_hint: AtomicU64::new(connection_id),
            connection_num_hint: AtomicU8::new(connection_number),
        }
    }
}

impl PeerStateMachine for SimplePeerStateMachine {
    fn update(&self, _elapsed_ms: u64) {
        // No retransmit queue in this reference implementation; nothing to advance.
    }

    fn process_packet(&self, _packet: &Packet) {}

    fn process_connect_request(&self, connection_id: u64, connection_number: u8) -> ConnectRequestResult {
        let inner = self.inner.lock().expect("peer poisoned");
        if connection_id == inner.connection_id && connection_number == inner.connection_number {
            ConnectRequestResult::None
        } else if connection_number == inner.connection_number.wrapping_add(1) {
            ConnectRequestResult::Reconnection
        } else if inner.state == ConnectionState::OutgoingInProgress {
            ConnectRequestResult::P2PConnection
        } else {
            ConnectRequestResult::NewConnection
        }
    }

    fn process_connect_accept(&self, _packet: &Packet) -> bool {
        let mut inner = self.inner.lock().expect("peer poisoned");
        if inner.state == ConnectionState::OutgoingInProgress {
            inner.state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    fn process_disconnect(&self, _packet: &Packet) -> DisconnectResult {
        let mut inner = self.inner.lock().expect("peer poisoned");
        match inner.state {
            ConnectionState::Connected => {
                inner.state = ConnectionState::Disconnected;
                DisconnectResult::Disconnect
            }
            ConnectionState::OutgoingInProgress | ConnectionState::IncomingInProgress => {
                inner.state = ConnectionState::Disconnected;
                DisconnectResult::Rejected
            }
            ConnectionState::ShutdownRequested | ConnectionState::Disconnected => DisconnectResult::None,
        }
    }

    fn accept(&self, connection_id: u64, connection_number: u8) {
        let mut inner = self.inner.lock().expect("peer poisoned");
        inner.connection_id = connection_id;
        inner.connection_number = connection_number;
        inner.state = ConnectionState::Connected;
        self.connect_id_hint.store(connection_id, Ordering::Relaxed);
        self.connection_num_hint.store(connection_number, Ordering::Relaxed);
        let _ = self
            .socket
            .send_to(&[PacketProperty::ConnectAccept.as_byte()], self.endpoint);
    }

    fn reject(&self, _connection_id: u64, _connection_number: u8, data: &[u8]) {
        let mut inner = self.inner.lock().expect("peer poisoned");
        inner.state = ConnectionState::Disconnected;
        let mut buf = vec![PacketProperty::Disconnect.as_byte()];
        buf.extend_from_slice(data);
        let _ = self.socket.send_to(&buf, self.endpoint);
    }

    fn shutdown(&self, data: &[u8], force: bool) -> bool {
        let mut inner = self.inner.lock().expect("peer poisoned");
        if inner.shutdown {
            return false;
        }
        inner.shutdown = true;
        inner.state = ConnectionState::ShutdownRequested;
        if !force {
            let mut buf = vec![PacketProperty::Disconnect.as_byte()];
            buf.extend_from_slice(data);
            let _ = self.socket.send_to(&buf, self.endpoint);
        }
        true
    }

    fn send(&self, data: &[u8], method: DeliveryMethod) -> Result<usize, crate::error::Error> {
        let mut buf = vec![method.to_property().as_byte()];
        buf.extend_from_slice(data);
        self.socket.send_to(&buf, self.endpoint)
    }

    fn flush(&self) {}

    fn connection_state(&self) -> ConnectionState {
        self.inner.lock().expect("peer poisoned").state
    }

    fn connect_id(&self) -> u64 {
        self.connect_id_hint.load(Ordering::Relaxed)
    }

    fn connection_num(&self) -> u8 {
        self.connection_num_hint.load(Ordering::Relaxed)
    }

    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn time_since_last_packet(&self, now: LocalTime) -> LocalDurationMillis {
        let inner = self.inner.lock().expect("peer poisoned");
        now.duration_since(inner.last_packet_time).as_millis() as u64
    }

    fn touch(&self, now: LocalTime) {
        self.inner.lock().expect("peer poisoned").last_packet_time = now;
    }

    fn mark_timed_out(&self) -> bool {
        let mut inner = self.inner.lock().expect("peer poisoned");
        if inner.state == ConnectionState::Connected {
            inner.state = ConnectionState::Disconnected;
            true
        } else {
            false
        }
    }
}

/// A shared handle to a peer's state machine, as stored in [`crate::peer_table::PeerTable`] and
/// surfaced on events.
pub type Peer = Arc<dyn PeerStateMachine>;
