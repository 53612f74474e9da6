//! State shared between the socket-receive thread, the logic-tick thread, and user threads.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::config::Config;
use crate::debug_sim::DebugDelayQueue;
use crate::event::{dispatch, Event, EventQueue, NetEventListener};
use crate::packet::PacketPool;
use crate::peer_table::PeerTable;
use crate::socket::NetSocket;
use crate::stats::NetStatistics;

/// Everything the demultiplexer, negotiator, and logic tick need concurrent access to.
///
/// Held behind a single `Arc` and cloned into each background thread's closure; every field is
/// independently synchronized (or atomic), so no field of `Shared` itself needs an outer lock.
pub struct Shared {
    pub config: Config,
    pub pool: PacketPool,
    pub table: PeerTable,
    pub events: EventQueue,
    pub stats: NetStatistics,
    pub delay_queue: DebugDelayQueue,
    pub connected_peers_count: AtomicUsize,
    pub socket: Arc<dyn NetSocket>,
    pub listener: Arc<dyn NetEventListener>,
    next_connection_id: AtomicU64,
    pub running: AtomicBool,
    self_weak: Weak<Shared>,
}

impl Shared {
    pub fn new(config: Config, socket: Arc<dyn NetSocket>, listener: Arc<dyn NetEventListener>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            pool: PacketPool::new(512),
            table: PeerTable::new(),
            events: EventQueue::new(4096),
            stats: NetStatistics::new(),
            delay_queue: DebugDelayQueue::new(),
            connected_peers_count: AtomicUsize::new(0),
            socket,
            listener,
            next_connection_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            self_weak: weak.clone(),
            config,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// An owned `Arc` handle to this same shared state, for building objects (like
    /// [`crate::event::ConnectionRequest`]) that must outlive the call that constructs them.
    pub fn arc(&self) -> Arc<Shared> {
        self.self_weak.upgrade().expect("shared dropped while still in use")
    }

    /// Allocate a fresh 64-bit connection id for a new outgoing handshake.
    pub fn allocate_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver `event` per `config.unsynced_events`: either queued for `poll_events`, or
    /// dispatched synchronously on the calling (producer) thread.
    pub fn emit(&self, event: Event) {
        if self.config.unsynced_events {
            dispatch(self.listener.as_ref(), event, &self.pool, self.config.auto_recycle);
        } else {
            self.events.enqueue(event);
        }
    }

    pub fn mark_connected(&self) {
        self.connected_peers_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_disconnected(&self) {
        self.connected_peers_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connected_peers_count(&self) -> usize {
        self.connected_peers_count.load(Ordering::Relaxed)
    }

    pub fn send_shutdown_ok(&self, endpoint: SocketAddr) {
        let _ = self
            .socket
            .send_to(&[crate::packet::PacketProperty::ShutdownOk.as_byte()], endpoint);
    }

    /// React to a failed send to `peer`, per the §7 socket-send-error taxonomy.
    ///
    /// `MessageSize` is logged and dropped; `HostUnreachable`/`ConnectionReset` tear `peer` down
    /// with `SocketSendError`/`RemoteConnectionClose` respectively; anything else is surfaced as
    /// a plain `Error` event without touching the peer record.
    pub fn handle_send_failure(&self, peer: &crate::peer::Peer, err: &crate::error::Error) {
        use crate::error::SendFailure;
        use crate::peer::DisconnectReason;

        match err.classify_send_failure() {
            SendFailure::MessageSize => {
                tracing::debug!(endpoint = %peer.endpoint(), "outbound datagram exceeded message size, dropping");
            }
            SendFailure::HostUnreachable | SendFailure::ConnectionReset => {
                let reason = if matches!(err.classify_send_failure(), SendFailure::HostUnreachable) {
                    DisconnectReason::SocketSendError
                } else {
                    DisconnectReason::RemoteConnectionClose
                };
                if peer.connection_state() == crate::peer::ConnectionState::Connected {
                    self.mark_disconnected();
                }
                self.table.remove_peer(peer);
                self.emit(Event::Disconnect {
                    peer: peer.clone(),
                    reason,
                    additional_data: Vec::new(),
                    socket_error_code: None,
                });
            }
            SendFailure::Other(code) => {
                self.emit(Event::Error {
                    remote_endpoint: Some(peer.endpoint()),
                    error_code: code,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::peer::{ConnectionState, SimplePeerStateMachine};
    use crate::socket::tests::LoopbackSocket;
    use crate::time::LocalTime;
    use std::io;

    struct NullListener;
    impl NetEventListener for NullListener {
        fn on_peer_connected(&self, _: &crate::peer::Peer) {}
        fn on_peer_disconnected(
            &self,
            _: &crate::peer::Peer,
            _: crate::peer::DisconnectReason,
            _: &[u8],
            _: Option<i32>,
        ) {
        }
        fn on_network_receive(&self, _: &crate::peer::Peer, _: &crate::packet::Packet, _: crate::packet::DeliveryMethod) {}
        fn on_network_receive_unconnected(
            &self,
            _: SocketAddr,
            _: &crate::packet::Packet,
            _: crate::event::UnconnectedMessageType,
        ) {
        }
        fn on_network_error(&self, _: Option<SocketAddr>, _: i32) {}
        fn on_network_latency_update(&self, _: &crate::peer::Peer, _: u64) {}
        fn on_connection_request(&self, _: &crate::event::ConnectionRequest) {}
    }

    fn shared_for_test() -> Arc<Shared> {
        Shared::new(
            Config::default(),
            Arc::new(LoopbackSocket::default()),
            Arc::new(NullListener),
        )
    }

    fn connected_peer(shared: &Shared, port: u16) -> crate::peer::Peer {
        let peer: crate::peer::Peer = Arc::new(SimplePeerStateMachine::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            shared.socket.clone(),
            ConnectionState::Connected,
            1,
            0,
            LocalTime::now(),
        ));
        shared.table.try_add(peer.clone());
        shared.mark_connected();
        peer
    }

    #[test]
    fn host_unreachable_tears_down_with_socket_send_error() {
        let shared = shared_for_test();
        let peer = connected_peer(&shared, 9600);

        shared.handle_send_failure(&peer, &Error::Io(io::Error::from_raw_os_error(113)));

        assert_eq!(shared.connected_peers_count(), 0);
        assert!(shared.table.try_get(peer.endpoint()).is_none());
        let events = shared.events.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Disconnect { reason, .. } => {
                assert_eq!(*reason, crate::peer::DisconnectReason::SocketSendError)
            }
            _ => panic!("expected Disconnect event"),
        }
    }

    #[test]
    fn message_size_is_dropped_without_teardown() {
        let shared = shared_for_test();
        let peer = connected_peer(&shared, 9601);

        shared.handle_send_failure(&peer, &Error::Io(io::Error::from_raw_os_error(90)));

        assert_eq!(shared.connected_peers_count(), 1);
        assert!(shared.table.try_get(peer.endpoint()).is_some());
        assert!(shared.events.drain().is_empty());
    }

    #[test]
    fn unrecognized_errno_surfaces_as_error_event() {
        let shared = shared_for_test();
        let peer = connected_peer(&shared, 9602);

        shared.handle_send_failure(&peer, &Error::Io(io::Error::from_raw_os_error(42)));

        assert_eq!(shared.connected_peers_count(), 1);
        assert!(shared.table.try_get(peer.endpoint()).is_some());
        let events = shared.events.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Error { .. }));
    }
}
