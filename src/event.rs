//! The event model and the queue that carries it from producer threads to `poll_events`.

use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::warn;

use crate::packet::{DeliveryMethod, Packet, PacketPool};
use crate::peer::{DisconnectReason, Peer};
use crate::shared::Shared;

/// Tag carried on [`Event::ReceiveUnconnected`], distinguishing plain unconnected messages from
/// discovery traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnconnectedMessageType {
    BasicMessage,
    DiscoveryRequest,
    DiscoveryResponse,
}

/// Whether an incoming handshake arrived as a normal inbound connection or as the losing half of
/// a simultaneous peer-to-peer handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRequestType {
    Incoming,
    PeerToPeer,
}

/// A capability handed to the listener for an incoming (or peer-to-peer) handshake.
///
/// The listener must call exactly one of [`ConnectionRequest::accept`] /
/// [`ConnectionRequest::reject`].
pub struct ConnectionRequest {
    peer: Peer,
    shared: Arc<Shared>,
    connection_id: u64,
    connection_number: u8,
    request_type: ConnectionRequestType,
    payload: Vec<u8>,
}

impl ConnectionRequest {
    pub(crate) fn new(
        peer: Peer,
        shared: Arc<Shared>,
        connection_id: u64,
        connection_number: u8,
        request_type: ConnectionRequestType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            peer,
            shared,
            connection_id,
            connection_number,
            request_type,
            payload,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn connection_number(&self) -> u8 {
        self.connection_number
    }

    pub fn request_type(&self) -> ConnectionRequestType {
        self.request_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Accept the handshake: completes the peer's handshake and emits `Connect`.
    pub fn accept(&self) {
        self.peer.accept(self.connection_id, self.connection_number);
        self.shared.mark_connected();
        self.shared.emit(Event::Connect(self.peer.clone()));
    }

    /// Reject the handshake, optionally carrying a reason payload back to the remote.
    ///
    /// No event is emitted locally; the remote learns of the rejection from the `Disconnect`
    /// datagram this sends, surfaced on its side as `Disconnect(reason = ConnectionRejected)`.
    pub fn reject(&self, data: &[u8]) {
        self.peer
            .reject(self.connection_id, self.connection_number, data);
    }
}

/// A unit of work delivered to the listener.
pub enum Event {
    Connect(Peer),
    Disconnect {
        peer: Peer,
        reason: DisconnectReason,
        additional_data: Vec<u8>,
        socket_error_code: Option<i32>,
    },
    Receive {
        peer: Peer,
        packet: Packet,
        delivery_method: DeliveryMethod,
    },
    ReceiveUnconnected {
        remote_endpoint: SocketAddr,
        packet: Packet,
        message_type: UnconnectedMessageType,
    },
    Error {
        remote_endpoint: Option<SocketAddr>,
        error_code: i32,
    },
    LatencyUpdate {
        peer: Peer,
        latency_ms: u64,
    },
    ConnectionRequest(ConnectionRequest),
}

/// The seven callbacks the transport core invokes on received events.
///
/// `poll_events`/unsynced dispatch call exactly one of these per [`Event`].
pub trait NetEventListener: Send + Sync {
    fn on_peer_connected(&self, peer: &Peer);
    fn on_peer_disconnected(
        &self,
        peer: &Peer,
        reason: DisconnectReason,
        additional_data: &[u8],
        socket_error_code: Option<i32>,
    );
    fn on_network_receive(&self, peer: &Peer, packet: &Packet, delivery_method: DeliveryMethod);
    fn on_network_receive_unconnected(
        &self,
        remote_endpoint: SocketAddr,
        packet: &Packet,
        message_type: UnconnectedMessageType,
    );
    fn on_network_error(&self, remote_endpoint: Option<SocketAddr>, error_code: i32);
    fn on_network_latency_update(&self, peer: &Peer, latency_ms: u64);
    fn on_connection_request(&self, request: &ConnectionRequest);
}

/// Dispatch one event to the matching listener callback, then recycle any attached packet.
pub fn dispatch(listener: &dyn NetEventListener, event: Event, pool: &PacketPool, auto_recycle: bool) {
    match event {
        Event::Connect(peer) => listener.on_peer_connected(&peer),
        Event::Disconnect {
            peer,
            reason,
            additional_data,
            socket_error_code,
        } => listener.on_peer_disconnected(&peer, reason, &additional_data, socket_error_code),
        Event::Receive {
            peer,
            packet,
            delivery_method,
        } => {
            listener.on_network_receive(&peer, &packet, delivery_method);
            if auto_recycle {
                pool.recycle(packet);
            }
        }
        Event::ReceiveUnconnected {
            remote_endpoint,
            packet,
            message_type,
        } => {
            listener.on_network_receive_unconnected(remote_endpoint, &packet, message_type);
            if auto_recycle {
                pool.recycle(packet);
            }
        }
        Event::Error {
            remote_endpoint,
            error_code,
        } => listener.on_network_error(remote_endpoint, error_code),
        Event::LatencyUpdate { peer, latency_ms } => {
            listener.on_network_latency_update(&peer, latency_ms)
        }
        Event::ConnectionRequest(request) => listener.on_connection_request(&request),
    }
}

/// Bounded producer/consumer queue of [`Event`]s.
///
/// Under `Config::unsynced_events`, callers bypass this queue entirely and invoke [`dispatch`]
/// directly on the producing thread instead of calling [`EventQueue::enqueue`].
pub struct EventQueue {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        Self { sender, receiver }
    }

    /// Enqueue an event. If the queue is full, the event (and any attached packet) is dropped and
    /// a warning is logged, rather than blocking a producer thread indefinitely.
    pub fn enqueue(&self, event: Event) {
        if let Err(TrySendError::Full(_)) = self.sender.try_send(event) {
            warn!("event queue full, dropping event");
        }
    }

    /// Drain all currently available events, in FIFO order.
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketProperty;
    use crate::peer::ConnectionState;
    use crate::socket::tests::LoopbackSocket;
    use crate::time::LocalTime;
    use std::sync::{Arc, Mutex};

    struct RecordingListener {
        connected: Mutex<Vec<SocketAddr>>,
    }

    impl NetEventListener for RecordingListener {
        fn on_peer_connected(&self, peer: &Peer) {
            self.connected.lock().unwrap().push(peer.endpoint());
        }
        fn on_peer_disconnected(&self, _: &Peer, _: DisconnectReason, _: &[u8], _: Option<i32>) {}
        fn on_network_receive(&self, _: &Peer, _: &Packet, _: DeliveryMethod) {}
        fn on_network_receive_unconnected(
            &self,
            _: SocketAddr,
            _: &Packet,
            _: UnconnectedMessageType,
        ) {
        }
        fn on_network_error(&self, _: Option<SocketAddr>, _: i32) {}
        fn on_network_latency_update(&self, _: &Peer, _: u64) {}
        fn on_connection_request(&self, _: &ConnectionRequest) {}
    }

    fn fresh_peer() -> Peer {
        Arc::new(crate::peer::SimplePeerStateMachine::new(
            "127.0.0.1:9100".parse().unwrap(),
            Arc::new(LoopbackSocket::default()),
            ConnectionState::Connected,
            1,
            0,
            LocalTime::now(),
        ))
    }

    #[test]
    fn enqueue_then_drain_preserves_order() {
        let queue = EventQueue::new(8);
        queue.enqueue(Event::Connect(fresh_peer()));
        queue.enqueue(Event::Error {
            remote_endpoint: None,
            error_code: 1,
        });
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], Event::Connect(_)));
        assert!(matches!(drained[1], Event::Error { .. }));
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let queue = EventQueue::new(1);
        queue.enqueue(Event::Error {
            remote_endpoint: None,
            error_code: 1,
        });
        queue.enqueue(Event::Error {
            remote_endpoint: None,
            error_code: 2,
        });
        assert_eq!(queue.drain().len(), 1);
    }

    #[test]
    fn dispatch_recycles_attached_packet() {
        let pool = PacketPool::new(32);
        let packet = pool.get_with_data(PacketProperty::Unreliable, &[9]);
        let listener = RecordingListener {
            connected: Mutex::new(vec![]),
        };
        assert_eq!(pool.idle_count(), 0);
        dispatch(
            &listener,
            Event::Receive {
                peer: fresh_peer(),
                packet,
                delivery_method: DeliveryMethod::Unreliable,
            },
            &pool,
            true,
        );
        assert_eq!(pool.idle_count(), 1);
    }
}
