//! Parses the property byte of every incoming datagram and routes it.

use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::event::{Event, UnconnectedMessageType};
use crate::negotiator::ConnectionNegotiator;
use crate::packet::{DeliveryMethod, PacketProperty};
use crate::peer::DisconnectResult;
use crate::shared::Shared;
use crate::time::LocalTime;

fn delivery_method_for(property: PacketProperty) -> Option<DeliveryMethod> {
    match property {
        PacketProperty::Unreliable => Some(DeliveryMethod::Unreliable),
        PacketProperty::ReliableUnordered => Some(DeliveryMethod::ReliableUnordered),
        PacketProperty::ReliableOrdered => Some(DeliveryMethod::ReliableOrdered),
        PacketProperty::Sequenced => Some(DeliveryMethod::Sequenced),
        PacketProperty::ReliableSequenced => Some(DeliveryMethod::ReliableSequenced),
        _ => None,
    }
}

/// Stateless entry point for the receive path: parses, classifies, and routes one datagram.
pub struct Demultiplexer;

impl Demultiplexer {
    /// Handle the failure of the receive syscall itself: every existing peer is torn down
    /// without individual `Disconnect` events, per the documented (not accidental) design choice.
    pub fn handle_socket_error(shared: &Shared, error_code: i32) {
        shared.table.clear();
        shared.emit(Event::Error {
            remote_endpoint: None,
            error_code,
        });
    }

    /// Handle one datagram already known to have passed loss/latency simulation.
    pub fn handle_datagram(shared: &Shared, bytes: &[u8], remote: SocketAddr) {
        let mut packet = shared.pool.get_packet(bytes.len(), false);
        packet.fill_from(bytes);

        let property = match packet.property() {
            Some(p) => p,
            None => {
                trace!(?remote, "dropping datagram with unrecognized property byte");
                shared.pool.recycle(packet);
                return;
            }
        };

        shared.stats.record_received(packet.size());
        let peer = shared.table.try_get(remote);
        let now = LocalTime::now();

        match property {
            PacketProperty::DiscoveryRequest => {
                if shared.config.discovery_enabled {
                    shared.emit(Event::ReceiveUnconnected {
                        remote_endpoint: remote,
                        packet,
                        message_type: UnconnectedMessageType::DiscoveryRequest,
                    });
                } else {
                    shared.pool.recycle(packet);
                }
            }
            PacketProperty::DiscoveryResponse => {
                shared.emit(Event::ReceiveUnconnected {
                    remote_endpoint: remote,
                    packet,
                    message_type: UnconnectedMessageType::DiscoveryResponse,
                });
            }
            PacketProperty::UnconnectedMessage => {
                if shared.config.unconnected_messages_enabled {
                    shared.emit(Event::ReceiveUnconnected {
                        remote_endpoint: remote,
                        packet,
                        message_type: UnconnectedMessageType::BasicMessage,
                    });
                } else {
                    shared.pool.recycle(packet);
                }
            }
            PacketProperty::NatIntroductionRequest
            | PacketProperty::NatIntroduction
            | PacketProperty::NatPunchMessage => {
                if shared.config.nat_punch_enabled {
                    // NAT traversal is an external collaborator; this core only gates delivery.
                    debug!(?remote, ?property, "nat punch packet ignored: no nat module installed");
                }
                shared.pool.recycle(packet);
            }
            PacketProperty::Disconnect => {
                if let Some(peer) = &peer {
                    let result = peer.process_disconnect(&packet);
                    match result {
                        DisconnectResult::Disconnect => {
                            shared.mark_disconnected();
                            shared.table.remove_peer(peer);
                            shared.emit(Event::Disconnect {
                                peer: peer.clone(),
                                reason: crate::peer::DisconnectReason::RemoteConnectionClose,
                                additional_data: packet.payload().to_vec(),
                                socket_error_code: None,
                            });
                        }
                        DisconnectResult::Rejected => {
                            shared.table.remove_peer(peer);
                            shared.emit(Event::Disconnect {
                                peer: peer.clone(),
                                reason: crate::peer::DisconnectReason::ConnectionRejected,
                                additional_data: packet.payload().to_vec(),
                                socket_error_code: None,
                            });
                        }
                        DisconnectResult::None => {}
                    }
                }
                // Always answered, even for an endpoint with no peer record: this lets a remote
                // that already tore down its local state stop retrying immediately. Documented
                // as a deliberate, security-relevant tradeoff (it confirms the socket is live).
                shared.send_shutdown_ok(remote);
                shared.pool.recycle(packet);
            }
            PacketProperty::ConnectAccept => {
                if let Some(peer) = &peer {
                    if peer.process_connect_accept(&packet) {
                        shared.mark_connected();
                        shared.emit(Event::Connect(peer.clone()));
                    }
                }
                shared.pool.recycle(packet);
            }
            PacketProperty::ConnectRequest => {
                ConnectionNegotiator::handle_connect_request(shared, remote, &packet, peer.clone());
                shared.pool.recycle(packet);
            }
            other => {
                if let Some(peer) = &peer {
                    peer.touch(now);
                    peer.process_packet(&packet);
                    if let Some(delivery_method) = delivery_method_for(other) {
                        shared.emit(Event::Receive {
                            peer: peer.clone(),
                            packet,
                            delivery_method,
                        });
                    } else {
                        shared.pool.recycle(packet);
                    }
                } else {
                    shared.pool.recycle(packet);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::event::UnconnectedMessageType;
    use crate::packet::PacketProperty;
    use crate::peer::{ConnectionState, DisconnectReason, Peer, SimplePeerStateMachine};
    use crate::socket::tests::LoopbackSocket;
    use std::sync::Arc;

    struct NullListener;
    impl crate::event::NetEventListener for NullListener {
        fn on_peer_connected(&self, _: &Peer) {}
        fn on_peer_disconnected(&self, _: &Peer, _: DisconnectReason, _: &[u8], _: Option<i32>) {}
        fn on_network_receive(&self, _: &Peer, _: &crate::packet::Packet, _: DeliveryMethod) {}
        fn on_network_receive_unconnected(
            &self,
            _: SocketAddr,
            _: &crate::packet::Packet,
            _: UnconnectedMessageType,
        ) {
        }
        fn on_network_error(&self, _: Option<SocketAddr>, _: i32) {}
        fn on_network_latency_update(&self, _: &Peer, _: u64) {}
        fn on_connection_request(&self, _: &crate::event::ConnectionRequest) {}
    }

    fn shared_with(config: Config) -> Arc<Shared> {
        Shared::new(config, Arc::new(LoopbackSocket::default()), Arc::new(NullListener))
    }

    fn shared_for_test() -> Arc<Shared> {
        shared_with(Config::default())
    }

    fn shared_with_socket(config: Config) -> (Arc<Shared>, Arc<LoopbackSocket>) {
        let socket = Arc::new(LoopbackSocket::default());
        let shared = Shared::new(config, socket.clone(), Arc::new(NullListener));
        (shared, socket)
    }

    fn peer_in(shared: &Shared, port: u16, state: ConnectionState) -> Peer {
        let peer: Peer = Arc::new(SimplePeerStateMachine::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            shared.socket.clone(),
            state,
            1,
            0,
            LocalTime::now(),
        ));
        shared.table.try_add(peer.clone());
        if state == ConnectionState::Connected {
            shared.mark_connected();
        }
        peer
    }

    fn raw(property: PacketProperty, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![property.as_byte()];
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn unrecognized_property_byte_is_dropped_without_event() {
        let shared = shared_for_test();
        let remote: SocketAddr = "127.0.0.1:9700".parse().unwrap();
        Demultiplexer::handle_datagram(&shared, &[0xFE, 1, 2], remote);
        assert!(shared.events.drain().is_empty());
        assert_eq!(shared.pool.idle_count(), 1);
    }

    #[test]
    fn nat_packet_is_always_swallowed_regardless_of_config() {
        for nat_punch_enabled in [false, true] {
            let mut config = Config::default();
            config.nat_punch_enabled = nat_punch_enabled;
            let shared = shared_with(config);
            let remote: SocketAddr = "127.0.0.1:9701".parse().unwrap();

            Demultiplexer::handle_datagram(&shared, &raw(PacketProperty::NatPunchMessage, &[]), remote);

            assert!(shared.events.drain().is_empty());
            assert_eq!(shared.pool.idle_count(), 1);
        }
    }

    #[test]
    fn unconnected_message_gated_by_config() {
        let shared = shared_for_test();
        let remote: SocketAddr = "127.0.0.1:9702".parse().unwrap();
        Demultiplexer::handle_datagram(&shared, &raw(PacketProperty::UnconnectedMessage, b"hi"), remote);
        assert!(shared.events.drain().is_empty());

        let mut config = Config::default();
        config.unconnected_messages_enabled = true;
        let shared = shared_with(config);
        Demultiplexer::handle_datagram(&shared, &raw(PacketProperty::UnconnectedMessage, b"hi"), remote);
        let events = shared.events.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::ReceiveUnconnected { message_type, packet, .. } => {
                assert_eq!(*message_type, UnconnectedMessageType::BasicMessage);
                assert_eq!(packet.payload(), b"hi");
            }
            _ => panic!("expected ReceiveUnconnected event"),
        }
    }

    #[test]
    fn discovery_request_gated_by_config() {
        let shared = shared_for_test();
        let remote: SocketAddr = "127.0.0.1:9703".parse().unwrap();
        Demultiplexer::handle_datagram(&shared, &raw(PacketProperty::DiscoveryRequest, &[]), remote);
        assert!(shared.events.drain().is_empty());

        let mut config = Config::default();
        config.discovery_enabled = true;
        let shared = shared_with(config);
        Demultiplexer::handle_datagram(&shared, &raw(PacketProperty::DiscoveryRequest, &[]), remote);
        let events = shared.events.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Event::ReceiveUnconnected {
                message_type: UnconnectedMessageType::DiscoveryRequest,
                ..
            }
        ));
    }

    #[test]
    fn disconnect_on_connected_peer_tears_down_and_replies_shutdown_ok() {
        let (shared, socket) = shared_with_socket(Config::default());
        let remote: SocketAddr = "127.0.0.1:9704".parse().unwrap();
        peer_in(&shared, 9704, ConnectionState::Connected);

        Demultiplexer::handle_datagram(&shared, &raw(PacketProperty::Disconnect, &[]), remote);

        assert_eq!(shared.connected_peers_count(), 0);
        assert!(shared.table.try_get(remote).is_none());
        let events = shared.events.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Disconnect { reason, .. } => assert_eq!(*reason, DisconnectReason::RemoteConnectionClose),
            _ => panic!("expected Disconnect event"),
        }
        let sent = socket.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, vec![PacketProperty::ShutdownOk.as_byte()]);
    }

    #[test]
    fn disconnect_on_in_progress_peer_is_rejected() {
        let shared = shared_for_test();
        let remote: SocketAddr = "127.0.0.1:9705".parse().unwrap();
        peer_in(&shared, 9705, ConnectionState::OutgoingInProgress);

        Demultiplexer::handle_datagram(&shared, &raw(PacketProperty::Disconnect, &[]), remote);

        assert!(shared.table.try_get(remote).is_none());
        let events = shared.events.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Disconnect { reason, .. } => assert_eq!(*reason, DisconnectReason::ConnectionRejected),
            _ => panic!("expected Disconnect event"),
        }
    }

    #[test]
    fn disconnect_from_unknown_endpoint_emits_no_event_but_still_answers() {
        let (shared, socket) = shared_with_socket(Config::default());
        let remote: SocketAddr = "127.0.0.1:9706".parse().unwrap();

        Demultiplexer::handle_datagram(&shared, &raw(PacketProperty::Disconnect, &[]), remote);

        assert!(shared.events.drain().is_empty());
        assert_eq!(socket.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn connect_accept_completes_handshake_and_emits_connect() {
        let shared = shared_for_test();
        let remote: SocketAddr = "127.0.0.1:9707".parse().unwrap();
        peer_in(&shared, 9707, ConnectionState::OutgoingInProgress);

        Demultiplexer::handle_datagram(&shared, &raw(PacketProperty::ConnectAccept, &[]), remote);

        assert_eq!(shared.connected_peers_count(), 1);
        let events = shared.events.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Connect(_)));
    }

    #[test]
    fn user_data_is_forwarded_to_a_connected_peer() {
        let shared = shared_for_test();
        let remote: SocketAddr = "127.0.0.1:9708".parse().unwrap();
        peer_in(&shared, 9708, ConnectionState::Connected);

        Demultiplexer::handle_datagram(&shared, &raw(PacketProperty::Unreliable, &[1, 2, 3]), remote);

        let events = shared.events.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Receive { packet, delivery_method, .. } => {
                assert_eq!(packet.payload(), &[1, 2, 3]);
                assert_eq!(*delivery_method, DeliveryMethod::Unreliable);
            }
            _ => panic!("expected Receive event"),
        }
    }

    #[test]
    fn user_data_from_unknown_endpoint_is_dropped() {
        let shared = shared_for_test();
        let remote: SocketAddr = "127.0.0.1:9709".parse().unwrap();

        Demultiplexer::handle_datagram(&shared, &raw(PacketProperty::Unreliable, &[1]), remote);

        assert!(shared.events.drain().is_empty());
    }
}
