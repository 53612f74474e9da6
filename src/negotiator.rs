//! Resolves the identity of an incoming `ConnectRequest` against any existing peer record.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::event::{ConnectionRequest, ConnectionRequestType, Event};
use crate::packet::Packet;
use crate::peer::{
    ConnectRequestResult, ConnectionState, Peer, DisconnectReason, SimplePeerStateMachine,
};
use crate::shared::Shared;
use crate::time::LocalTime;

const HEADER_LEN: usize = 9;

struct ConnectRequestPayload<'a> {
    connection_id: u64,
    connection_number: u8,
    data: &'a [u8],
}

fn parse(packet: &Packet) -> Option<ConnectRequestPayload<'_>> {
    let payload = packet.payload();
    if payload.len() < HEADER_LEN {
        return None;
    }
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&payload[0..8]);
    Some(ConnectRequestPayload {
        connection_id: u64::from_le_bytes(id_bytes),
        connection_number: payload[8],
        data: &payload[HEADER_LEN..],
    })
}

pub struct ConnectionNegotiator;

impl ConnectionNegotiator {
    pub fn handle_connect_request(
        shared: &Shared,
        remote: SocketAddr,
        packet: &Packet,
        existing: Option<Peer>,
    ) {
        let Some(request) = parse(packet) else {
            debug!(?remote, "malformed ConnectRequest, dropping");
            return;
        };

        let connection_number = match existing {
            Some(peer) => {
                match peer.process_connect_request(request.connection_id, request.connection_number) {
                    ConnectRequestResult::None => return,
                    ConnectRequestResult::P2PConnection => {
                        shared.emit(Event::ConnectionRequest(ConnectionRequest::new(
                            peer,
                            shared.arc(),
                            request.connection_id,
                            request.connection_number,
                            ConnectionRequestType::PeerToPeer,
                            request.data.to_vec(),
                        )));
                        return;
                    }
                    ConnectRequestResult::Reconnection => {
                        shared.mark_disconnected();
                        shared.table.remove_peer(&peer);
                        shared.emit(Event::Disconnect {
                            peer: peer.clone(),
                            reason: DisconnectReason::RemoteConnectionClose,
                            additional_data: Vec::new(),
                            socket_error_code: None,
                        });
                        peer.connection_num().wrapping_add(1)
                    }
                    ConnectRequestResult::NewConnection => {
                        shared.table.remove_peer(&peer);
                        peer.connection_num().wrapping_add(1)
                    }
                }
            }
            None => request.connection_number,
        };

        let new_peer: Peer = Arc::new(SimplePeerStateMachine::new(
            remote,
            shared.socket.clone(),
            ConnectionState::IncomingInProgress,
            request.connection_id,
            connection_number,
            LocalTime::now(),
        ));

        let resident = shared.table.try_add(new_peer.clone());
        if Arc::ptr_eq(&resident, &new_peer) {
            shared.emit(Event::ConnectionRequest(ConnectionRequest::new(
                resident,
                shared.arc(),
                request.connection_id,
                connection_number,
                ConnectionRequestType::Incoming,
                request.data.to_vec(),
            )));
        }
    }
}
