//! Mock doubles for the two external-collaborator traits, behind the `mocks` feature.

use std::net::SocketAddr;

use mockall::mock;

use crate::error::Error;
use crate::packet::{DeliveryMethod, Packet};
use crate::peer::{ConnectRequestResult, ConnectionState, DisconnectResult};
use crate::socket::NetSocket;

mock! {
    pub NetSocket {}

    impl NetSocket for NetSocket {
        fn bind(&self, v4: bool, v6: bool, port: u16, reuse_address: bool) -> Result<bool, Error>;
        fn send_to(&self, bytes: &[u8], endpoint: SocketAddr) -> Result<usize, Error>;
        fn send_broadcast(&self, bytes: &[u8], port: u16) -> Result<bool, Error>;
        fn close(&self);
        fn local_port(&self) -> Option<u16>;
        fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error>;
    }
}

mock! {
    pub PeerStateMachine {}

    impl crate::peer::PeerStateMachine for PeerStateMachine {
        fn update(&self, elapsed_ms: u64);
        fn process_packet(&self, packet: &Packet);
        fn process_connect_request(&self, connection_id: u64, connection_number: u8) -> ConnectRequestResult;
        fn process_connect_accept(&self, packet: &Packet) -> bool;
        fn process_disconnect(&self, packet: &Packet) -> DisconnectResult;
        fn accept(&self, connection_id: u64, connection_number: u8);
        fn reject(&self, connection_id: u64, connection_number: u8, data: &[u8]);
        fn shutdown(&self, data: &[u8], force: bool) -> bool;
        fn send(&self, data: &[u8], method: DeliveryMethod) -> Result<usize, Error>;
        fn flush(&self);
        fn connection_state(&self) -> ConnectionState;
        fn connect_id(&self) -> u64;
        fn connection_num(&self) -> u8;
        fn endpoint(&self) -> SocketAddr;
        fn time_since_last_packet(&self, now: crate::time::LocalTime) -> u64;
        fn touch(&self, now: crate::time::LocalTime);
        fn mark_timed_out(&self) -> bool;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_net_socket_constructs() {
        let mut mock = MockNetSocket::new();
        mock.expect_local_port().return_const(None);
        assert_eq!(mock.local_port(), None);
    }

    #[test]
    fn mock_peer_state_machine_constructs() {
        let mut mock = MockPeerStateMachine::new();
        mock.expect_connection_state()
            .return_const(ConnectionState::Connected);
        assert_eq!(mock.connection_state(), ConnectionState::Connected);
    }
}
