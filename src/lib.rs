//! Connection-oriented reliable message transport over UDP.
//!
//! [`manager::NetManager`] is the facade: it owns the socket, the peer table, and the event
//! queue, and drives a dedicated logic-tick thread alongside the socket-receive thread. The
//! per-peer reliability layer and the raw socket are external collaborators, described by the
//! [`peer::PeerStateMachine`] and [`socket::NetSocket`] traits respectively.

pub mod config;
pub mod debug_sim;
pub mod demux;
pub mod error;
pub mod event;
pub mod logic_tick;
pub mod manager;
pub mod negotiator;
pub mod packet;
pub mod peer;
pub mod peer_table;
mod shared;
pub mod socket;
pub mod stats;
pub mod time;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

pub use config::Config;
pub use error::Error;
pub use event::{
    ConnectionRequest, ConnectionRequestType, Event, NetEventListener, UnconnectedMessageType,
};
pub use manager::NetManager;
pub use packet::{DeliveryMethod, PacketProperty};
pub use peer::{ConnectionState, ConnectionStateMask, DisconnectReason, Peer, PeerStateMachine};
pub use socket::NetSocket;
pub use stats::{NetStatistics, StatisticsSnapshot};
