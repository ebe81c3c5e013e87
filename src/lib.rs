//! Framed, optionally encrypted messaging over TCP and reliable UDP.
//!
//! A [`server::SocketServer`] accepts connections on a TCP listener and / or a UDP socket, a
//!  [`client::SocketClient`] connects to it. Both sides end up with a [`connection::Connection`]
//!  per peer that performs a handshake per transport leg, and after that exchanges typed packets
//!  (see [`codec`]). Application code observes connections through [`events::ConnectionEvent`]s.

pub mod buffer_pool;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod crypto;
pub mod error;
pub mod events;
pub mod handshake;
pub mod multiplexer;
pub mod registry;
pub mod server;
pub mod structure_type;
pub mod tcp;
pub mod udp;
pub mod util;
pub mod worker;
