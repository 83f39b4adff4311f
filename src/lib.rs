pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod packet;
pub mod protocol;
pub mod server;
pub mod tls;

pub use client::ClientSocket;
pub use config::{ClientTrust, ServerIdentity, TlsSettings, TransportConfig};
pub use connection::{Connection, ConnectionState, Role, Transport};
pub use error::TransportError;
pub use packet::{ConnectionId, Incoming, Packet, PacketLength, PacketType, types};
pub use server::{Registry, ServerSocket};
pub use tls::TlsContexts;
