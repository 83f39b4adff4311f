//! Application-level packets.
//!
//! A [`Packet`] is the unit handed between network threads and application
//! threads: a one-byte type tag, a payload of at most `u32::MAX` bytes, and
//! (for packets read off the wire) the [`ConnectionId`] of the connection that
//! produced it.
//!
//! # Origins
//!
//! The origin is a handle, not a reference. It stays valid only while its
//! connection is registered; once the registry removes the connection the slot
//! generation moves on and every lookup with the old handle misses. Use
//! [`ServerSocket::connection`](crate::ServerSocket::connection) or
//! [`ServerSocket::reply`](crate::ServerSocket::reply) to act on an origin.
use std::fmt::{self, Write};

use crate::error::TransportError;

pub type PacketType = u8;
pub type PacketLength = u32;

// The wire header stores the length in exactly four bytes.
const _: () = assert!(size_of::<PacketLength>() == 4);

/// Base packet types shared with every peer.
pub mod types {
    use super::PacketType;

    pub const LOG_MESSAGE: PacketType = 0;
    pub const CONNECTION_REQUESTED: PacketType = 1;
    pub const CONNECTION_ACCEPTED: PacketType = 2;
    pub const CONNECTION_REFUSED: PacketType = 3;
    pub const ERROR: PacketType = 4;
    pub const INTERRUPTED: PacketType = 5;
    /// Receiving this type terminates the connection; it is never delivered.
    pub const DISCONNECTED: PacketType = 6;
    /// First type free for application use.
    pub const APPLICATION_BASE: PacketType = 7;
}

/// Generational handle to a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketType,
    payload: Vec<u8>,
    origin: Option<ConnectionId>,
}

impl Packet {
    /// Builds an outbound packet.
    pub fn new(kind: PacketType, payload: impl Into<Vec<u8>>) -> Result<Self, TransportError> {
        let payload = payload.into();
        if PacketLength::try_from(payload.len()).is_err() {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            kind,
            payload,
            origin: None,
        })
    }

    /// Packet decoded from the wire by the connection `origin`.
    pub(crate) fn received(origin: ConnectionId, kind: PacketType, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            origin: Some(origin),
        }
    }

    pub fn kind(&self) -> PacketType {
        self.kind
    }

    pub fn length(&self) -> PacketLength {
        // Bounded by construction.
        self.payload.len() as PacketLength
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Connection that produced this packet, `None` for locally built packets.
    pub fn origin(&self) -> Option<ConnectionId> {
        self.origin
    }

    /// Classic 16-bytes-per-row hex dump of the payload, for trace logging.
    pub fn hexdump(&self) -> String {
        let mut out = String::new();
        for (row, chunk) in self.payload.chunks(16).enumerate() {
            let _ = write!(out, "{:08x}  ", row * 16);
            for i in 0..16 {
                match chunk.get(i) {
                    Some(b) => {
                        let _ = write!(out, "{b:02x} ");
                    }
                    None => out.push_str("   "),
                }
            }
            out.push(' ');
            out.extend(chunk.iter().map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            }));
            out.push('\n');
        }
        out
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("length", &self.length())
            .field("origin", &self.origin)
            .finish()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Some(origin) => write!(f, "Packet - Origin: {origin}")?,
            None => write!(f, "Packet - Origin: local")?,
        }
        write!(f, "  Type: {}  Length: {}", self.kind, self.length())
    }
}

/// What a consumer of an inbound queue receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Packet(Packet),
    /// Shutdown sentinel: the connection terminated and will produce nothing
    /// more. Exactly one is queued per connection termination.
    Closed(ConnectionId),
}
