//! Wire protocol and the threading primitives underneath every connection.
//!
//! # Overview
//!
//! Peers exchange frames over a byte stream (plain TCP or a TLS session).
//! Nothing else is negotiated: there is no version byte, no checksum and no
//! padding, so both sides must agree on the format below.
//!
//! # Binary Format
//!
//! - A fixed 5 byte header: the packet type (1 byte) followed by the payload
//!   length (4 bytes, big-endian).
//! - Exactly `length` bytes of payload. Zero is valid.
//!
//! Headers are encoded with `bincode` using big-endian, fixed-width integers,
//! which yields exactly this layout. [`FrameDecoder`] reassembles frames from
//! reads of any size, so it is agnostic to how the stream fragments them.
//!
//! # Key Components
//!
//! - [`encode_frame`] / [`FrameDecoder`]: the frame codec.
//! - [`BoundedQueue`]: semaphore-pair queue between network and application threads.
//! - [`CancelToken`]: cooperative shutdown flag checked at every blocking point.
//! - [`Worker`]: named thread that can be stopped from anywhere, including itself.
//! - [`readiness::wait`]: bounded wait for a socket to become readable or writable.
mod cancel;
mod frame;
mod queue;
pub mod readiness;
mod semaphore;
mod thread;

pub use cancel::CancelToken;
pub use frame::{Decoded, FrameDecoder, FrameHeader, HEADER_LEN, encode_frame};
pub use queue::{BoundedQueue, DrainError, PushError};
pub use semaphore::{AcquireError, Semaphore};
pub use thread::Worker;
