//! Length-prefixed message framing for conn.
//!
//! Byte-stream transports have no native message boundaries. This crate turns
//! an undifferentiated stream into discrete application messages so that a
//! stream socket can be driven through the generic read-one-unit /
//! write-one-unit primitives of a session.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 length (BE)      | number of payload bytes    |
//! +----------------------+----------------------------+
//! | payload              | exactly `length` bytes     |
//! +----------------------+----------------------------+
//! ```
//!
//! A length of zero or above [`MAX_PAYLOAD_SIZE`] is a protocol violation and
//! is fatal for the connection that produced it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;

// Re-export main types
pub use codec::{read_frame, write_frame};
pub use error::WireError;
pub use frame::{encode, validate_len, FrameDecoder, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE};
