//! Protocol module - wire format and frame types.
//!
//! Implements the byte-level framing convention shared by synchronous
//! request/response and asynchronous notification messages:
//! - 3-byte header encoding/decoding
//! - command-type / subsystem bit packing
//! - [`Frame`] with typed accessors

mod frame;
mod wire_format;

pub use frame::Frame;
pub use wire_format::{
    CommandType, Header, COMMAND_TYPE_MASK, HEADER_SIZE, MAX_PAYLOAD, SUBSYSTEM_MASK,
};
