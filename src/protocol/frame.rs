//! Frame struct with typed accessors.
//!
//! Represents one complete protocol message: the 3-byte header plus up to
//! 255 payload bytes. Uses `bytes::Bytes` for cheap payload sharing.
//!
//! A `Frame` is caller-owned and transient. The synchronous send path reuses
//! the request frame for its response, so a frame handed to
//! [`Session::send_sync`](crate::Session::send_sync) comes back rewritten in
//! place.
//!
//! # Example
//!
//! ```
//! use npi_spi::protocol::Frame;
//!
//! let frame = Frame::new(0x05, 0x01, vec![0xAA, 0xBB]).unwrap();
//! assert_eq!(frame.subsystem(), 0x05);
//! assert_eq!(frame.opcode(), 0x01);
//! assert_eq!(frame.payload(), &[0xAA, 0xBB]);
//! ```

use bytes::Bytes;

use super::wire_format::{
    CommandType, Header, COMMAND_TYPE_MASK, HEADER_SIZE, MAX_PAYLOAD, SUBSYSTEM_MASK,
};
use crate::error::{NpiError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw command byte: type bits | subsystem bits.
    command: u8,
    /// Extended command / opcode byte.
    opcode: u8,
    /// Payload bytes (at most [`MAX_PAYLOAD`]).
    payload: Bytes,
}

impl Frame {
    /// Create a new frame for the given subsystem and opcode.
    ///
    /// The command-type bits start cleared; the send paths tag the frame
    /// before it goes on the wire. Returns [`NpiError::PayloadTooLarge`] if
    /// the payload does not fit the single length byte.
    pub fn new(subsystem: u8, opcode: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(NpiError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            command: subsystem & SUBSYSTEM_MASK,
            opcode,
            payload,
        })
    }

    /// Create the zero-payload probe frame used to retrieve device-initiated
    /// data.
    pub fn poll() -> Self {
        Self {
            command: CommandType::Poll.bits(),
            opcode: 0,
            payload: Bytes::new(),
        }
    }

    /// Rebuild a frame from a decoded wire header and payload.
    pub(crate) fn from_wire(header: Header, payload: Bytes) -> Self {
        debug_assert_eq!(header.length as usize, payload.len());
        Self {
            command: header.command,
            opcode: header.opcode,
            payload,
        }
    }

    /// The wire header describing this frame.
    pub fn header(&self) -> Header {
        Header::new(self.payload.len() as u8, self.command, self.opcode)
    }

    /// The subsystem bits of the command byte.
    #[inline]
    pub fn subsystem(&self) -> u8 {
        self.command & SUBSYSTEM_MASK
    }

    /// The raw command byte (type bits | subsystem bits).
    #[inline]
    pub fn command(&self) -> u8 {
        self.command
    }

    /// The opcode byte.
    #[inline]
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// The command-type field, if it carries an assigned value.
    #[inline]
    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_command(self.command)
    }

    /// Check if this frame is tagged as an asynchronous request.
    #[inline]
    pub fn is_async_request(&self) -> bool {
        self.command & COMMAND_TYPE_MASK == CommandType::AsyncRequest.bits()
    }

    /// Check if this frame is tagged as a synchronous response.
    #[inline]
    pub fn is_sync_response(&self) -> bool {
        self.command & COMMAND_TYPE_MASK == CommandType::SyncResponse.bits()
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the payload as `Bytes` (cheap, shared).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Total wire size of this frame (header + payload).
    #[inline]
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Rewrite the command-type field, preserving the subsystem bits.
    pub(crate) fn set_command_type(&mut self, kind: CommandType) {
        self.command = (self.command & SUBSYSTEM_MASK) | kind.bits();
    }

    /// Clear the command-type field, leaving a plain subsystem message.
    pub(crate) fn strip_command_type(&mut self) {
        self.command &= SUBSYSTEM_MASK;
    }

    /// Replace this frame's contents with a received response.
    pub(crate) fn set_response(&mut self, header: Header, payload: Bytes) {
        debug_assert_eq!(header.length as usize, payload.len());
        self.command = header.command;
        self.opcode = header.opcode;
        self.payload = payload;
    }

    /// Encode header and payload into the start of `buf`, returning the
    /// total wire length.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`Frame::wire_len`].
    pub(crate) fn encode_into(&self, buf: &mut [u8]) -> usize {
        let total = self.wire_len();
        debug_assert!(buf.len() >= total);
        self.header().encode_into(buf);
        buf[HEADER_SIZE..total].copy_from_slice(&self.payload);
        total
    }
}
