//! # npi-spi
//!
//! Transport layer for exchanging framed request/response messages with a
//! network-processor chip over a half-duplex SPI bus paired with two
//! handshake GPIO lines (MRDY: host-ready, SRDY: slave-ready).
//!
//! ## Architecture
//!
//! - **Protocol**: 3-byte header framing ([`protocol`]) for synchronous
//!   request/response and asynchronous notification messages
//! - **Handshake**: the MRDY/SRDY level-transition sequence framing one bus
//!   transaction, with bounded waits that detect device resets
//! - **Transaction lock**: a guard-typed lock owning the hardware, so at
//!   most one transaction is ever in flight across the caller thread and
//!   the receiver thread(s)
//! - **Receiver topologies**: device-initiated traffic is drained either by
//!   a 10 ms polling loop or by a GPIO-interrupt-driven thread pair,
//!   selected per session ([`ReceiverMode`])
//! - **Lifecycle**: symmetric open/close sequencing with a reset-and-sync
//!   handshake at open time ([`Session`])
//!
//! The physical bus and GPIO primitives are external collaborators behind
//! the [`hardware::Hardware`] trait; message payload semantics are out of
//! scope - this layer frames opaque bytes and times their exchange.
//!
//! ## Example
//!
//! ```ignore
//! use npi_spi::{Delivery, Frame, SessionBuilder};
//!
//! let mut session = SessionBuilder::new(hardware)
//!     .on_message(|frame| {
//!         handle_notification(frame);
//!         Delivery::Continue
//!     })
//!     .build();
//! session.open()?;
//!
//! let mut frame = Frame::new(0x05, 0x01, request_bytes)?;
//! session.send_sync(&mut frame)?; // frame now holds the response
//! ```

pub mod error;
pub mod hardware;
pub mod protocol;

mod engine;
mod lock;
mod receiver;
mod session;

pub use error::{InitStage, NpiError, Result};
pub use protocol::Frame;
pub use receiver::{Delivery, ReceiverExit, ReceiverMode};
pub use session::{
    Session, SessionBuilder, SessionConfig, HANDSHAKE_TIMEOUT, POLL_IDLE_WAIT, RESET_SETTLE,
    SRDY_EVENT_TIMEOUT,
};
