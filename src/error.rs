//! Error types for npi-spi.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Hardware bring-up stages, in the order `open()` walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    /// SPI bus device.
    Bus,
    /// SRDY (slave-ready) GPIO line.
    Srdy,
    /// MRDY (master-ready) GPIO line.
    Mrdy,
    /// RESET GPIO line.
    Reset,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitStage::Bus => "SPI bus",
            InitStage::Srdy => "SRDY GPIO",
            InitStage::Mrdy => "MRDY GPIO",
            InitStage::Reset => "RESET GPIO",
        };
        f.write_str(name)
    }
}

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum NpiError {
    /// I/O error reported by the bus/GPIO adapter.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `open()` called on a session that is already open.
    #[error("device is already open")]
    AlreadyOpen,

    /// Operation requires an open session.
    #[error("device is not open")]
    NotOpen,

    /// The transaction lock sentinel was observed in an impossible state.
    ///
    /// This indicates a concurrency bug, not an environmental fault. It is
    /// never corrected silently: continuing could interleave two
    /// transactions on the bus.
    #[error("transaction lock invariant violated: {0}")]
    LockInvariant(&'static str),

    /// An SRDY handshake wait exceeded the reset-detection bound.
    ///
    /// A freshly reset device holds SRDY high far longer than during normal
    /// operation, so this is distinguished from a plain I/O failure. The
    /// caller may recover with a device reset plus resynchronization.
    #[error("SRDY wait ran {elapsed:?} without completing the handshake - possible device reset")]
    PossibleReset {
        /// How long the wait ran before giving up.
        elapsed: Duration,
    },

    /// Frame payload does not fit the single length byte.
    #[error("payload length {0} exceeds the 255-byte frame limit")]
    PayloadTooLarge(usize),

    /// A hardware bring-up stage failed during `open()`.
    #[error("{stage} initialization failed: {source}")]
    Init {
        /// Which stage failed; earlier stages were torn down again.
        stage: InitStage,
        /// The adapter-specific failure.
        #[source]
        source: std::io::Error,
    },

    /// A receiver thread could not be started.
    #[error("failed to start receiver thread: {0}")]
    ThreadStart(std::io::Error),

    /// The synchronization handshake did not reach a settled level pair.
    #[error("synchronization handshake failed: {0}")]
    SyncFailed(&'static str),

    /// The asynchronous-message callback reported a fatal condition.
    #[error("asynchronous message callback reported a fatal condition")]
    CallbackFatal,

    /// The receiver thread has terminated; the session needs to be closed
    /// and reopened before further traffic.
    #[error("receiver thread has terminated")]
    ReceiverDown,
}

/// Result type alias using [`NpiError`].
pub type Result<T> = std::result::Result<T, NpiError>;
