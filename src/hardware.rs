//! Hardware adapter traits - the physical bus and GPIO boundary.
//!
//! The transport drives one SPI bus and three GPIO lines (SRDY, MRDY,
//! RESET) through the [`Hardware`] trait. Concrete implementations (spidev
//! plus a GPIO character device on Linux, scripted doubles in tests) live
//! outside this crate.
//!
//! Line ownership is fixed by the protocol: MRDY and RESET are host-driven
//! only, SRDY is device-driven and host-observed only. Implementations are
//! not expected to be thread-safe; the transaction lock owns the `Hardware`
//! value and serializes every call. The one exception is the
//! [`SrdyWatcher`] handle, which the interrupt-driven topology reads from
//! its own thread without the lock.
//!
//! All methods report adapter-specific failures as `io::Error`; the
//! transport maps them into its own error taxonomy.

use std::io;
use std::time::Duration;

/// Logic level of a GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Asserted for both handshake lines (active-low signaling).
    Low,
    /// Released / idle.
    High,
}

impl Level {
    /// Check if this is [`Level::Low`].
    #[inline]
    pub fn is_low(self) -> bool {
        self == Level::Low
    }

    /// Check if this is [`Level::High`].
    #[inline]
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

/// Outcome of a bounded wait for an SRDY level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The line reached the requested level.
    Reached {
        /// How long the wait took. Reported even on success so callers can
        /// flag waits that completed suspiciously late.
        elapsed: Duration,
    },
    /// The timeout expired first.
    TimedOut,
}

/// Outcome of a bounded wait for an SRDY edge event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeWait {
    /// A falling edge was observed.
    Edge,
    /// The timeout expired with no event.
    TimedOut,
}

/// Blocking access to the SPI bus and the handshake/reset GPIO lines.
pub trait Hardware: Send {
    /// Open and configure the SPI bus device.
    fn open_bus(&mut self) -> io::Result<()>;

    /// Open and configure the SRDY input line.
    fn open_srdy(&mut self) -> io::Result<()>;

    /// Open and configure the MRDY output line.
    fn open_mrdy(&mut self) -> io::Result<()>;

    /// Open and configure the RESET output line.
    fn open_reset(&mut self) -> io::Result<()>;

    /// Release the RESET line resources.
    fn close_reset(&mut self);

    /// Release the MRDY line resources.
    fn close_mrdy(&mut self);

    /// Release the SRDY line resources.
    fn close_srdy(&mut self);

    /// Close the SPI bus device.
    fn close_bus(&mut self);

    /// Blocking full-duplex exchange of exactly `buf.len()` bytes.
    ///
    /// The buffer contents are clocked out and the bytes clocked in replace
    /// them. A zero-filled buffer therefore performs a dummy read.
    fn transfer(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Drive the MRDY line.
    fn set_mrdy(&mut self, level: Level) -> io::Result<()>;

    /// Drive the RESET line.
    fn set_reset(&mut self, level: Level) -> io::Result<()>;

    /// Read the current SRDY level.
    fn srdy(&mut self) -> io::Result<Level>;

    /// Block until SRDY reaches `level`, up to `timeout`.
    fn wait_srdy(&mut self, level: Level, timeout: Duration) -> io::Result<WaitOutcome>;

    /// Create an independent handle watching SRDY edge events.
    ///
    /// Only used by the interrupt-driven receiver topology; polling-only
    /// adapters can rely on this default.
    fn srdy_watcher(&mut self) -> io::Result<Box<dyn SrdyWatcher>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "adapter does not support SRDY edge events",
        ))
    }
}

/// Edge-event handle for the interrupt-driven topology.
///
/// Owned by the event thread and used without the transaction lock, so an
/// implementation must not share mutable state with its parent
/// [`Hardware`] beyond what the platform already allows (e.g. a duplicated
/// file descriptor).
pub trait SrdyWatcher: Send {
    /// Block until an SRDY falling edge occurs, up to `timeout`.
    fn wait_falling_edge(&mut self, timeout: Duration) -> io::Result<EdgeWait>;

    /// Read the current SRDY level.
    fn srdy(&mut self) -> io::Result<Level>;

    /// Read back the current MRDY level.
    ///
    /// Used to tell a device-initiated SRDY assertion (MRDY high) from an
    /// edge belonging to a host transaction already in flight (MRDY low).
    fn mrdy(&mut self) -> io::Result<Level>;
}
