//! Receiver threads - draining device-initiated traffic.
//!
//! The device signals pending data by asserting SRDY while the host is not
//! mid-transaction. Two interchangeable topologies turn that signal into
//! poll transactions:
//!
//! ```text
//! Polling                      Interrupt-driven
//! ┌───────────┐                ┌───────────┐   wake   ┌────────────┐
//! │ poll loop │ 10 ms timer    │ poll loop │ ◄─────── │ event loop │
//! │ lock, SRDY│                │ parked on │          │ SRDY edge, │
//! │ low? poll │                │ wake flag │          │ MRDY high? │
//! └───────────┘                └───────────┘          └────────────┘
//! ```
//!
//! Both run until the shared termination flag is set. A flag flip alone
//! cannot unblock a parked thread, so shutdown also raises every wake
//! signal. Each thread reports its exit - clean or failed - to the
//! error-notification callback exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::engine;
use crate::error::NpiError;
use crate::hardware::{EdgeWait, Hardware, Level, SrdyWatcher};
use crate::lock::TransactionLock;
use crate::protocol::Frame;
use crate::session::SessionConfig;

/// Receiver topology, chosen at session construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverMode {
    /// One thread polling on a 10 ms timer.
    Polling,
    /// One poll thread woken by a second, GPIO-interrupt-driven thread.
    Interrupt,
}

/// Verdict returned by the asynchronous-message callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Keep receiving.
    Continue,
    /// Unrecoverable consumer-side condition; terminate the receiver.
    Fatal,
}

/// Summary handed to the exit notifier when a receiver thread stops.
#[derive(Debug)]
pub struct ReceiverExit {
    /// The failure that stopped the thread, or `None` for a clean exit.
    pub error: Option<NpiError>,
    /// Human-readable one-line summary.
    pub message: String,
}

impl ReceiverExit {
    fn report(thread: &str, error: Option<NpiError>) -> Self {
        let message = match &error {
            None => format!("{thread} thread exited without error"),
            Some(e) => format!("{thread} thread exited with error: {e}"),
        };
        Self { error, message }
    }
}

/// Callback receiving every asynchronous message the device pushes.
pub(crate) type MessageCallback = Box<dyn FnMut(Frame) -> Delivery + Send>;

/// Callback informed once at each receiver-thread exit.
pub(crate) type ExitNotifier = Arc<dyn Fn(&ReceiverExit) + Send + Sync>;

/// Wake flag plus condvar. Doubles as the narrow lock of the interrupt
/// topology: callers hold the flag's mutex for their whole transaction so
/// an SRDY edge observed mid-transaction cannot signal the poll path.
pub(crate) struct WakeSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Lock the wake flag. The guard is the narrow lock.
    pub(crate) fn gate(&self) -> MutexGuard<'_, bool> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the flag and wake every parked waiter.
    pub(crate) fn raise(&self) {
        *self.gate() = true;
        self.cond.notify_all();
    }

    /// Clear a stale flag (between close and a fresh open).
    pub(crate) fn clear(&self) {
        *self.gate() = false;
    }

    /// Park until raised or `timeout` elapses; consumes the flag.
    ///
    /// Returns `true` if the signal was raised.
    pub(crate) fn wait(&self, timeout: Duration, terminate: &AtomicBool) -> bool {
        let mut pending = self.gate();
        if !*pending && !terminate.load(Ordering::Acquire) {
            pending = self
                .cond
                .wait_timeout(pending, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let signaled = *pending;
        *pending = false;
        signaled
    }
}

/// State shared between the caller thread and the receiver thread(s).
pub(crate) struct Shared<H> {
    /// The transaction lock, owning the hardware.
    pub(crate) lock: TransactionLock<H>,
    /// Written by the lifecycle controller (and by a failing receiver),
    /// read at every loop iteration.
    pub(crate) terminate: AtomicBool,
    /// Polling topology: idle wait between empty polls.
    pub(crate) idle: WakeSignal,
    /// Interrupt topology: SRDY-edge wake path.
    pub(crate) srdy_wake: WakeSignal,
}

impl<H> Shared<H> {
    pub(crate) fn new(hardware: H) -> Self {
        Self {
            lock: TransactionLock::new(hardware),
            terminate: AtomicBool::new(false),
            idle: WakeSignal::new(),
            srdy_wake: WakeSignal::new(),
        }
    }

    pub(crate) fn terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    fn request_termination(&self) {
        self.terminate.store(true, Ordering::Release);
        self.idle.raise();
        self.srdy_wake.raise();
    }
}

enum Cycle {
    /// A poll ran; loop again immediately to drain further messages.
    Drained,
    /// Nothing pending.
    Idle,
    /// Unrecoverable; terminate the receiver.
    Fatal(NpiError),
}

/// Poll-thread body, both topologies.
pub(crate) fn run_poll_loop<H: Hardware>(
    shared: &Shared<H>,
    config: &SessionConfig,
    mode: ReceiverMode,
    callback: &mut MessageCallback,
) -> ReceiverExit {
    debug!(?mode, "poll thread started");
    let mut failure = None;

    while !shared.terminated() {
        match poll_cycle(shared, config, mode, callback) {
            Cycle::Drained => continue,
            Cycle::Idle => match mode {
                ReceiverMode::Polling => {
                    shared.idle.wait(config.poll_idle_wait, &shared.terminate);
                }
                ReceiverMode::Interrupt => {
                    shared
                        .srdy_wake
                        .wait(config.srdy_event_timeout, &shared.terminate);
                }
            },
            Cycle::Fatal(e) => {
                error!("poll thread failed: {e}");
                failure = Some(e);
                shared.request_termination();
            }
        }
    }

    debug!("poll thread exiting");
    ReceiverExit::report("SPI poll", failure)
}

fn poll_cycle<H: Hardware>(
    shared: &Shared<H>,
    config: &SessionConfig,
    mode: ReceiverMode,
    callback: &mut MessageCallback,
) -> Cycle {
    // The first acquisition parks here until the lifecycle controller has
    // finished reset and synchronization.
    let mut bus = match shared.lock.acquire() {
        Ok(bus) => bus,
        Err(e) => return Cycle::Fatal(e),
    };
    if shared.terminated() {
        // Shutdown won the lock race; leave the hardware alone.
        return Cycle::Idle;
    }
    let _gate = match mode {
        ReceiverMode::Interrupt => Some(shared.srdy_wake.gate()),
        ReceiverMode::Polling => None,
    };

    match bus.srdy() {
        Ok(Level::Low) => {}
        Ok(Level::High) => return Cycle::Idle,
        Err(e) => return Cycle::Fatal(e.into()),
    }

    // Device holds SRDY low: it has data pending. Retrieve it.
    let mut frame = Frame::poll();
    match engine::poll_transaction(&mut *bus, config, &mut frame) {
        Ok(()) => {
            if frame.is_async_request() {
                frame.strip_command_type();
                trace!(
                    subsystem = frame.subsystem(),
                    opcode = frame.opcode(),
                    len = frame.payload_len(),
                    "delivering async message"
                );
                if callback(frame) == Delivery::Fatal {
                    return Cycle::Fatal(NpiError::CallbackFatal);
                }
            }
            Cycle::Drained
        }
        Err(NpiError::PossibleReset { elapsed }) => {
            warn!(?elapsed, "unexpected handshake during poll; device may have reset");
            Cycle::Idle
        }
        Err(e) => Cycle::Fatal(e),
    }
}

/// Event-thread body (interrupt topology): watch for SRDY falling edges
/// and wake the poll thread when one arrives outside a host transaction.
pub(crate) fn run_event_loop<H: Hardware>(
    shared: &Shared<H>,
    config: &SessionConfig,
    watcher: &mut dyn SrdyWatcher,
) -> ReceiverExit {
    debug!("event thread started");
    let mut failure = None;

    while !shared.terminated() {
        match watcher.wait_falling_edge(config.srdy_event_timeout) {
            Ok(EdgeWait::TimedOut) => continue,
            Ok(EdgeWait::Edge) => {
                // Narrow lock: a caller mid-transaction holds this gate, so
                // the MRDY check cannot race the transaction it belongs to.
                let mut pending = shared.srdy_wake.gate();
                match watcher.mrdy() {
                    Ok(Level::High) => {
                        trace!("srdy edge outside transaction; waking poll thread");
                        *pending = true;
                        drop(pending);
                        shared.srdy_wake.cond.notify_all();
                    }
                    Ok(Level::Low) => {
                        // Edge belongs to a host transaction in flight.
                        trace!("srdy edge during host transaction; ignored");
                    }
                    Err(e) => {
                        error!("event thread failed to read MRDY: {e}");
                        failure = Some(e.into());
                        drop(pending);
                        shared.request_termination();
                    }
                }
            }
            Err(e) => {
                error!("event thread wait failed: {e}");
                failure = Some(e.into());
                shared.request_termination();
            }
        }
    }

    debug!("event thread exiting");
    ReceiverExit::report("SPI event", failure)
}
