//! Session lifecycle and the caller-facing send paths.
//!
//! A [`Session`] owns the hardware (inside the transaction lock), the
//! receiver thread(s), and the open flag. [`Session::open`] runs the
//! bring-up sequence:
//!
//! 1. Pre-acquire the transaction lock, so receiver threads cannot issue a
//!    poll before the device is synchronized
//! 2. Initialize the hardware: SPI bus, then SRDY, MRDY and RESET lines -
//!    a stage failure tears the earlier stages down again
//! 3. Start the receiver thread(s) for the configured topology
//! 4. Reset the device and run the GPIO synchronization handshake
//! 5. Release the lock; traffic may flow
//!
//! [`Session::close`] is the mirror image: signal termination, wake and
//! join every receiver thread, close the hardware in reverse order, clear
//! the open flag. A closed session can be reopened.
//!
//! # Example
//!
//! ```ignore
//! use npi_spi::{Delivery, Frame, ReceiverMode, SessionBuilder};
//!
//! let mut session = SessionBuilder::new(hardware)
//!     .mode(ReceiverMode::Polling)
//!     .on_message(|frame| {
//!         println!("device pushed {} bytes", frame.payload_len());
//!         Delivery::Continue
//!     })
//!     .build();
//!
//! session.open()?;
//! let mut frame = Frame::new(0x05, 0x01, vec![0x00])?;
//! session.send_sync(&mut frame)?; // frame now holds the response
//! session.close()?;
//! ```

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::engine;
use crate::error::{InitStage, NpiError, Result};
use crate::hardware::{Hardware, SrdyWatcher};
use crate::protocol::Frame;
use crate::receiver::{
    self, Delivery, ExitNotifier, MessageCallback, ReceiverExit, ReceiverMode, Shared,
};

/// Bound on every handshake SRDY wait; exceeding it reads as a device
/// reset.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(100);

/// Idle wait between empty polls (polling topology).
pub const POLL_IDLE_WAIT: Duration = Duration::from_millis(10);

/// Bound on the GPIO edge wait (interrupt topology).
pub const SRDY_EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Post-reset settle delay. A fixed best-effort sleep, kept configurable:
/// it stands in for a device-side ready indication that does not exist
/// yet.
pub const RESET_SETTLE: Duration = Duration::from_micros(500);

/// Timing configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on handshake SRDY waits. Default: [`HANDSHAKE_TIMEOUT`].
    pub handshake_timeout: Duration,
    /// Idle wait between empty polls. Default: [`POLL_IDLE_WAIT`].
    pub poll_idle_wait: Duration,
    /// Bound on the edge wait of the event thread. Default:
    /// [`SRDY_EVENT_TIMEOUT`].
    pub srdy_event_timeout: Duration,
    /// Post-reset settle delay. Default: [`RESET_SETTLE`].
    pub reset_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            poll_idle_wait: POLL_IDLE_WAIT,
            srdy_event_timeout: SRDY_EVENT_TIMEOUT,
            reset_settle: RESET_SETTLE,
        }
    }
}

/// Builder for configuring and creating a [`Session`].
pub struct SessionBuilder<H: Hardware + 'static> {
    hardware: H,
    mode: ReceiverMode,
    config: SessionConfig,
    callback: MessageCallback,
    notifier: ExitNotifier,
}

impl<H: Hardware + 'static> SessionBuilder<H> {
    /// Create a builder around a hardware adapter.
    ///
    /// Defaults: polling topology, [`SessionConfig::default`], a callback
    /// that drops messages with a warning, a notifier that logs receiver
    /// exits.
    pub fn new(hardware: H) -> Self {
        Self {
            hardware,
            mode: ReceiverMode::Polling,
            config: SessionConfig::default(),
            callback: Box::new(default_callback),
            notifier: Arc::new(default_notifier),
        }
    }

    /// Select the receiver topology. Default: [`ReceiverMode::Polling`].
    pub fn mode(mut self, mode: ReceiverMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the whole timing configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the handshake SRDY wait bound.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the idle wait between empty polls.
    pub fn poll_idle_wait(mut self, wait: Duration) -> Self {
        self.config.poll_idle_wait = wait;
        self
    }

    /// Set the post-reset settle delay.
    pub fn reset_settle(mut self, settle: Duration) -> Self {
        self.config.reset_settle = settle;
        self
    }

    /// Register the asynchronous-message callback.
    ///
    /// Invoked by the receiver thread for every device-initiated message,
    /// with the command-type bits already stripped. Returning
    /// [`Delivery::Fatal`] terminates the receiver.
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Frame) -> Delivery + Send + 'static,
    {
        self.callback = Box::new(callback);
        self
    }

    /// Register the receiver-exit notifier.
    ///
    /// Invoked exactly once per receiver thread when it stops, with a
    /// clean-vs-error summary.
    pub fn on_receiver_exit<F>(mut self, notifier: F) -> Self
    where
        F: Fn(&ReceiverExit) + Send + Sync + 'static,
    {
        self.notifier = Arc::new(notifier);
        self
    }

    /// Build the session. The device stays closed until
    /// [`Session::open`].
    pub fn build(self) -> Session<H> {
        Session {
            shared: Arc::new(Shared::new(self.hardware)),
            config: self.config,
            mode: self.mode,
            callback: Arc::new(Mutex::new(self.callback)),
            notifier: self.notifier,
            threads: Vec::new(),
            open: false,
        }
    }
}

fn default_callback(frame: Frame) -> Delivery {
    warn!(
        subsystem = frame.subsystem(),
        opcode = frame.opcode(),
        "async message dropped: no callback registered"
    );
    Delivery::Continue
}

fn default_notifier(exit: &ReceiverExit) {
    if exit.error.is_some() {
        error!("{}", exit.message);
    } else {
        debug!("{}", exit.message);
    }
}

/// A transport session to one network-processor device.
pub struct Session<H: Hardware + 'static> {
    shared: Arc<Shared<H>>,
    config: SessionConfig,
    mode: ReceiverMode,
    callback: Arc<Mutex<MessageCallback>>,
    notifier: ExitNotifier,
    threads: Vec<thread::JoinHandle<()>>,
    open: bool,
}

impl<H: Hardware + 'static> Session<H> {
    /// Open the device: bring up the hardware, start the receiver
    /// thread(s), reset and synchronize the device.
    ///
    /// Fails with [`NpiError::AlreadyOpen`] (and changes nothing) if the
    /// session is already open. Any other failure leaves the session
    /// closed with all resources released.
    pub fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(NpiError::AlreadyOpen);
        }
        debug!("opening device");

        let shared = self.shared.clone();
        let mut bus = shared.lock.acquire()?;
        open_hardware(&mut *bus)?;

        let watcher = match self.mode {
            ReceiverMode::Interrupt => match bus.srdy_watcher() {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    close_hardware(&mut *bus);
                    return Err(e.into());
                }
            },
            ReceiverMode::Polling => None,
        };

        self.shared.terminate.store(false, Ordering::Release);
        self.shared.idle.clear();
        self.shared.srdy_wake.clear();
        if let Err(e) = self.spawn_receivers(watcher) {
            drop(bus);
            return Err(self.abort_open(e));
        }

        // Reset and synchronize while still holding the pre-acquired lock:
        // the receiver threads are parked on it until this completes.
        let primed = engine::reset_device(&mut *bus, &self.config)
            .and_then(|_| engine::synchronize(&mut *bus, &self.config));
        if let Err(e) = primed {
            drop(bus);
            return Err(self.abort_open(e));
        }

        drop(bus);
        self.open = true;
        debug!("device open");
        Ok(())
    }

    /// Close the device: stop and join the receiver thread(s), then close
    /// the hardware in reverse bring-up order.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(NpiError::NotOpen);
        }
        debug!("closing device");

        self.stop_receivers();
        let mut bus = self.shared.lock.acquire()?;
        close_hardware(&mut *bus);
        drop(bus);

        self.open = false;
        debug!("device closed");
        Ok(())
    }

    /// Check if the session is open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The receiver topology this session was built with.
    pub fn mode(&self) -> ReceiverMode {
        self.mode
    }

    /// Synchronous request/response exchange.
    ///
    /// Holds the transaction lock for the whole send+receive window. On
    /// success `frame` holds the response, retagged as a synchronous
    /// response. [`NpiError::PossibleReset`] signals that the device
    /// likely reset; recover with [`Session::reset_device`] followed by
    /// [`Session::synchronize`].
    pub fn send_sync(&self, frame: &mut Frame) -> Result<()> {
        self.ensure_live()?;
        let mut bus = self.shared.lock.acquire()?;
        let _gate = self.narrow_gate();
        engine::sync_transaction(&mut *bus, &self.config, frame)
    }

    /// Fire-and-forget send; no response is read.
    pub fn send_async(&self, frame: &mut Frame) -> Result<()> {
        self.ensure_live()?;
        let mut bus = self.shared.lock.acquire()?;
        let _gate = self.narrow_gate();
        engine::async_send(&mut *bus, &self.config, frame)
    }

    /// Pulse the device RESET line and sleep the configured settle time.
    pub fn reset_device(&self) -> Result<()> {
        if !self.open {
            return Err(NpiError::NotOpen);
        }
        let mut bus = self.shared.lock.acquire()?;
        engine::reset_device(&mut *bus, &self.config)
    }

    /// Run the GPIO synchronization handshake.
    pub fn synchronize(&self) -> Result<()> {
        if !self.open {
            return Err(NpiError::NotOpen);
        }
        let mut bus = self.shared.lock.acquire()?;
        let _gate = self.narrow_gate();
        engine::synchronize(&mut *bus, &self.config)
    }

    fn ensure_live(&self) -> Result<()> {
        if !self.open {
            return Err(NpiError::NotOpen);
        }
        // A receiver that died flagged termination; do not pretend the
        // session is healthy.
        if self.shared.terminated() {
            return Err(NpiError::ReceiverDown);
        }
        Ok(())
    }

    /// Interrupt topology: callers hold the narrow SRDY-wake lock in
    /// addition to the main lock for the whole transaction.
    fn narrow_gate(&self) -> Option<MutexGuard<'_, bool>> {
        match self.mode {
            ReceiverMode::Interrupt => Some(self.shared.srdy_wake.gate()),
            ReceiverMode::Polling => None,
        }
    }

    fn spawn_receivers(&mut self, watcher: Option<Box<dyn SrdyWatcher>>) -> Result<()> {
        let shared = self.shared.clone();
        let config = self.config.clone();
        let callback = self.callback.clone();
        let notifier = self.notifier.clone();
        let mode = self.mode;

        let poll = thread::Builder::new()
            .name("npi-poll".into())
            .spawn(move || {
                let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
                let exit = receiver::run_poll_loop(&shared, &config, mode, &mut *callback);
                (notifier.as_ref())(&exit);
            })
            .map_err(NpiError::ThreadStart)?;
        self.threads.push(poll);

        if let Some(mut watcher) = watcher {
            let shared = self.shared.clone();
            let config = self.config.clone();
            let notifier = self.notifier.clone();

            let event = thread::Builder::new()
                .name("npi-event".into())
                .spawn(move || {
                    let exit = receiver::run_event_loop(&shared, &config, &mut *watcher);
                    (notifier.as_ref())(&exit);
                })
                .map_err(NpiError::ThreadStart)?;
            self.threads.push(event);
        }

        Ok(())
    }

    /// Failure path of `open()` once threads may be running: stop them,
    /// close the hardware, hand the original error back.
    ///
    /// The caller must have dropped its transaction guard already, or the
    /// join would deadlock against a receiver parked on the lock.
    fn abort_open(&mut self, err: NpiError) -> NpiError {
        self.stop_receivers();
        if let Ok(mut bus) = self.shared.lock.acquire() {
            close_hardware(&mut *bus);
        }
        err
    }

    fn stop_receivers(&mut self) {
        self.shared.terminate.store(true, Ordering::Release);
        self.shared.idle.raise();
        self.shared.srdy_wake.raise();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("receiver thread panicked");
            }
        }
    }
}

impl<H: Hardware + 'static> Drop for Session<H> {
    fn drop(&mut self) {
        if self.open {
            self.stop_receivers();
            if let Ok(mut bus) = self.shared.lock.acquire() {
                close_hardware(&mut *bus);
            }
        }
    }
}

fn open_hardware<H: Hardware>(hw: &mut H) -> Result<()> {
    if let Err(source) = hw.open_bus() {
        return Err(NpiError::Init {
            stage: InitStage::Bus,
            source,
        });
    }
    if let Err(source) = hw.open_srdy() {
        hw.close_bus();
        return Err(NpiError::Init {
            stage: InitStage::Srdy,
            source,
        });
    }
    if let Err(source) = hw.open_mrdy() {
        hw.close_srdy();
        hw.close_bus();
        return Err(NpiError::Init {
            stage: InitStage::Mrdy,
            source,
        });
    }
    if let Err(source) = hw.open_reset() {
        hw.close_mrdy();
        hw.close_srdy();
        hw.close_bus();
        return Err(NpiError::Init {
            stage: InitStage::Reset,
            source,
        });
    }
    Ok(())
}

fn close_hardware<H: Hardware>(hw: &mut H) {
    // Reverse bring-up order.
    hw.close_reset();
    hw.close_mrdy();
    hw.close_srdy();
    hw.close_bus();
}
