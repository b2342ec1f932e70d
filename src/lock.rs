//! Transaction lock - at most one logical transaction on the bus.
//!
//! The mutex owns the hardware value, so touching the bus without holding
//! the lock is not expressible. [`TransactionLock::acquire`] blocks until
//! the lock is free and returns a [`TransactionGuard`]; the guard's
//! existence proves the lock is held and dereferences to the hardware.
//! Release happens when the guard goes out of scope, which makes a
//! double-release or a release-without-acquire unrepresentable.
//!
//! A boolean sentinel is still validated on every acquire: observing it
//! already set while holding the mutex, or finding the mutex poisoned by a
//! panicking holder, means a guard did not run its release path. Either is
//! reported as [`NpiError::LockInvariant`] and never silently corrected -
//! continuing would risk two transactions interleaving their MRDY/SRDY
//! sequences.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use crate::error::{NpiError, Result};

/// Exclusive-ownership token for the bus, wrapping the hardware itself.
pub struct TransactionLock<H> {
    inner: Mutex<TransactionState<H>>,
}

struct TransactionState<H> {
    hardware: H,
    /// Sentinel mirroring guard existence; checked, not assumed.
    held: bool,
}

impl<H> TransactionLock<H> {
    /// Create a lock owning `hardware`, initially free.
    pub fn new(hardware: H) -> Self {
        Self {
            inner: Mutex::new(TransactionState {
                hardware,
                held: false,
            }),
        }
    }

    /// Block until the lock is free, then take it.
    ///
    /// Fails with [`NpiError::LockInvariant`] if the sentinel is observed
    /// in an impossible state or the mutex was poisoned.
    pub fn acquire(&self) -> Result<TransactionGuard<'_, H>> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| NpiError::LockInvariant("transaction mutex poisoned"))?;
        if state.held {
            return Err(NpiError::LockInvariant("sentinel set while lock was free"));
        }
        state.held = true;
        Ok(TransactionGuard { state })
    }
}

/// Proof of transaction-lock ownership; dereferences to the hardware.
pub struct TransactionGuard<'a, H> {
    state: MutexGuard<'a, TransactionState<H>>,
}

impl<H> Deref for TransactionGuard<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.state.hardware
    }
}

impl<H> DerefMut for TransactionGuard<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        &mut self.state.hardware
    }
}

impl<H> Drop for TransactionGuard<'_, H> {
    fn drop(&mut self) {
        debug_assert!(self.state.held, "guard dropped with sentinel clear");
        self.state.held = false;
    }
}
