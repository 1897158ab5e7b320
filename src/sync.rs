//! Cancellable locking.
//!
//! Every aperture and partition lock in this crate is a [`CancellableMutex`].
//! A waiter polls the lock with exponential backoff and gives up with
//! [`PartError::Cancelled`] as soon as its [`CancelToken`] fires, so tearing
//! down a client never deadlocks behind a wedged hardware sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;

use crate::error::{PartError, Result};

/// Upper bound on the sleep between two lock attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(2);

/// Shared stop flag for one calling context.
///
/// Clones observe the same flag; cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every waiter holding this token to stop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fail with `Cancelled` if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PartError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Mutex whose acquisition can be abandoned through a [`CancelToken`].
#[derive(Debug, Default)]
pub struct CancellableMutex<T> {
    inner: Mutex<T>,
}

impl<T> CancellableMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock, or return `Cancelled` once `cancel` fires.
    ///
    /// A poisoned lock is recovered: the guarded state is only ever bitmaps
    /// and flags that each critical section leaves consistent before it can
    /// panic.
    pub fn lock(&self, cancel: &CancelToken) -> Result<MutexGuard<'_, T>> {
        let mut backoff = Duration::from_micros(1);
        loop {
            cancel.check()?;
            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => {
                    log::warn!("recovering poisoned lock");
                    return Ok(poisoned.into_inner());
                }
                Err(TryLockError::WouldBlock) => {
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}
