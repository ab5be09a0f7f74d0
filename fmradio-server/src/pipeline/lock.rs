//! Exclusive access to the SDR device.
//!
//! Every demodulator launch (live stream, continuous output, scan probe)
//! holds a [`DeviceGuard`] until its processes have been killed. A new
//! pipeline therefore cannot open the device while a preempted one is still
//! tearing down.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Lock-related errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Lock system is closed.
    #[error("Device lock closed")]
    Closed,
}

/// Single-holder lock with an owner label for diagnostics.
pub struct DeviceLock {
    semaphore: Arc<Semaphore>,
    holder: Arc<Mutex<Option<&'static str>>>,
}

impl DeviceLock {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            holder: Arc::new(Mutex::new(None)),
        }
    }

    /// Wait until the device is free, then take it.
    pub async fn acquire(&self, owner: &'static str) -> Result<DeviceGuard, LockError> {
        if let Some(current) = self.holder() {
            log::debug!("[DeviceLock] {} waiting for {} to release the device", owner, current);
        }
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LockError::Closed)?;
        Ok(self.guard(permit, owner))
    }

    fn guard(&self, permit: OwnedSemaphorePermit, owner: &'static str) -> DeviceGuard {
        *self.holder.lock() = Some(owner);
        DeviceGuard {
            _permit: permit,
            holder: Arc::clone(&self.holder),
        }
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Label of the current holder, if any.
    pub fn holder(&self) -> Option<&'static str> {
        *self.holder.lock()
    }
}

impl Default for DeviceLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for as long as a pipeline may touch the device.
pub struct DeviceGuard {
    _permit: OwnedSemaphorePermit,
    holder: Arc<Mutex<Option<&'static str>>>,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        // Cleared before the permit field drops, so the next holder sets its own label.
        *self.holder.lock() = None;
    }
}
