//! Admission control over the predicted memory of outstanding jobs.

use crate::engine::ResourceEstimate;
use crate::error::{Result, SeparationError};
use std::sync::{Arc, Mutex};

/// Tracks the memory reserved by admitted, unfinished jobs.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    ceiling_bytes: u64,
    outstanding: Arc<Mutex<u64>>,
}

impl AdmissionController {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self {
            ceiling_bytes,
            outstanding: Arc::new(Mutex::new(0)),
        }
    }

    /// Reserve `estimate` or fail with `Overloaded`.
    ///
    /// The reservation is released when the returned permit drops.
    pub fn try_admit(&self, estimate: ResourceEstimate) -> Result<AdmissionPermit> {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        let requested = estimate.memory_bytes;
        if outstanding.saturating_add(requested) > self.ceiling_bytes {
            return Err(SeparationError::Overloaded {
                message: format!(
                    "{} bytes requested, {} of {} already reserved",
                    requested, *outstanding, self.ceiling_bytes
                ),
            });
        }
        *outstanding += requested;
        Ok(AdmissionPermit {
            bytes: requested,
            outstanding: Arc::clone(&self.outstanding),
        })
    }

    pub fn outstanding_bytes(&self) -> u64 {
        *self.outstanding.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }
}

/// A reservation held for the life of one job.
#[derive(Debug)]
pub struct AdmissionPermit {
    bytes: u64,
    outstanding: Arc<Mutex<u64>>,
}

impl AdmissionPermit {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
        *outstanding = outstanding.saturating_sub(self.bytes);
    }
}
