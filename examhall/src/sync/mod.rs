//! Cross-process synchronization primitives
//!
//! - [`NamedSemaphore`] - named counting semaphore (create/open/signal/wait/destroy)
//! - [`AttemptChannels`] - the worker-owned grade/ack pair for one exam attempt
//! - [`ResourceLedger`] - owner → name table with an idempotent finalizer

pub mod ledger;
pub mod semaphore;

pub use ledger::{OwnedName, ResourceKind, ResourceLedger, unlink_shared_memory};
pub use semaphore::{NamedSemaphore, WaitOutcome};

use tracing::warn;

use crate::error::Result;
use crate::names::Names;

/// Grade and acknowledgment semaphores for one attempt
///
/// Created by the student before claiming a slot and destroyed when dropped,
/// whatever path the attempt took.
#[derive(Debug)]
pub struct AttemptChannels {
    pub grade: NamedSemaphore,
    pub ack: NamedSemaphore,
}

impl AttemptChannels {
    pub fn create(names: &Names) -> Result<Self> {
        let (grade_name, ack_name) = names.attempt_channels();
        let grade = NamedSemaphore::create(&grade_name, 0)?;
        let ack = match NamedSemaphore::create(&ack_name, 0) {
            Ok(ack) => ack,
            Err(e) => {
                let _ = grade.destroy();
                return Err(e);
            }
        };
        Ok(Self { grade, ack })
    }

    pub fn destroy(&self) {
        for sem in [&self.grade, &self.ack] {
            if let Err(e) = sem.destroy() {
                warn!(name = sem.name(), error = %e, "Failed to destroy attempt channel");
            }
        }
    }
}

impl Drop for AttemptChannels {
    fn drop(&mut self) {
        self.destroy();
    }
}
