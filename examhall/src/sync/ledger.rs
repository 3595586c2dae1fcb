//! Ownership ledger for named system resources
//!
//! Each participant records the names it created. Releasing the ledger
//! unlinks every entry exactly once; running it again (explicitly or from
//! Drop) finds nothing left to do. Names leaked by a crash are not recovered
//! here; the next teacher removes its fixed names before re-creating them.

use nix::errno::Errno;
use nix::sys::mman::shm_unlink;
use tracing::{debug, warn};

use super::semaphore;
use crate::error::{ExamError, Result};

/// Kind of named resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Semaphore,
    SharedMemory,
}

/// One owned name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedName {
    pub owner: String,
    pub kind: ResourceKind,
    pub name: String,
}

/// Owner → name table with an idempotent finalizer
#[derive(Debug, Default)]
pub struct ResourceLedger {
    entries: Vec<OwnedName>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, owner: impl Into<String>, kind: ResourceKind, name: impl Into<String>) {
        let entry = OwnedName {
            owner: owner.into(),
            kind,
            name: name.into(),
        };
        debug!(?entry, "ResourceLedger::track");
        self.entries.push(entry);
    }

    /// Names not yet released
    pub fn live(&self) -> &[OwnedName] {
        &self.entries
    }

    /// Unlink every tracked name, newest first
    ///
    /// Returns the first error encountered; the failed entries are dropped
    /// from the ledger regardless so a second call never repeats them.
    pub fn release_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(entry) = self.entries.pop() {
            if let Err(e) = unlink_entry(&entry) {
                warn!(name = %entry.name, owner = %entry.owner, error = %e, "Failed to unlink resource");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Remove a shared-memory object name; a missing name is not an error
pub fn unlink_shared_memory(name: &str) -> Result<()> {
    match shm_unlink(name) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(errno) => Err(ExamError::from_errno(name, errno)),
    }
}

fn unlink_entry(entry: &OwnedName) -> Result<()> {
    debug!(name = %entry.name, kind = ?entry.kind, "unlink_entry");
    match entry.kind {
        ResourceKind::Semaphore => semaphore::unlink(&entry.name),
        ResourceKind::SharedMemory => unlink_shared_memory(&entry.name),
    }
}

impl Drop for ResourceLedger {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}
