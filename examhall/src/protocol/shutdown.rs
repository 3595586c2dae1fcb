//! Coordinated, idempotent exam shutdown
//!
//! An external request only flips a flag (safe from a signal handler) and
//! nudges the work-ready counter. The teacher's loop notices the flag and runs
//! [`shutdown`], which does the actual fan-out to waiting students.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::arena::SENTINEL_GRADE;
use crate::error::Result;
use crate::participant::Session;
use crate::sync::NamedSemaphore;

/// Cancellation flag checked at every suspension point
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag; no allocation, no locking
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Notifier handed to the signal-handling side of the teacher process
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: ShutdownToken,
    work_ready: Arc<NamedSemaphore>,
}

impl ShutdownHandle {
    pub fn new(token: ShutdownToken, work_ready: Arc<NamedSemaphore>) -> Self {
        Self { token, work_ready }
    }

    /// Request shutdown and wake the teacher if it is waiting for work
    ///
    /// Safe to call any number of times.
    pub fn request(&self) {
        self.token.request();
        self.work_ready.signal_unchecked();
    }

    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }
}

/// What a shutdown pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// `false` if the exam was already shutting down
    pub first_request: bool,
    /// Slots whose grade channel received the sentinel
    pub notified: Vec<usize>,
    /// Pending slots whose student had already vanished
    pub unreachable: Vec<usize>,
}

/// Mark the exam over and release every waiting student
///
/// Under the table lock: set the sticky flag, then for each `Waiting` or
/// `Processing` slot write the sentinel grade and signal its grade channel.
/// A second call only re-signals the work-ready counter.
pub fn shutdown(session: &Session) -> Result<ShutdownReport> {
    debug!("shutdown: called");
    let arena = session.arena();

    let report = arena.with_table_lock(|table| -> Result<ShutdownReport> {
        let mut report = ShutdownReport {
            first_request: table.mark_shutting_down(),
            ..Default::default()
        };
        if !report.first_request {
            return Ok(report);
        }

        for slot in table.pending()? {
            table.set_grade(slot.index, SENTINEL_GRADE)?;
            match NamedSemaphore::open(&slot.grade_channel) {
                Ok(channel) => {
                    channel.signal()?;
                    report.notified.push(slot.index);
                }
                Err(e) => {
                    debug!(slot = slot.index, error = %e, "shutdown: student channel gone");
                    report.unreachable.push(slot.index);
                }
            }
        }
        Ok(report)
    })??;

    arena.work_ready().signal()?;

    if report.first_request {
        info!(notified = ?report.notified, unreachable = ?report.unreachable, "Exam shut down");
        session.log(format!(
            "Shutdown: notified {} student(s), {} unreachable",
            report.notified.len(),
            report.unreachable.len()
        ));
    } else {
        debug!("shutdown: already shutting down");
    }
    Ok(report)
}
