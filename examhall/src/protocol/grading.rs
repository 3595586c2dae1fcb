//! Grade rendezvous between the teacher and one student
//!
//! Teacher side: [`select_next`] then [`deliver`]. Student side:
//! [`await_grade`] then [`acknowledge`]. Every wait is a bounded poll so the
//! shutdown flag is noticed within one interval.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::shutdown::ShutdownToken;
use crate::arena::{Claimed, ReleaseKind, SENTINEL_GRADE, SlotView};
use crate::error::{ExamError, Result};
use crate::participant::Session;
use crate::sync::{AttemptChannels, NamedSemaphore, WaitOutcome};

/// Move the lowest-index waiting slot to `Processing`
///
/// `None` means the wake-up was spurious.
pub fn select_next(session: &Session) -> Result<Option<SlotView>> {
    session.arena().with_table_lock(|table| table.select_first_waiting())?
}

/// How a delivery attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The student confirmed receipt
    Acknowledged,
    /// The grade was signaled but no acknowledgment came in time
    AckAbandoned,
    /// The student's channels were gone before the grade could be signaled
    PeerVanished,
    /// Shutdown was requested before the grade was published; the slot is
    /// left `Processing` for the shutdown fan-out
    Preempted,
    /// Publishing the grade failed; the slot was released without a grade
    Failed,
}

/// Outcome of [`deliver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeReport {
    pub slot: usize,
    pub ticket: u32,
    pub grade: i32,
    pub delivery: Delivery,
    /// Whether this call moved the slot back to `Empty` (the student may have
    /// done it first)
    pub released: bool,
}

/// Publish `grade` for a slot in `Processing` and wait for the acknowledgment
///
/// The acknowledgment wait ends on ack, after `ack_timeout`, or within one
/// `poll` of `token` being requested. The slot is released in every case
/// except [`Delivery::Preempted`], including when publishing fails.
pub fn deliver(
    session: &Session,
    slot: &SlotView,
    grade: i32,
    poll: Duration,
    ack_timeout: Duration,
    token: &ShutdownToken,
) -> Result<GradeReport> {
    debug!(slot = slot.index, ticket = slot.ticket, grade, "deliver: called");
    let arena = session.arena();
    let mut report = GradeReport {
        slot: slot.index,
        ticket: slot.ticket,
        grade,
        delivery: Delivery::Preempted,
        released: false,
    };

    if token.is_requested() {
        debug!(slot = slot.index, "deliver: shutdown requested, leaving slot to the fan-out");
        return Ok(report);
    }

    let channels = NamedSemaphore::open(&slot.grade_channel)
        .and_then(|grade_ch| NamedSemaphore::open(&slot.ack_channel).map(|ack_ch| (grade_ch, ack_ch)));
    let (grade_ch, ack_ch) = match channels {
        Ok(pair) => pair,
        Err(e) => {
            warn!(slot = slot.index, owner = slot.owner, error = %e, "Student vanished before delivery");
            session.log(format!(
                "Student {} (slot {}) vanished before grading: {}",
                slot.owner, slot.index, e
            ));
            report.delivery = Delivery::PeerVanished;
            report.released = release(session, slot, ReleaseKind::Abandoned)?;
            return Ok(report);
        }
    };

    if let Err(e) = arena.publish_grade(slot.index, grade).and_then(|()| grade_ch.signal()) {
        return abort_delivery(session, slot, report, e);
    }
    session.log(format!(
        "Graded student {} (ticket {}, slot {}): {}",
        slot.owner, slot.ticket, slot.index, grade
    ));

    report.delivery = match wait_for_ack(&ack_ch, poll, ack_timeout, token) {
        Ok(delivery) => delivery,
        Err(e) => {
            warn!(slot = slot.index, error = %e, "Acknowledgment wait failed");
            Delivery::AckAbandoned
        }
    };
    if report.delivery == Delivery::AckAbandoned {
        warn!(slot = slot.index, owner = slot.owner, "No acknowledgment, releasing slot");
        session.log(format!("No acknowledgment from student {} (slot {})", slot.owner, slot.index));
    }
    report.released = release(session, slot, ReleaseKind::Delivered)?;

    debug!(?report, "deliver: done");
    Ok(report)
}

/// Release a slot whose grade could not be published
fn abort_delivery(
    session: &Session,
    slot: &SlotView,
    mut report: GradeReport,
    cause: ExamError,
) -> Result<GradeReport> {
    warn!(slot = slot.index, owner = slot.owner, error = %cause, "Failed to publish grade, releasing slot");
    session.log(format!(
        "Could not grade student {} (slot {}): {}",
        slot.owner, slot.index, cause
    ));
    report.delivery = Delivery::Failed;
    report.released = release(session, slot, ReleaseKind::Abandoned)?;
    Ok(report)
}

fn wait_for_ack(ack: &NamedSemaphore, poll: Duration, ack_timeout: Duration, token: &ShutdownToken) -> Result<Delivery> {
    let deadline = Instant::now() + ack_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if ack.wait_timeout(poll.min(remaining))? == WaitOutcome::Acquired {
            return Ok(Delivery::Acknowledged);
        }
        if token.is_requested() || Instant::now() >= deadline {
            return Ok(Delivery::AckAbandoned);
        }
    }
}

fn release(session: &Session, slot: &SlotView, kind: ReleaseKind) -> Result<bool> {
    session
        .arena()
        .with_table_lock(|table| table.release(slot.index, slot.attempt, kind))?
}

/// What the student's grade wait produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeWait {
    /// The grade channel fired; the value may be the sentinel
    Received(i32),
    /// The exam shut down and no grade arrived
    EndedBeforeGrading,
    /// The student's own interrupt fired first
    Interrupted,
}

/// Poll the grade channel until a grade, a shutdown or an interrupt
pub fn await_grade(
    session: &Session,
    claim: Claimed,
    channels: &AttemptChannels,
    poll: Duration,
    interrupt: &ShutdownToken,
) -> Result<GradeWait> {
    debug!(?claim, "await_grade: called");
    let arena = session.arena();
    loop {
        if channels.grade.wait_timeout(poll)? == WaitOutcome::Acquired {
            return received(session, claim);
        }
        if arena.is_shutting_down() {
            // The sentinel may have been posted right after our timeout
            if channels.grade.try_wait()? {
                return received(session, claim);
            }
            info!(?claim, "Exam ended before grading");
            return Ok(GradeWait::EndedBeforeGrading);
        }
        if interrupt.is_requested() {
            debug!(?claim, "await_grade: interrupted");
            return Ok(GradeWait::Interrupted);
        }
    }
}

/// Read the grade under the lock, if the slot still belongs to this attempt
///
/// After an abandoned acknowledgment the teacher releases the slot and a new
/// attempt may claim it; its grade is not ours to report.
fn received(session: &Session, claim: Claimed) -> Result<GradeWait> {
    let slot = session.arena().with_table_lock(|table| table.slot(claim.index))??;
    if slot.attempt != claim.attempt {
        warn!(?claim, attempt = slot.attempt, "Slot was reassigned before the grade was read");
        return Ok(GradeWait::EndedBeforeGrading);
    }
    debug!(?claim, grade = slot.grade, "await_grade: received");
    Ok(GradeWait::Received(slot.grade))
}

/// Confirm a real grade and give the slot back
///
/// Returns whether this call released the slot (the teacher may have done it
/// first once the ack landed). The slot is released even if the ack cannot be
/// signaled.
pub fn acknowledge(session: &Session, claim: Claimed, channels: &AttemptChannels) -> Result<bool> {
    debug!(?claim, "acknowledge: called");
    let signaled = channels.ack.signal();
    let released = session
        .arena()
        .with_table_lock(|table| table.release(claim.index, claim.attempt, ReleaseKind::Delivered))??;
    if let Err(e) = signaled {
        warn!(?claim, error = %e, "Failed to signal acknowledgment");
        return Err(e);
    }
    Ok(released)
}

/// Give the slot back after a sentinel or an unfinished wait, without an ack
pub fn abandon(session: &Session, claim: Claimed) -> Result<bool> {
    debug!(?claim, "abandon: called");
    session
        .arena()
        .with_table_lock(|table| table.release(claim.index, claim.attempt, ReleaseKind::Abandoned))?
}

/// Pass `result` through, abandoning the slot first if it is an error
pub fn abandon_on_error<T>(session: &Session, claim: Claimed, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        warn!(?claim, error = %e, "Attempt failed, releasing slot");
        if let Err(release_err) = abandon(session, claim) {
            warn!(?claim, error = %release_err, "Failed to release slot");
        }
    }
    result
}

/// `true` if `grade` means the exam was terminated
pub fn is_sentinel(grade: i32) -> bool {
    grade == SENTINEL_GRADE
}
