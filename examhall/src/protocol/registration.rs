//! Registration: a student claims a slot
//!
//! The attempt channels must exist before the claim so that the teacher can
//! open them as soon as the slot is visible.

use tracing::{debug, warn};

use crate::arena::{Claimed, ReleaseKind};
use crate::error::Result;
use crate::participant::Session;
use crate::sync::AttemptChannels;

/// Result of one registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Slot claimed and the teacher notified
    Registered(Claimed),
    /// Every slot is taken
    NoFreeSlot,
    /// The exam is over; nothing was claimed
    ShuttingDown,
}

/// Claim the first empty slot and signal the work-ready counter
///
/// The counter is signaled after the table lock is released.
pub fn register(session: &Session, owner: u32, ticket: u32, channels: &AttemptChannels) -> Result<Registration> {
    debug!(owner, ticket, "register: called");
    let arena = session.arena();

    let registration = arena.with_table_lock(|table| -> Result<Registration> {
        if table.is_shutting_down() {
            return Ok(Registration::ShuttingDown);
        }
        let claim = table.claim_first_empty(owner, ticket, channels.grade.name(), channels.ack.name())?;
        Ok(claim.map_or(Registration::NoFreeSlot, Registration::Registered))
    })??;

    if let Registration::Registered(claim) = registration {
        if let Err(e) = arena.work_ready().signal() {
            // The teacher's bounded poll still finds the slot on its next scan
            warn!(slot = claim.index, error = %e, "Failed to signal work-ready counter");
        }
    }
    debug!(?registration, "register: done");
    Ok(registration)
}

/// Give a claimed slot back without a grade
///
/// Returns `false` if the slot had already been released for this attempt.
pub fn withdraw(session: &Session, claim: Claimed) -> Result<bool> {
    debug!(?claim, "withdraw: called");
    session
        .arena()
        .with_table_lock(|table| table.release(claim.index, claim.attempt, ReleaseKind::Abandoned))?
}
