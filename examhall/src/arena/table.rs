//! Slot-table operations available while holding the table lock

use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SharedArena;
use super::layout::{SlotRecord, read_name, write_name};
use super::slot::{Claimed, ReleaseKind, SlotState, SlotView, check_transition};
use crate::error::{ExamError, Result};
use crate::names::CHANNEL_NAME_LEN;

/// Whole-table copy for inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaSnapshot {
    pub capacity: usize,
    pub active_count: u32,
    pub shutting_down: bool,
    pub slots: Vec<SlotView>,
}

impl ArenaSnapshot {
    /// Slots that are not `Empty`
    pub fn occupied(&self) -> impl Iterator<Item = &SlotView> {
        self.slots.iter().filter(|s| s.state != SlotState::Empty)
    }
}

/// Exclusive access to the slot table; releases the lock on drop
pub struct TableGuard<'a> {
    arena: &'a SharedArena,
}

impl<'a> TableGuard<'a> {
    pub(super) fn new(arena: &'a SharedArena) -> Self {
        Self { arena }
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn active_count(&self) -> u32 {
        self.arena.header().active_count.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.arena.is_shutting_down()
    }

    /// Set the sticky shutdown flag; returns `true` if this call set it
    pub fn mark_shutting_down(&mut self) -> bool {
        !self.arena.header().shutting_down.swap(true, Ordering::AcqRel)
    }

    pub fn state(&self, index: usize) -> Result<SlotState> {
        let record = self.arena.record(index)?;
        load_state(record)
    }

    pub fn slot(&self, index: usize) -> Result<SlotView> {
        let record = self.arena.record(index)?;
        Ok(SlotView {
            index,
            state: load_state(record)?,
            owner: record.owner.load(Ordering::Acquire),
            ticket: record.ticket.load(Ordering::Acquire),
            grade: record.grade.load(Ordering::Acquire),
            attempt: record.attempt.load(Ordering::Acquire),
            // SAFETY: the guard holds the table lock.
            grade_channel: unsafe { read_name(&record.grade_channel) },
            ack_channel: unsafe { read_name(&record.ack_channel) },
        })
    }

    fn set_state(&mut self, index: usize, to: SlotState) -> Result<()> {
        let record = self.arena.record(index)?;
        let from = load_state(record)?;
        check_transition(from, to)?;
        record.state.store(to.as_raw(), Ordering::Release);
        debug!(index, %from, %to, "slot transition");
        Ok(())
    }

    /// Move the first `Empty` slot to `Waiting` and fill in the attempt
    ///
    /// Returns `None` when every slot is taken.
    pub fn claim_first_empty(
        &mut self,
        owner: u32,
        ticket: u32,
        grade_channel: &str,
        ack_channel: &str,
    ) -> Result<Option<Claimed>> {
        for name in [grade_channel, ack_channel] {
            if name.len() >= CHANNEL_NAME_LEN {
                return Err(ExamError::InvalidName {
                    name: name.to_string(),
                    reason: format!("does not fit the {} byte slot field", CHANNEL_NAME_LEN),
                });
            }
        }

        for index in 0..self.capacity() {
            if self.state(index)? != SlotState::Empty {
                continue;
            }
            self.set_state(index, SlotState::Waiting)?;

            let header = self.arena.header();
            let attempt = header.next_attempt.fetch_add(1, Ordering::AcqRel) + 1;
            let record = self.arena.record(index)?;
            record.owner.store(owner, Ordering::Release);
            record.ticket.store(ticket, Ordering::Release);
            record.grade.store(0, Ordering::Release);
            record.attempt.store(attempt, Ordering::Release);
            // SAFETY: the guard holds the table lock.
            unsafe {
                write_name(&record.grade_channel, grade_channel);
                write_name(&record.ack_channel, ack_channel);
            }
            header.active_count.fetch_add(1, Ordering::AcqRel);

            return Ok(Some(Claimed { index, attempt }));
        }
        Ok(None)
    }

    /// Move the lowest-index `Waiting` slot to `Processing`
    pub fn select_first_waiting(&mut self) -> Result<Option<SlotView>> {
        for index in 0..self.capacity() {
            if self.state(index)? == SlotState::Waiting {
                self.set_state(index, SlotState::Processing)?;
                return self.slot(index).map(Some);
            }
        }
        Ok(None)
    }

    /// Write a grade while holding the lock (shutdown sentinel)
    pub fn set_grade(&mut self, index: usize, grade: i32) -> Result<()> {
        self.arena.record(index)?.grade.store(grade, Ordering::Release);
        Ok(())
    }

    /// Slots currently `Waiting` or `Processing`
    pub fn pending(&self) -> Result<Vec<SlotView>> {
        let mut pending = Vec::new();
        for index in 0..self.capacity() {
            if self.state(index)?.is_pending() {
                pending.push(self.slot(index)?);
            }
        }
        Ok(pending)
    }

    /// Hand a slot back to `Empty`, folding through the release marker
    ///
    /// Only the attempt that claimed the slot can release it: if the slot is
    /// already empty or was reclaimed by a later attempt this is a no-op and
    /// returns `false`.
    pub fn release(&mut self, index: usize, attempt: u64, kind: ReleaseKind) -> Result<bool> {
        let record = self.arena.record(index)?;
        let state = load_state(record)?;
        if state == SlotState::Empty || record.attempt.load(Ordering::Acquire) != attempt {
            debug!(index, attempt, %state, "release: slot no longer held by this attempt");
            return Ok(false);
        }

        self.set_state(index, kind.marker())?;
        self.set_state(index, SlotState::Empty)?;

        record.owner.store(0, Ordering::Release);
        record.ticket.store(0, Ordering::Release);
        // SAFETY: the guard holds the table lock.
        unsafe {
            write_name(&record.grade_channel, "");
            write_name(&record.ack_channel, "");
        }
        self.arena.header().active_count.fetch_sub(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Verify `active_count` matches the number of non-empty slots
    pub fn audit(&self) -> Result<()> {
        let mut occupied = 0u32;
        for index in 0..self.capacity() {
            if self.state(index)? != SlotState::Empty {
                occupied += 1;
            }
        }
        let active = self.active_count();
        if occupied == active {
            Ok(())
        } else {
            Err(ExamError::CorruptLayout(format!(
                "active count {} but {} occupied slots",
                active, occupied
            )))
        }
    }

    pub fn snapshot(&self) -> Result<ArenaSnapshot> {
        let slots = (0..self.capacity()).map(|i| self.slot(i)).collect::<Result<Vec<_>>>()?;
        Ok(ArenaSnapshot {
            capacity: self.capacity(),
            active_count: self.active_count(),
            shutting_down: self.is_shutting_down(),
            slots,
        })
    }
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        self.arena.unlock();
    }
}

fn load_state(record: &SlotRecord) -> Result<SlotState> {
    let raw = record.state.load(Ordering::Acquire);
    SlotState::from_raw(raw).ok_or_else(|| ExamError::CorruptLayout(format!("unknown slot state {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::Names;
    use crate::sync::ResourceLedger;

    fn arena(capacity: u32) -> (SharedArena, ResourceLedger) {
        let id = uuid::Uuid::now_v7().simple().to_string();
        let names = Names::new(format!("tbl{}", &id[id.len() - 8..])).unwrap();
        let mut ledger = ResourceLedger::new();
        let arena = SharedArena::create(&names, capacity, &mut ledger).unwrap();
        (arena, ledger)
    }

    #[test]
    fn test_claim_fills_lowest_empty_slot() {
        let (arena, _ledger) = arena(2);
        arena
            .with_table_lock(|t| {
                let first = t.claim_first_empty(10, 7, "/g1", "/a1").unwrap().unwrap();
                let second = t.claim_first_empty(11, 8, "/g2", "/a2").unwrap().unwrap();
                assert_eq!(first.index, 0);
                assert_eq!(second.index, 1);
                assert_ne!(first.attempt, second.attempt);
                assert!(t.claim_first_empty(12, 9, "/g3", "/a3").unwrap().is_none());

                let view = t.slot(1).unwrap();
                assert_eq!(view.state, SlotState::Waiting);
                assert_eq!(view.owner, 11);
                assert_eq!(view.ticket, 8);
                assert_eq!(view.grade_channel, "/g2");
                assert_eq!(view.ack_channel, "/a2");
                assert_eq!(t.active_count(), 2);
                t.audit().unwrap();
            })
            .unwrap();
    }

    #[test]
    fn test_select_is_index_ordered() {
        let (arena, _ledger) = arena(3);
        arena
            .with_table_lock(|t| {
                let a = t.claim_first_empty(1, 1, "/g1", "/a1").unwrap().unwrap();
                t.claim_first_empty(2, 2, "/g2", "/a2").unwrap().unwrap();
                // Free slot 0, then a newcomer takes it back: index order wins over arrival
                t.release(a.index, a.attempt, ReleaseKind::Abandoned).unwrap();
                t.claim_first_empty(3, 3, "/g3", "/a3").unwrap().unwrap();

                let picked = t.select_first_waiting().unwrap().unwrap();
                assert_eq!(picked.index, 0);
                assert_eq!(picked.owner, 3);
                assert_eq!(picked.state, SlotState::Processing);

                let next = t.select_first_waiting().unwrap().unwrap();
                assert_eq!(next.index, 1);
                assert!(t.select_first_waiting().unwrap().is_none());
            })
            .unwrap();
    }

    #[test]
    fn test_release_is_once_per_attempt() {
        let (arena, _ledger) = arena(1);
        arena
            .with_table_lock(|t| {
                let claim = t.claim_first_empty(1, 1, "/g", "/a").unwrap().unwrap();
                t.select_first_waiting().unwrap().unwrap();

                assert!(t.release(claim.index, claim.attempt, ReleaseKind::Delivered).unwrap());
                assert!(!t.release(claim.index, claim.attempt, ReleaseKind::Delivered).unwrap());
                assert_eq!(t.active_count(), 0);

                // A stale release must not evict the next attempt
                let next = t.claim_first_empty(2, 2, "/g", "/a").unwrap().unwrap();
                assert!(!t.release(next.index, claim.attempt, ReleaseKind::Abandoned).unwrap());
                assert_eq!(t.state(0).unwrap(), SlotState::Waiting);
                t.audit().unwrap();
            })
            .unwrap();
    }

    #[test]
    fn test_delivered_release_requires_processing() {
        let (arena, _ledger) = arena(1);
        arena
            .with_table_lock(|t| {
                let claim = t.claim_first_empty(1, 1, "/g", "/a").unwrap().unwrap();
                let err = t.release(claim.index, claim.attempt, ReleaseKind::Delivered).unwrap_err();
                assert!(matches!(
                    err,
                    ExamError::InvalidTransition {
                        from: SlotState::Waiting,
                        to: SlotState::Done
                    }
                ));
            })
            .unwrap();
    }

    #[test]
    fn test_mark_shutting_down_is_sticky() {
        let (arena, _ledger) = arena(1);
        arena
            .with_table_lock(|t| {
                assert!(t.mark_shutting_down());
                assert!(!t.mark_shutting_down());
                assert!(t.is_shutting_down());
            })
            .unwrap();
        assert!(arena.is_shutting_down());
    }

    #[test]
    fn test_snapshot_lists_occupied_slots() {
        let (arena, _ledger) = arena(3);
        let snapshot = arena
            .with_table_lock(|t| {
                t.claim_first_empty(5, 42, "/g", "/a").unwrap();
                t.snapshot().unwrap()
            })
            .unwrap();
        assert_eq!(snapshot.capacity, 3);
        assert_eq!(snapshot.active_count, 1);
        let occupied: Vec<_> = snapshot.occupied().collect();
        assert_eq!(occupied.len(), 1);
        assert_eq!(occupied[0].ticket, 42);
    }

    #[test]
    fn test_rejects_oversized_channel_names() {
        let (arena, _ledger) = arena(1);
        let long = format!("/{}", "x".repeat(CHANNEL_NAME_LEN));
        arena
            .with_table_lock(|t| {
                assert!(t.claim_first_empty(1, 1, &long, "/a").is_err());
                assert_eq!(t.active_count(), 0);
            })
            .unwrap();
    }
}
