//! Grading policies

use std::ops::RangeInclusive;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::arena::SlotView;

/// Computes a grade for a slot the teacher has selected
///
/// Runs outside the table lock and may block to simulate work.
pub trait Grader: Send {
    fn grade(&mut self, slot: &SlotView) -> i32;
}

impl<F> Grader for F
where
    F: FnMut(&SlotView) -> i32 + Send,
{
    fn grade(&mut self, slot: &SlotView) -> i32 {
        self(slot)
    }
}

/// Sleeps a random latency, then draws a random grade
#[derive(Debug, Clone)]
pub struct RandomGrader {
    latency_ms: RangeInclusive<u64>,
    grades: RangeInclusive<i32>,
}

impl RandomGrader {
    pub fn new(latency_ms: RangeInclusive<u64>, grades: RangeInclusive<i32>) -> Self {
        Self { latency_ms, grades }
    }
}

impl Grader for RandomGrader {
    fn grade(&mut self, slot: &SlotView) -> i32 {
        let mut rng = rand::rng();
        let latency = Duration::from_millis(rng.random_range(self.latency_ms.clone()));
        let grade = rng.random_range(self.grades.clone());
        debug!(slot = slot.index, ticket = slot.ticket, ?latency, grade, "RandomGrader::grade");
        thread::sleep(latency);
        grade
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::SlotState;

    fn view(ticket: u32) -> SlotView {
        SlotView {
            index: 0,
            state: SlotState::Processing,
            owner: 1,
            ticket,
            grade: 0,
            attempt: 1,
            grade_channel: "/g".to_string(),
            ack_channel: "/a".to_string(),
        }
    }

    #[test]
    fn test_random_grader_stays_in_range() {
        let mut grader = RandomGrader::new(0..=0, 3..=5);
        for _ in 0..50 {
            assert!((3..=5).contains(&grader.grade(&view(1))));
        }
    }

    #[test]
    fn test_closure_grader() {
        let mut grader = |slot: &SlotView| (slot.ticket % 3) as i32 + 3;
        assert_eq!(Grader::grade(&mut grader, &view(7)), 4);
    }
}
