//! Student: prepares, registers, waits for a grade and leaves

use std::ops::RangeInclusive;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use super::session::Session;
use crate::arena::SharedArena;
use crate::config::Config;
use crate::error::Result;
use crate::logsink::LogSink;
use crate::names::Names;
use crate::protocol::{
    GradeWait, Registration, ShutdownToken, abandon, abandon_on_error, acknowledge, await_grade, is_sentinel, register,
    withdraw,
};
use crate::sync::AttemptChannels;

/// Student-side identity and timing
#[derive(Debug, Clone)]
pub struct StudentConfig {
    /// Recorded as the slot owner; the process id unless overridden
    pub owner: u32,
    pub poll_interval: Duration,
    pub prep_ms: RangeInclusive<u64>,
    pub ticket_max: u32,
}

impl StudentConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            owner: std::process::id(),
            poll_interval: config.timing.poll_interval(),
            prep_ms: config.timing.prep_range(),
            ticket_max: config.exam.ticket_max,
        }
    }

    pub fn with_owner(mut self, owner: u32) -> Self {
        self.owner = owner;
        self
    }
}

impl Default for StudentConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// How one attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudentOutcome {
    Graded { ticket: u32, grade: i32 },
    /// The teacher shut down and sent the sentinel
    Terminated { ticket: u32 },
    /// Shutdown was observed while waiting, without any grade
    EndedBeforeGrading { ticket: u32 },
    /// Interrupted locally after registering
    Withdrawn { ticket: u32 },
    NoFreeSlot { ticket: u32 },
    /// The exam was over before this student could register
    ExamClosed,
}

enum Preparation {
    Ready,
    Closed,
    Interrupted,
}

/// One worker attempt against an attached arena
#[derive(Debug)]
pub struct Student {
    session: Session,
    config: StudentConfig,
    interrupt: ShutdownToken,
}

impl Student {
    /// Attach to the running exam
    ///
    /// `NotFound` means no teacher is running.
    pub fn attach(names: &Names, sink: LogSink, config: StudentConfig) -> Result<Self> {
        let arena = SharedArena::attach(names)?;
        Ok(Self::new(Session::new(arena, sink), config))
    }

    pub fn new(session: Session, config: StudentConfig) -> Self {
        Self {
            session,
            config,
            interrupt: ShutdownToken::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Token that makes preparation and the grade wait give up early
    pub fn interrupt_token(&self) -> ShutdownToken {
        self.interrupt.clone()
    }

    /// Draw a ticket and a preparation time, then sit the exam
    pub fn run(&self) -> Result<StudentOutcome> {
        let mut rng = rand::rng();
        let ticket = rng.random_range(1..=self.config.ticket_max.max(1));
        let prep = Duration::from_millis(rng.random_range(self.config.prep_ms.clone()));
        self.run_with_ticket(ticket, prep)
    }

    pub fn run_with_ticket(&self, ticket: u32, prep: Duration) -> Result<StudentOutcome> {
        debug!(owner = self.config.owner, ticket, ?prep, "Student::run_with_ticket: called");
        self.session.log(format!("Preparing ticket {} for {} ms", ticket, prep.as_millis()));

        match self.prepare(prep) {
            Preparation::Ready => {}
            Preparation::Closed => {
                self.session.log("Exam closed during preparation");
                return Ok(StudentOutcome::ExamClosed);
            }
            Preparation::Interrupted => {
                self.session.log("Interrupted during preparation");
                return Ok(StudentOutcome::Withdrawn { ticket });
            }
        }

        // Dropped on every return below, which removes both names
        let channels = AttemptChannels::create(self.session.arena().names())?;

        let claim = match register(&self.session, self.config.owner, ticket, &channels)? {
            Registration::Registered(claim) => claim,
            Registration::NoFreeSlot => {
                self.session.log("No free slots, leaving");
                return Ok(StudentOutcome::NoFreeSlot { ticket });
            }
            Registration::ShuttingDown => {
                self.session.log("Exam is shutting down, not registering");
                return Ok(StudentOutcome::ExamClosed);
            }
        };
        self.session.log(format!("Registered in slot {} with ticket {}", claim.index, ticket));

        let wait = await_grade(
            &self.session,
            claim,
            &channels,
            self.config.poll_interval,
            &self.interrupt,
        );
        let outcome = match abandon_on_error(&self.session, claim, wait)? {
            GradeWait::Received(grade) if is_sentinel(grade) => {
                abandon(&self.session, claim)?;
                self.session.log("Teacher shutdown, no grade");
                StudentOutcome::Terminated { ticket }
            }
            GradeWait::Received(grade) => {
                acknowledge(&self.session, claim, &channels)?;
                self.session.log(format!("Received grade: {}", grade));
                StudentOutcome::Graded { ticket, grade }
            }
            GradeWait::EndedBeforeGrading => {
                abandon(&self.session, claim)?;
                self.session.log("Exam ended before grading");
                StudentOutcome::EndedBeforeGrading { ticket }
            }
            GradeWait::Interrupted => {
                if !withdraw(&self.session, claim)? {
                    warn!(?claim, "Slot was already released before withdrawing");
                }
                self.session.log("Interrupted, withdrawing");
                StudentOutcome::Withdrawn { ticket }
            }
        };
        info!(?outcome, "Student done");
        Ok(outcome)
    }

    fn prepare(&self, prep: Duration) -> Preparation {
        let deadline = Instant::now() + prep;
        loop {
            if self.interrupt.is_requested() {
                return Preparation::Interrupted;
            }
            if self.session.arena().is_shutting_down() {
                return Preparation::Closed;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Preparation::Ready;
            }
            thread::sleep(remaining.min(self.config.poll_interval));
        }
    }
}
