//! Teacher: owns the arena, grades students, shuts the exam down

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::grader::Grader;
use super::session::Session;
use crate::arena::{ReleaseKind, SharedArena, SlotState};
use crate::config::TimingConfig;
use crate::error::Result;
use crate::logsink::LogSink;
use crate::names::Names;
use crate::protocol::{
    Delivery, GradeReport, ShutdownHandle, ShutdownReport, ShutdownToken, deliver, select_next, shutdown,
};
use crate::sync::{ResourceLedger, semaphore};

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Teacher-side timing and limits
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    pub ack_timeout: Duration,
    pub drain_timeout: Duration,
    pub lock_probe: Duration,
    /// Shut the exam down after this many students were processed
    pub max_students: Option<usize>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_timing(&TimingConfig::default())
    }
}

impl CoordinatorConfig {
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            poll_interval: timing.poll_interval(),
            ack_timeout: timing.ack_timeout(),
            drain_timeout: timing.drain_timeout(),
            lock_probe: timing.lock_probe(),
            max_students: None,
        }
    }

    pub fn with_max_students(mut self, max_students: Option<usize>) -> Self {
        self.max_students = max_students;
        self
    }
}

/// Result of one loop iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Woken (or timed out) with nothing to grade
    Idle,
    Graded(GradeReport),
    /// Shutdown was requested; the loop should end
    Stop,
}

/// What [`Coordinator::run`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub shutdown: ShutdownReport,
}

/// What [`Coordinator::teardown`] cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Slots still occupied after the drain timeout
    pub swept: Vec<usize>,
    /// `active_count` right before the names were unlinked
    pub final_active: u32,
}

/// The exam's single coordinator
pub struct Coordinator {
    session: Session,
    ledger: ResourceLedger,
    grader: Box<dyn Grader>,
    config: CoordinatorConfig,
    token: ShutdownToken,
    processed: usize,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("session", &self.session)
            .field("config", &self.config)
            .field("processed", &self.processed)
            .finish()
    }
}

impl Coordinator {
    /// Create the arena and announce readiness
    ///
    /// Capacity is validated before any name is created.
    pub fn create(
        names: &Names,
        capacity: u32,
        sink: LogSink,
        grader: impl Grader + 'static,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        debug!(?names, capacity, ?config, "Coordinator::create: called");
        let mut ledger = ResourceLedger::new();
        let arena = SharedArena::create(names, capacity, &mut ledger)?.with_lock_probe(config.lock_probe);
        let session = Session::new(arena, sink);
        session.log(format!("Ready. Capacity={}", capacity));
        info!(capacity, namespace = names.namespace(), "Teacher ready");

        Ok(Self {
            session,
            ledger,
            grader: Box::new(grader),
            config,
            token: ShutdownToken::new(),
            processed: 0,
        })
    }

    /// Notifier for signal handlers and other threads
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.token.clone(), self.session.arena().work_ready().clone())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Wait for work once and grade at most one student
    pub fn step(&mut self) -> Result<Step> {
        if self.token.is_requested() {
            return Ok(Step::Stop);
        }
        // Either outcome rescans: a lost signal is found by the next poll
        self.session.arena().work_ready().wait_timeout(self.config.poll_interval)?;
        if self.token.is_requested() {
            return Ok(Step::Stop);
        }

        let Some(slot) = select_next(&self.session)? else {
            return Ok(Step::Idle);
        };
        self.session.log(format!(
            "Grading student {} (ticket {}, slot {})",
            slot.owner, slot.ticket, slot.index
        ));
        let grade = self.grader.grade(&slot);

        let report = deliver(
            &self.session,
            &slot,
            grade,
            self.config.poll_interval,
            self.config.ack_timeout,
            &self.token,
        )?;

        if report.delivery != Delivery::Preempted {
            self.processed += 1;
            if self.config.max_students.is_some_and(|max| self.processed >= max) {
                info!(processed = self.processed, "All expected students processed");
                self.session.log(format!("All {} students processed", self.processed));
                self.token.request();
            }
        }
        Ok(Step::Graded(report))
    }

    /// Grade until shutdown is requested, then run the shutdown fan-out
    pub fn run(&mut self) -> Result<RunSummary> {
        debug!("Coordinator::run: called");
        let outcome = loop {
            match self.step() {
                Ok(Step::Stop) => break Ok(()),
                Ok(Step::Idle) => continue,
                Ok(Step::Graded(report)) => debug!(?report, "Coordinator::run: step done"),
                Err(e) => {
                    error!(error = %e, "Grading loop failed");
                    self.session.log(format!("Grading loop failed: {}", e));
                    self.token.request();
                    break Err(e);
                }
            }
        };

        let report = shutdown(&self.session)?;
        outcome?;
        Ok(RunSummary {
            processed: self.processed,
            shutdown: report,
        })
    }

    fn active_count(&self) -> Result<u32> {
        self.session.arena().with_table_lock(|table| table.active_count())
    }

    /// Drain, sweep vanished students and remove every name this teacher created
    pub fn teardown(self) -> Result<TeardownReport> {
        debug!("Coordinator::teardown: called");
        let deadline = Instant::now() + self.config.drain_timeout;
        while self.active_count()? > 0 && Instant::now() < deadline {
            thread::sleep(DRAIN_POLL);
        }

        let swept = self.session.arena().with_table_lock(|table| -> Result<Vec<usize>> {
            let mut swept = Vec::new();
            for index in 0..table.capacity() {
                let slot = table.slot(index)?;
                if slot.state == SlotState::Empty {
                    continue;
                }
                for name in [&slot.grade_channel, &slot.ack_channel] {
                    if let Err(e) = semaphore::unlink(name) {
                        warn!(%name, error = %e, "Failed to remove orphaned channel");
                    }
                }
                table.release(index, slot.attempt, ReleaseKind::Abandoned)?;
                swept.push(index);
            }
            Ok(swept)
        })??;
        if !swept.is_empty() {
            warn!(?swept, "Swept slots of students that never left");
        }

        let final_active = self.active_count()?;
        self.session.log("Exiting.");

        let Self {
            session, mut ledger, ..
        } = self;
        drop(session);
        ledger.release_all()?;

        info!(final_active, swept = swept.len(), "Teacher torn down");
        Ok(TeardownReport { swept, final_active })
    }
}
