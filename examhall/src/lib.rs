//! ExamHall - teacher/student exam coordination across processes
//!
//! One teacher process creates a shared slot table; student processes attach,
//! claim a slot, and wait for a grade. All coordination goes through shared
//! memory and named POSIX semaphores; a FIFO carries a best-effort log
//! broadcast for observers.
//!
//! # Modules
//!
//! - [`sync`] - named semaphores, per-attempt channels, resource ledger
//! - [`arena`] - shared slot table, table lock, slot state machine
//! - [`protocol`] - registration, grading and shutdown handshakes
//! - [`participant`] - session context, coordinator and student
//! - [`logsink`] / [`observer`] - log broadcast and its watcher
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

#[cfg(not(target_os = "linux"))]
compile_error!("examhall requires Linux (named POSIX semaphores with sem_timedwait)");

pub mod arena;
pub mod cli;
pub mod config;
pub mod error;
pub mod logsink;
pub mod names;
pub mod observer;
pub mod participant;
pub mod protocol;
pub mod sync;

pub use arena::{
    ArenaSnapshot, Claimed, MAX_CAPACITY, ReleaseKind, SENTINEL_GRADE, SharedArena, SlotState, SlotView, TableGuard,
};
pub use config::Config;
pub use error::{ExamError, Result};
pub use logsink::{LogSink, Role};
pub use names::Names;
pub use participant::{
    Coordinator, CoordinatorConfig, Grader, RandomGrader, RunSummary, Session, Step, Student, StudentConfig,
    StudentOutcome, TeardownReport,
};
pub use protocol::{Delivery, GradeReport, GradeWait, Registration, ShutdownHandle, ShutdownReport, ShutdownToken};
pub use sync::{AttemptChannels, NamedSemaphore, ResourceLedger, WaitOutcome};
