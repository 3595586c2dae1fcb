//! Exam participants
//!
//! A [`Session`] is the explicit context every protocol call runs against.
//! The teacher is a [`Coordinator`]; each worker attempt is a [`Student`].

pub mod coordinator;
pub mod grader;
pub mod session;
pub mod student;

pub use coordinator::{Coordinator, CoordinatorConfig, RunSummary, Step, TeardownReport};
pub use grader::{Grader, RandomGrader};
pub use session::Session;
pub use student::{Student, StudentConfig, StudentOutcome};
