//! The three exam handshakes
//!
//! - [`registration`] - a student claims a slot and wakes the teacher
//! - [`grading`] - the teacher delivers one grade and collects the ack
//! - [`shutdown`] - idempotent fan-out that unblocks every waiting party

pub mod grading;
pub mod registration;
pub mod shutdown;

pub use grading::{
    Delivery, GradeReport, GradeWait, abandon, abandon_on_error, acknowledge, await_grade, deliver, is_sentinel,
    select_next,
};
pub use registration::{Registration, register, withdraw};
pub use shutdown::{ShutdownHandle, ShutdownReport, ShutdownToken, shutdown};
