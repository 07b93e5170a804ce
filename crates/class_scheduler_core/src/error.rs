//! crates/class_scheduler_core/src/error.rs
//!
//! Error taxonomy for session generation, the credit ledger and attendance
//! reconciliation.

use chrono::{NaiveDate, NaiveTime, Weekday};

use crate::domain::{GroupId, SessionId, StudentId};
use crate::ledger::LedgerReceipt;
use crate::ports::PortError;

/// One broken weekly-pattern rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleViolation {
    #[error("a weekly pattern needs between 1 and 3 weekdays, got {0}")]
    DayCount(usize),
    #[error("weekday {0} is listed more than once")]
    DuplicateDay(Weekday),
    #[error("start date {date} falls on {weekday}, which is not one of the scheduled weekdays")]
    StartDayMismatch { date: NaiveDate, weekday: Weekday },
    #[error("class end time {to} is not after start time {from}")]
    TimeRange { from: NaiveTime, to: NaiveTime },
}

fn join_violations(violations: &[ScheduleViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Invalid schedule: {}", join_violations(.0))]
    InvalidSchedule(Vec<ScheduleViolation>),
    #[error("The course curriculum has no lessons to schedule")]
    EmptyCurriculum,
    #[error("Group {0} not found")]
    GroupNotFound(GroupId),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PortError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient credit: {requested}h requested, {remaining}h remaining")]
    InsufficientCredit { requested: u32, remaining: u32 },
    #[error("Student {0} has no active credit package")]
    NoActivePackage(StudentId),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PortError),
}

/// Hard failures of an attendance submission. Per-student credit problems are
/// reported in the reconciliation result instead.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Session {0} not found")]
    SessionNotFound(SessionId),
    #[error("Session {0} is cancelled and cannot take attendance")]
    SessionCancelled(SessionId),
    #[error("Student {0} appears more than once in the submission")]
    DuplicateStudent(StudentId),
    /// Ledger mutations in `applied` are confirmed; students in `unconfirmed`
    /// may or may not have been charged. Re-submitting is safe.
    #[error("Persistence error: {source}")]
    Persistence {
        source: PortError,
        applied: Vec<LedgerReceipt>,
        unconfirmed: Vec<StudentId>,
    },
}
