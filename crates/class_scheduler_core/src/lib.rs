pub mod attendance;
pub mod curriculum;
pub mod domain;
pub mod error;
pub mod generator;
pub mod ledger;
pub mod locks;
pub mod memory;
pub mod ports;
pub mod schedule;
pub mod service;

pub use attendance::{
    AttendanceStats, AttendanceSubmission, LedgerOutcome, Reconciliation, StudentFailure,
    StudentLedgerResult,
};
pub use domain::{
    AttendanceNotice, AttendanceRecord, AttendanceStatus, CreditAccount, CreditLedgerStats,
    CreditPackage, Curriculum, Group, LedgerEntry, LedgerEntryKind, Lesson, Module,
    PackageStatus, Session, SessionStatus, ThresholdBucket, ThresholdEvent, WeeklyPattern,
};
pub use error::{GenerationError, LedgerError, ReconcileError, ScheduleViolation};
pub use generator::GenerationOutcome;
pub use ledger::{classify, LedgerReceipt, LOW_BALANCE_THRESHOLD_HOURS, SESSION_CHARGE_HOURS};
pub use ports::{AutomationTrigger, LedgerMutation, PortError, PortResult, SchedulingStore};
pub use service::{SchedulerService, SchedulerSettings};
