//! crates/class_scheduler_core/src/ports.rs
//!
//! Defines the service contracts (traits) the scheduling core depends on.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the concrete document store and notification pipeline.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{
    AttendanceNotice, AttendanceRecord, CourseId, CreditAccount, CreditLedgerStats, CreditPackage,
    Curriculum, Group, GroupId, LedgerEntry, Session, SessionId, StudentId, ThresholdEvent,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    /// A conditional write lost against a concurrent writer.
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Port Payloads
//=========================================================================================

/// A single balance change, applied by the store only if the stored
/// `remaining_hours` still equals `expected_remaining`.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerMutation {
    pub student_id: StudentId,
    pub package_id: Uuid,
    pub expected_remaining: u32,
    pub new_remaining: u32,
    pub stats: CreditLedgerStats,
    pub entry: LedgerEntry,
}

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait SchedulingStore: Send + Sync {
    // --- Groups and courses ---
    async fn get_group(&self, group_id: GroupId) -> PortResult<Group>;

    async fn get_curriculum(&self, course_id: CourseId) -> PortResult<Curriculum>;

    // --- Sessions ---
    /// All sessions of a group with their attendance, ordered by date.
    async fn list_group_sessions(&self, group_id: GroupId) -> PortResult<Vec<Session>>;

    /// Deletes `retired` and inserts `fresh` as one atomic unit. On error
    /// the group's sessions are left exactly as they were. Returns
    /// `PortError::Conflict` if a retired session was completed, cancelled or
    /// had attendance taken since it was read.
    async fn replace_group_sessions(
        &self,
        group_id: GroupId,
        retired: &[SessionId],
        fresh: &[Session],
    ) -> PortResult<()>;

    async fn get_session(&self, session_id: SessionId) -> PortResult<Session>;

    /// Replaces the session's attendance set and marks attendance as taken.
    async fn save_attendance(
        &self,
        session_id: SessionId,
        records: &[AttendanceRecord],
    ) -> PortResult<()>;

    // --- Credit ledger ---
    /// Package and running totals for a student. A student without a package
    /// yields an account whose `package` is `None`.
    async fn get_credit_account(&self, student_id: StudentId) -> PortResult<CreditAccount>;

    /// A single package of the student's, whatever its status.
    async fn get_package(
        &self,
        student_id: StudentId,
        package_id: Uuid,
    ) -> PortResult<CreditPackage>;

    /// When the net ledger effect for this (student, session) pair is a charge,
    /// the package that charge was taken from.
    async fn charged_package(
        &self,
        student_id: StudentId,
        session_id: SessionId,
    ) -> PortResult<Option<Uuid>>;

    /// Applies the balance change and appends the audit entry atomically.
    /// Returns `PortError::Conflict` if the stored balance moved.
    async fn apply_ledger_mutation(&self, mutation: &LedgerMutation) -> PortResult<()>;

    /// Ledger entries for a student, newest first.
    async fn list_ledger_entries(&self, student_id: StudentId) -> PortResult<Vec<LedgerEntry>>;
}

/// The automation boundary. Implementations decide whether and how a message
/// is composed or sent; the core only hands over the facts.
#[async_trait]
pub trait AutomationTrigger: Send + Sync {
    async fn credit_thresholds_reached(&self, events: &[ThresholdEvent]) -> PortResult<()>;

    async fn attendance_recorded(&self, notices: &[AttendanceNotice]) -> PortResult<()>;
}
