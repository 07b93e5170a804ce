//! crates/class_scheduler_core/src/domain.rs
//!
//! Defines the pure, core data structures for group scheduling and the credit ledger.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type GroupId = Uuid;
pub type CourseId = Uuid;
pub type SessionId = Uuid;
pub type StudentId = Uuid;

/// Number of sessions a lesson takes when the curriculum does not say otherwise.
pub const DEFAULT_SESSIONS_REQUIRED: u32 = 2;

/// Returned when a stored enum value does not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

//=========================================================================================
// Curriculum
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lesson {
    pub title: String,
    pub sessions_required: u32,
}

impl Lesson {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            sessions_required: DEFAULT_SESSIONS_REQUIRED,
        }
    }

    pub fn with_sessions(title: impl Into<String>, sessions_required: u32) -> Self {
        Self {
            title: title.into(),
            sessions_required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub title: String,
    pub lessons: Vec<Lesson>,
}

/// The ordered modules of a course. Module and lesson order is used verbatim
/// when sessions are sequenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Curriculum {
    pub course_id: CourseId,
    pub modules: Vec<Module>,
}

impl Curriculum {
    /// Sum of `sessions_required` over every lesson of every module.
    pub fn total_sessions(&self) -> usize {
        self.modules
            .iter()
            .flat_map(|m| m.lessons.iter())
            .map(|l| l.sessions_required as usize)
            .sum()
    }

    /// True when there is nothing to schedule.
    pub fn is_empty(&self) -> bool {
        self.total_sessions() == 0
    }
}

//=========================================================================================
// Weekly pattern and groups
//=========================================================================================

/// A group's recurring day/time schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyPattern {
    pub start_date: NaiveDate,
    pub days_of_week: Vec<Weekday>,
    pub time_from: NaiveTime,
    pub time_to: NaiveTime,
    pub timezone: String,
}

impl WeeklyPattern {
    pub fn includes(&self, day: Weekday) -> bool {
        self.days_of_week.contains(&day)
    }
}

/// A class group as stored by the surrounding application.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub course_id: CourseId,
    pub pattern: WeeklyPattern,
}

//=========================================================================================
// Sessions and attendance
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Scheduled,
    Completed,
    Cancelled,
    Postponed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Postponed => "postponed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SessionStatus::Scheduled),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "postponed" => Ok(SessionStatus::Postponed),
            other => Err(ParseEnumError {
                kind: "session status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    /// Present and late students consume credit; absent and excused do not.
    pub fn is_attending(&self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Excused => "excused",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            "late" => Ok(AttendanceStatus::Late),
            "excused" => Ok(AttendanceStatus::Excused),
            other => Err(ParseEnumError {
                kind: "attendance status",
                value: other.to_string(),
            }),
        }
    }
}

/// One student's mark for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub student_id: StudentId,
    pub status: AttendanceStatus,
    pub notes: Option<String>,
    pub marked_at: DateTime<Utc>,
    pub marked_by: Option<Uuid>,
}

/// One concrete, dated class occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub group_id: GroupId,
    pub course_id: CourseId,
    pub module_index: usize,
    pub lesson_index: usize,
    /// 1-based position within the module.
    pub session_number: u32,
    pub scheduled_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: SessionStatus,
    pub attendance_taken: bool,
    pub attendance: Vec<AttendanceRecord>,
}

impl Session {
    /// Sessions that already happened or were acted on by an operator are
    /// never touched by regeneration. Taken attendance pins a session even
    /// while it is still `scheduled`, since ledger entries refer to it.
    pub fn is_preserved(&self, today: NaiveDate) -> bool {
        self.status != SessionStatus::Scheduled
            || self.attendance_taken
            || self.scheduled_date < today
    }

    /// The curriculum slot this session covers.
    pub fn slot_key(&self) -> (usize, u32) {
        (self.module_index, self.session_number)
    }
}

//=========================================================================================
// Credit packages and the ledger
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageStatus {
    Active,
    Expired,
    Cancelled,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Active => "active",
            PackageStatus::Expired => "expired",
            PackageStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for PackageStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PackageStatus::Active),
            "expired" => Ok(PackageStatus::Expired),
            "cancelled" => Ok(PackageStatus::Cancelled),
            other => Err(ParseEnumError {
                kind: "package status",
                value: other.to_string(),
            }),
        }
    }
}

/// A student's prepaid hour balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditPackage {
    pub id: Uuid,
    pub total_hours: u32,
    pub remaining_hours: u32,
    pub status: PackageStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreditLedgerStats {
    pub total_hours_used: u32,
    pub total_hours_remaining: u32,
    pub total_sessions_attended: u32,
}

/// Everything the ledger reads for one student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditAccount {
    pub student_id: StudentId,
    pub package: Option<CreditPackage>,
    pub stats: CreditLedgerStats,
}

impl CreditAccount {
    pub fn active_package(&self) -> Option<&CreditPackage> {
        self.package
            .as_ref()
            .filter(|p| p.status == PackageStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEntryKind {
    Charge,
    Refund,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Charge => "charge",
            LedgerEntryKind::Refund => "refund",
        }
    }
}

impl FromStr for LedgerEntryKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "charge" => Ok(LedgerEntryKind::Charge),
            "refund" => Ok(LedgerEntryKind::Refund),
            other => Err(ParseEnumError {
                kind: "ledger entry kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Audit row written with every applied charge or refund.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub student_id: StudentId,
    /// The package whose balance this entry moved.
    pub package_id: Uuid,
    pub session_id: SessionId,
    pub group_id: GroupId,
    pub kind: LedgerEntryKind,
    pub hours: u32,
    pub balance_after: u32,
    pub reason: String,
    pub actor: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Threshold events and notices for the automation boundary
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThresholdBucket {
    Normal,
    Low,
    Zero,
}

impl ThresholdBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdBucket::Normal => "normal",
            ThresholdBucket::Low => "low",
            ThresholdBucket::Zero => "zero",
        }
    }
}

/// A student whose balance landed in the low or zero bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdEvent {
    pub student_id: StudentId,
    pub session_id: SessionId,
    pub group_id: GroupId,
    pub bucket: ThresholdBucket,
    pub remaining_hours: u32,
}

/// A student whose attendance status changed in a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceNotice {
    pub student_id: StudentId,
    pub session_id: SessionId,
    pub group_id: GroupId,
    pub status: AttendanceStatus,
}
