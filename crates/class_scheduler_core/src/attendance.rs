//! crates/class_scheduler_core/src/attendance.rs
//!
//! Reconciles one session's attendance submission against what was stored
//! before, and drives the credit ledger only for genuine status transitions.
//!
//! | previous        | new present/late | new absent/excused |
//! |-----------------|------------------|--------------------|
//! | none            | charge           | nothing            |
//! | present/late    | nothing          | refund             |
//! | absent/excused  | charge           | nothing            |

use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{
    AttendanceNotice, AttendanceRecord, AttendanceStatus, GroupId, LedgerEntryKind, SessionId,
    SessionStatus, StudentId, ThresholdBucket, ThresholdEvent,
};
use crate::error::{LedgerError, ReconcileError};
use crate::ledger::{classify, CreditLedger, LedgerContext, LedgerReceipt, SESSION_CHARGE_HOURS};
use crate::locks::KeyedLocks;
use crate::ports::{PortError, SchedulingStore};

/// One student's line in an attendance submission.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceSubmission {
    pub student_id: StudentId,
    pub status: AttendanceStatus,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Charge,
    Refund,
    None,
}

pub fn transition(previous: Option<AttendanceStatus>, new: AttendanceStatus) -> Transition {
    let was_attending = previous.map(|s| s.is_attending()).unwrap_or(false);
    match (was_attending, new.is_attending()) {
        (false, true) => Transition::Charge,
        (true, false) => Transition::Refund,
        _ => Transition::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Charged,
    Refunded,
    /// Status did not change, or changed without a ledger effect.
    Unchanged,
    /// The ledger already reflected this session for the student.
    AlreadyApplied,
}

impl LedgerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOutcome::Charged => "charged",
            LedgerOutcome::Refunded => "refunded",
            LedgerOutcome::Unchanged => "unchanged",
            LedgerOutcome::AlreadyApplied => "already_applied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentLedgerResult {
    pub student_id: StudentId,
    pub outcome: LedgerOutcome,
    pub new_balance: Option<u32>,
    pub threshold: Option<ThresholdBucket>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentFailure {
    pub student_id: StudentId,
    pub error: LedgerError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttendanceStats {
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub excused: usize,
}

impl AttendanceStats {
    fn count(submissions: &[AttendanceSubmission]) -> Self {
        let mut stats = Self::default();
        for s in submissions {
            match s.status {
                AttendanceStatus::Present => stats.present += 1,
                AttendanceStatus::Absent => stats.absent += 1,
                AttendanceStatus::Late => stats.late += 1,
                AttendanceStatus::Excused => stats.excused += 1,
            }
        }
        stats
    }
}

/// Everything a submission did. Threshold events and notices are returned
/// for the caller to dispatch; the engine itself sends nothing.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub session_id: SessionId,
    pub group_id: GroupId,
    pub stats: AttendanceStats,
    pub ledger_results: Vec<StudentLedgerResult>,
    pub partial_failures: Vec<StudentFailure>,
    pub threshold_events: Vec<ThresholdEvent>,
    pub notices: Vec<AttendanceNotice>,
}

impl Reconciliation {
    pub fn is_partial(&self) -> bool {
        !self.partial_failures.is_empty()
    }
}

/// One ledger call a submission needs. `settle` calls are refunds that are
/// expected to find nothing to reverse.
struct PendingCall {
    student_id: StudentId,
    kind: LedgerEntryKind,
    settle: bool,
}

impl PendingCall {
    fn transition(student_id: StudentId, kind: LedgerEntryKind) -> Self {
        Self {
            student_id,
            kind,
            settle: false,
        }
    }
}

pub struct AttendanceEngine {
    store: Arc<dyn SchedulingStore>,
    ledger: Arc<CreditLedger>,
    sessions: KeyedLocks<SessionId>,
}

impl AttendanceEngine {
    pub fn new(store: Arc<dyn SchedulingStore>, ledger: Arc<CreditLedger>) -> Self {
        Self {
            store,
            ledger,
            sessions: KeyedLocks::new(),
        }
    }

    pub async fn reconcile(
        &self,
        session_id: SessionId,
        submissions: Vec<AttendanceSubmission>,
        marked_by: Option<Uuid>,
    ) -> Result<Reconciliation, ReconcileError> {
        // One submission per session at a time: each one diffs against what
        // the previous one stored.
        let _guard = self.sessions.lock(&session_id).await;

        let session = self.store.get_session(session_id).await.map_err(|e| match e {
            PortError::NotFound(_) => ReconcileError::SessionNotFound(session_id),
            source => ReconcileError::Persistence {
                source,
                applied: Vec::new(),
                unconfirmed: Vec::new(),
            },
        })?;
        if session.status == SessionStatus::Cancelled {
            return Err(ReconcileError::SessionCancelled(session_id));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = submissions.iter().find(|s| !seen.insert(s.student_id)) {
            return Err(ReconcileError::DuplicateStudent(dup.student_id));
        }

        let previous: HashMap<StudentId, &AttendanceRecord> = session
            .attendance
            .iter()
            .map(|r| (r.student_id, r))
            .collect();

        let ctx = LedgerContext {
            session_id,
            group_id: session.group_id,
            reason: "attendance".to_string(),
            actor: marked_by,
        };

        let mut ledger_results = Vec::with_capacity(submissions.len());
        let mut notices = Vec::new();
        let mut pending = Vec::new();

        for sub in &submissions {
            let prev = previous.get(&sub.student_id).map(|r| r.status);
            if prev == Some(sub.status) {
                ledger_results.push(StudentLedgerResult {
                    student_id: sub.student_id,
                    outcome: LedgerOutcome::Unchanged,
                    new_balance: None,
                    threshold: None,
                });
                continue;
            }

            notices.push(AttendanceNotice {
                student_id: sub.student_id,
                session_id,
                group_id: session.group_id,
                status: sub.status,
            });

            match transition(prev, sub.status) {
                Transition::Charge => pending.push(PendingCall::transition(sub.student_id, LedgerEntryKind::Charge)),
                Transition::Refund => pending.push(PendingCall::transition(sub.student_id, LedgerEntryKind::Refund)),
                // Not attending either way, but a charge can outlive a record
                // that an earlier submission dropped.
                Transition::None if !sub.status.is_attending() => pending.push(PendingCall {
                    student_id: sub.student_id,
                    kind: LedgerEntryKind::Refund,
                    settle: true,
                }),
                Transition::None => ledger_results.push(StudentLedgerResult {
                    student_id: sub.student_id,
                    outcome: LedgerOutcome::Unchanged,
                    new_balance: None,
                    threshold: None,
                }),
            }
        }

        // The submission replaces the stored set, so attending students it
        // leaves out lose the record that paid for their charge.
        for record in &session.attendance {
            if !seen.contains(&record.student_id) && record.status.is_attending() {
                pending.push(PendingCall::transition(record.student_id, LedgerEntryKind::Refund));
            }
        }

        // Students are independent; the ledger serialises each one internally.
        let ledger = &self.ledger;
        let ctx_ref = &ctx;
        let outcomes = join_all(pending.into_iter().map(|call| async move {
            let result = match call.kind {
                LedgerEntryKind::Refund => ledger.refund(call.student_id, SESSION_CHARGE_HOURS, ctx_ref).await,
                LedgerEntryKind::Charge => ledger.charge(call.student_id, SESSION_CHARGE_HOURS, ctx_ref).await,
            };
            (call, result)
        }))
        .await;

        let mut applied: Vec<LedgerReceipt> = Vec::new();
        let mut unconfirmed = Vec::new();
        let mut partial_failures = Vec::new();
        let mut threshold_events = Vec::new();

        for (call, result) in outcomes {
            let student_id = call.student_id;
            match result {
                Ok(receipt) if call.settle && !receipt.applied => {
                    ledger_results.push(StudentLedgerResult {
                        student_id,
                        outcome: LedgerOutcome::Unchanged,
                        new_balance: None,
                        threshold: None,
                    });
                }
                Ok(receipt) => {
                    let outcome = match (receipt.applied, receipt.kind) {
                        (false, _) => LedgerOutcome::AlreadyApplied,
                        (true, LedgerEntryKind::Charge) => LedgerOutcome::Charged,
                        (true, LedgerEntryKind::Refund) => LedgerOutcome::Refunded,
                    };
                    let bucket = receipt.bucket();
                    if let Some(event) = threshold_crossing(&receipt, session_id, session.group_id) {
                        threshold_events.push(event);
                    }
                    ledger_results.push(StudentLedgerResult {
                        student_id,
                        outcome,
                        new_balance: Some(receipt.remaining_hours),
                        threshold: Some(bucket),
                    });
                    if receipt.applied {
                        applied.push(receipt);
                    }
                }
                Err(error) => {
                    match &error {
                        LedgerError::NoActivePackage(_) => {
                            warn!(%student_id, %session_id, "Student has no active credit package, attendance stored without charge")
                        }
                        LedgerError::InsufficientCredit { requested, remaining } => {
                            warn!(%student_id, %session_id, requested, remaining, "Insufficient credit, attendance stored without charge")
                        }
                        LedgerError::Persistence(e) => {
                            warn!(%student_id, %session_id, error = %e, "Ledger write not confirmed");
                            unconfirmed.push(student_id);
                        }
                    }
                    partial_failures.push(StudentFailure { student_id, error });
                }
            }
        }

        // A student whose ledger write is unconfirmed must keep the old
        // attendance, otherwise a retry would see no transition to apply.
        if let Some(first) = partial_failures.iter().find_map(|f| match &f.error {
            LedgerError::Persistence(e) => Some(e.clone()),
            _ => None,
        }) {
            return Err(ReconcileError::Persistence {
                source: first,
                applied,
                unconfirmed,
            });
        }

        let now = Utc::now();
        let records: Vec<AttendanceRecord> = submissions
            .iter()
            .map(|sub| match previous.get(&sub.student_id) {
                Some(prev) if prev.status == sub.status => AttendanceRecord {
                    notes: sub.notes.clone(),
                    ..(*prev).clone()
                },
                _ => AttendanceRecord {
                    student_id: sub.student_id,
                    status: sub.status,
                    notes: sub.notes.clone(),
                    marked_at: now,
                    marked_by,
                },
            })
            .collect();

        if let Err(source) = self.store.save_attendance(session_id, &records).await {
            warn!(%session_id, error = %source, "Attendance not stored after ledger updates");
            return Err(ReconcileError::Persistence {
                source,
                unconfirmed: Vec::new(),
                applied,
            });
        }

        let stats = AttendanceStats::count(&submissions);
        info!(
            %session_id,
            present = stats.present,
            absent = stats.absent,
            late = stats.late,
            excused = stats.excused,
            charged_or_refunded = applied.len(),
            failures = partial_failures.len(),
            "Attendance reconciled"
        );

        Ok(Reconciliation {
            session_id,
            group_id: session.group_id,
            stats,
            ledger_results,
            partial_failures,
            threshold_events,
            notices,
        })
    }
}

/// A charge that moved the balance into a lower bucket.
fn threshold_crossing(
    receipt: &LedgerReceipt,
    session_id: SessionId,
    group_id: GroupId,
) -> Option<ThresholdEvent> {
    if !receipt.applied || receipt.kind != LedgerEntryKind::Charge {
        return None;
    }
    let before = classify(receipt.remaining_hours + receipt.hours);
    let after = receipt.bucket();
    if after == ThresholdBucket::Normal || after == before {
        return None;
    }
    Some(ThresholdEvent {
        student_id: receipt.student_id,
        session_id,
        group_id,
        bucket: after,
        remaining_hours: receipt.remaining_hours,
    })
}
