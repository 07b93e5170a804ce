//! crates/class_scheduler_core/src/service.rs
//!
//! The entry point the surrounding application talks to. Wires the generator,
//! ledger and attendance engine to one store, and forwards threshold events and
//! attendance notices to the automation boundary once an operation succeeds.

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::attendance::{AttendanceEngine, AttendanceSubmission, Reconciliation};
use crate::domain::{
    CreditAccount, Curriculum, GroupId, LedgerEntry, Session, SessionId, StudentId, WeeklyPattern,
};
use crate::error::{GenerationError, ReconcileError};
use crate::generator::{GenerationOutcome, SessionGenerator};
use crate::ledger::CreditLedger;
use crate::ports::{AutomationTrigger, PortError, PortResult, SchedulingStore};

/// Core-side knobs.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Retries for a ledger write that lost an optimistic balance check.
    pub ledger_retry_limit: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            ledger_retry_limit: 3,
        }
    }
}

pub struct SchedulerService {
    store: Arc<dyn SchedulingStore>,
    trigger: Arc<dyn AutomationTrigger>,
    generator: SessionGenerator,
    engine: AttendanceEngine,
}

impl SchedulerService {
    pub fn new(
        store: Arc<dyn SchedulingStore>,
        trigger: Arc<dyn AutomationTrigger>,
        settings: SchedulerSettings,
    ) -> Self {
        let ledger = Arc::new(CreditLedger::new(
            store.clone(),
            settings.ledger_retry_limit,
        ));
        Self {
            generator: SessionGenerator::new(store.clone()),
            engine: AttendanceEngine::new(store.clone(), ledger),
            store,
            trigger,
        }
    }

    // --- Operation boundaries ---

    pub async fn generate_sessions(
        &self,
        group_id: GroupId,
        curriculum: &Curriculum,
        pattern: &WeeklyPattern,
        today: NaiveDate,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.generator
            .generate(group_id, curriculum, pattern, today)
            .await
    }

    /// Generates from the group's stored course and weekly pattern.
    pub async fn activate_group(
        &self,
        group_id: GroupId,
        today: NaiveDate,
    ) -> Result<GenerationOutcome, GenerationError> {
        let group = self.store.get_group(group_id).await.map_err(|e| match e {
            PortError::NotFound(_) => GenerationError::GroupNotFound(group_id),
            other => GenerationError::Persistence(other),
        })?;
        let curriculum = self.store.get_curriculum(group.course_id).await?;
        self.generate_sessions(group_id, &curriculum, &group.pattern, today)
            .await
    }

    pub async fn submit_attendance(
        &self,
        session_id: SessionId,
        submissions: Vec<AttendanceSubmission>,
        marked_by: Option<Uuid>,
    ) -> Result<Reconciliation, ReconcileError> {
        let reconciliation = self
            .engine
            .reconcile(session_id, submissions, marked_by)
            .await?;
        self.dispatch(&reconciliation).await;
        Ok(reconciliation)
    }

    /// Trigger failures are logged, never surfaced: the attendance and ledger
    /// changes are already committed at this point.
    async fn dispatch(&self, reconciliation: &Reconciliation) {
        let session_id = reconciliation.session_id;
        if !reconciliation.threshold_events.is_empty() {
            if let Err(e) = self
                .trigger
                .credit_thresholds_reached(&reconciliation.threshold_events)
                .await
            {
                warn!(%session_id, error = %e, "Failed to hand threshold events to automation");
            }
        }
        if !reconciliation.notices.is_empty() {
            if let Err(e) = self
                .trigger
                .attendance_recorded(&reconciliation.notices)
                .await
            {
                warn!(%session_id, error = %e, "Failed to hand attendance notices to automation");
            }
        }
    }

    // --- Reads ---

    pub async fn group_sessions(&self, group_id: GroupId) -> PortResult<Vec<Session>> {
        self.store.list_group_sessions(group_id).await
    }

    pub async fn session(&self, session_id: SessionId) -> PortResult<Session> {
        self.store.get_session(session_id).await
    }

    pub async fn credit_account(&self, student_id: StudentId) -> PortResult<CreditAccount> {
        self.store.get_credit_account(student_id).await
    }

    pub async fn ledger_entries(&self, student_id: StudentId) -> PortResult<Vec<LedgerEntry>> {
        self.store.list_ledger_entries(student_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AttendanceStatus, Group, Lesson, Module, PackageStatus, ThresholdBucket,
    };
    use crate::memory::{InMemoryStore, RecordingTrigger};
    use chrono::{NaiveTime, Weekday};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn setup() -> (Arc<InMemoryStore>, Arc<RecordingTrigger>, SchedulerService, Group) {
        let store = Arc::new(InMemoryStore::new());
        let trigger = Arc::new(RecordingTrigger::new());
        let service = SchedulerService::new(store.clone(), trigger.clone(), SchedulerSettings::default());

        let curriculum = Curriculum {
            course_id: Uuid::new_v4(),
            modules: vec![
                Module {
                    title: "HTML".to_string(),
                    lessons: vec![Lesson::new("Tags"), Lesson::with_sessions("Forms", 1)],
                },
                Module {
                    title: "CSS".to_string(),
                    lessons: vec![Lesson::new("Selectors")],
                },
            ],
        };
        let group = Group {
            id: Uuid::new_v4(),
            course_id: curriculum.course_id,
            pattern: WeeklyPattern {
                start_date: date(2025, 3, 4),
                days_of_week: vec![Weekday::Tue, Weekday::Thu, Weekday::Sat],
                time_from: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                time_to: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
                timezone: "UTC".to_string(),
            },
        };
        store.insert_group(group.clone(), curriculum);
        (store, trigger, service, group)
    }

    #[tokio::test]
    async fn activate_group_uses_stored_course_and_pattern() {
        let (_store, _trigger, service, group) = setup();

        let outcome = service.activate_group(group.id, date(2025, 3, 1)).await.unwrap();

        assert_eq!(outcome.total_sessions, 5);
        assert_eq!(outcome.estimated_weeks, 2);
        let keys: Vec<_> = outcome.sessions.iter().map(|s| s.slot_key()).collect();
        assert_eq!(keys, vec![(0, 1), (0, 2), (0, 3), (1, 1), (1, 2)]);
        assert_eq!(service.group_sessions(group.id).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn activate_unknown_group_fails() {
        let (_store, _trigger, service, _group) = setup();
        let missing = Uuid::new_v4();

        let err = service.activate_group(missing, date(2025, 3, 1)).await.unwrap_err();

        assert!(matches!(err, GenerationError::GroupNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn submission_dispatches_thresholds_and_notices() {
        let (store, trigger, service, group) = setup();
        let outcome = service.activate_group(group.id, date(2025, 3, 1)).await.unwrap();
        let session_id = outcome.sessions[0].id;
        let low = Uuid::new_v4();
        let fine = Uuid::new_v4();
        store.add_package(low, 10, 6, PackageStatus::Active);
        store.add_package(fine, 10, 10, PackageStatus::Active);

        let r = service
            .submit_attendance(
                session_id,
                vec![
                    AttendanceSubmission {
                        student_id: low,
                        status: AttendanceStatus::Present,
                        notes: None,
                    },
                    AttendanceSubmission {
                        student_id: fine,
                        status: AttendanceStatus::Late,
                        notes: Some("traffic".to_string()),
                    },
                ],
                Some(Uuid::new_v4()),
            )
            .await
            .unwrap();

        assert!(!r.is_partial());
        let thresholds = trigger.thresholds();
        assert_eq!(thresholds.len(), 1);
        assert_eq!(thresholds[0].student_id, low);
        assert_eq!(thresholds[0].bucket, ThresholdBucket::Low);
        assert_eq!(trigger.notices().len(), 2);
        assert_eq!(service.ledger_entries(fine).await.unwrap().len(), 1);
        assert_eq!(
            service.credit_account(low).await.unwrap().stats.total_hours_remaining,
            4
        );
    }

    #[tokio::test]
    async fn trigger_failure_does_not_fail_submission() {
        let (store, trigger, service, group) = setup();
        let outcome = service.activate_group(group.id, date(2025, 3, 1)).await.unwrap();
        let student = Uuid::new_v4();
        store.add_package(student, 4, 2, PackageStatus::Active);
        trigger.set_failing(true);

        let r = service
            .submit_attendance(
                outcome.sessions[0].id,
                vec![AttendanceSubmission {
                    student_id: student,
                    status: AttendanceStatus::Present,
                    notes: None,
                }],
                None,
            )
            .await
            .unwrap();

        assert_eq!(r.threshold_events.len(), 1);
        let session = service.session(outcome.sessions[0].id).await.unwrap();
        assert!(session.attendance_taken);
    }
}
