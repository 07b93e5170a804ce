//! crates/class_scheduler_core/src/generator.rs
//!
//! Turns a curriculum expansion into persisted sessions for a group.
//!
//! On regeneration, sessions that are no longer `scheduled`, already have
//! attendance, or whose date has passed are preserved untouched. Only the
//! remaining `scheduled` sessions are retired and replaced, and the replacement
//! never re-issues a curriculum slot that a preserved session already covers.

use chrono::NaiveDate;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::curriculum::{self, assign_dates, Expansion, PatternDates, SessionBlueprint};
use crate::domain::{Curriculum, GroupId, Session, SessionId, SessionStatus, WeeklyPattern};
use crate::error::GenerationError;
use crate::locks::KeyedLocks;
use crate::ports::SchedulingStore;
use crate::schedule::validate_pattern;

/// What a generation run produced.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    /// Every session of the group after the run, ordered by date.
    pub sessions: Vec<Session>,
    pub total_sessions: usize,
    pub estimated_weeks: usize,
    pub created: usize,
    pub retired: usize,
    pub preserved: usize,
}

/// The write set for one run, computed without touching the store.
#[derive(Debug, Clone)]
pub struct RegenerationPlan {
    pub expansion: Expansion,
    pub preserved: Vec<Session>,
    pub retired: Vec<SessionId>,
    pub fresh: Vec<Session>,
}

impl RegenerationPlan {
    fn into_sessions(self) -> Vec<Session> {
        let mut sessions = self.preserved;
        sessions.extend(self.fresh);
        sessions.sort_by_key(|s| {
            (s.scheduled_date, s.start_time, s.module_index, s.session_number)
        });
        sessions
    }
}

fn materialize(group_id: GroupId, curriculum: &Curriculum, bp: &SessionBlueprint) -> Session {
    Session {
        id: Uuid::new_v4(),
        group_id,
        course_id: curriculum.course_id,
        module_index: bp.module_index,
        lesson_index: bp.lesson_index,
        session_number: bp.session_number,
        scheduled_date: bp.scheduled_date,
        start_time: bp.start_time,
        end_time: bp.end_time,
        status: SessionStatus::Scheduled,
        attendance_taken: false,
        attendance: Vec::new(),
    }
}

/// Splits `existing` into preserved and retired sessions and builds the
/// replacements. With no existing sessions this is the plain expansion from
/// the pattern's start date.
pub fn plan_regeneration(
    group_id: GroupId,
    curriculum: &Curriculum,
    pattern: &WeeklyPattern,
    existing: &[Session],
    today: NaiveDate,
) -> RegenerationPlan {
    let expansion = curriculum::expand(curriculum, pattern);

    if existing.is_empty() {
        let fresh = expansion
            .blueprints
            .iter()
            .map(|bp| materialize(group_id, curriculum, bp))
            .collect();
        return RegenerationPlan {
            expansion,
            preserved: Vec::new(),
            retired: Vec::new(),
            fresh,
        };
    }

    let (preserved, replaceable): (Vec<Session>, Vec<Session>) = existing
        .iter()
        .cloned()
        .partition(|s| s.is_preserved(today));
    let retired = replaceable.iter().map(|s| s.id).collect();

    let covered: HashSet<(usize, u32)> = preserved.iter().map(Session::slot_key).collect();
    let occupied: HashSet<NaiveDate> = preserved.iter().map(|s| s.scheduled_date).collect();

    let open_slots: Vec<_> = curriculum::flatten(curriculum)
        .into_iter()
        .filter(|slot| !covered.contains(&slot.key()))
        .collect();

    let anchor = pattern.start_date.max(today);
    let dates = PatternDates::starting(anchor, &pattern.days_of_week)
        .filter(|d| !occupied.contains(d));
    let fresh = assign_dates(&open_slots, dates, pattern)
        .iter()
        .map(|bp| materialize(group_id, curriculum, bp))
        .collect();

    RegenerationPlan {
        expansion,
        preserved,
        retired,
        fresh,
    }
}

pub struct SessionGenerator {
    store: Arc<dyn SchedulingStore>,
    locks: KeyedLocks<GroupId>,
}

impl SessionGenerator {
    pub fn new(store: Arc<dyn SchedulingStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Generates or regenerates a group's sessions. Validation failures are
    /// returned before anything is read or written; the store write is
    /// all-or-nothing.
    pub async fn generate(
        &self,
        group_id: GroupId,
        curriculum: &Curriculum,
        pattern: &WeeklyPattern,
        today: NaiveDate,
    ) -> Result<GenerationOutcome, GenerationError> {
        if curriculum.is_empty() {
            return Err(GenerationError::EmptyCurriculum);
        }
        validate_pattern(pattern).map_err(GenerationError::InvalidSchedule)?;

        let _guard = self.locks.lock(&group_id).await;

        let existing = self.store.list_group_sessions(group_id).await?;
        let plan = plan_regeneration(group_id, curriculum, pattern, &existing, today);

        if let Err(e) = self
            .store
            .replace_group_sessions(group_id, &plan.retired, &plan.fresh)
            .await
        {
            warn!(%group_id, error = %e, "Session generation rolled back");
            return Err(e.into());
        }

        let total_sessions = plan.expansion.total_sessions;
        let estimated_weeks = plan.expansion.estimated_weeks();
        let created = plan.fresh.len();
        let retired = plan.retired.len();
        let preserved = plan.preserved.len();

        info!(
            %group_id,
            total_sessions,
            created,
            retired,
            preserved,
            "Sessions generated"
        );

        Ok(GenerationOutcome {
            sessions: plan.into_sessions(),
            total_sessions,
            estimated_weeks,
            created,
            retired,
            preserved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttendanceRecord, AttendanceStatus, Lesson, Module};
    use crate::error::ScheduleViolation;
    use crate::memory::InMemoryStore;
    use crate::ports::PortError;
    use chrono::{Datelike, NaiveTime, Utc, Weekday};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn mon_wed(start: NaiveDate) -> WeeklyPattern {
        WeeklyPattern {
            start_date: start,
            days_of_week: vec![Weekday::Mon, Weekday::Wed],
            time_from: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            time_to: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            timezone: "UTC".to_string(),
        }
    }

    fn two_lessons() -> Curriculum {
        Curriculum {
            course_id: Uuid::new_v4(),
            modules: vec![Module {
                title: "Basics".to_string(),
                lessons: vec![Lesson::new("Intro"), Lesson::new("Variables")],
            }],
        }
    }

    fn setup() -> (Arc<InMemoryStore>, SessionGenerator, GroupId) {
        let store = Arc::new(InMemoryStore::new());
        let generator = SessionGenerator::new(store.clone());
        (store, generator, Uuid::new_v4())
    }

    // 2025-03-03 is a Monday.
    fn monday() -> NaiveDate {
        date(2025, 3, 3)
    }

    #[tokio::test]
    async fn first_generation_follows_curriculum_and_pattern() {
        let (store, generator, group) = setup();

        let outcome = generator
            .generate(group, &two_lessons(), &mon_wed(monday()), date(2025, 3, 1))
            .await
            .unwrap();

        assert_eq!(outcome.total_sessions, 4);
        assert_eq!(outcome.estimated_weeks, 2);
        assert_eq!(outcome.created, 4);
        let dates: Vec<_> = outcome.sessions.iter().map(|s| s.scheduled_date).collect();
        assert_eq!(
            dates,
            vec![date(2025, 3, 3), date(2025, 3, 5), date(2025, 3, 10), date(2025, 3, 12)]
        );
        let numbers: Vec<_> = outcome.sessions.iter().map(|s| s.session_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert!(outcome
            .sessions
            .iter()
            .all(|s| s.module_index == 0 && s.status == SessionStatus::Scheduled));
        assert_eq!(
            outcome.sessions[0].start_time,
            NaiveTime::from_hms_opt(18, 0, 0).unwrap()
        );
        assert_eq!(store.session_count(group), 4);
    }

    #[tokio::test]
    async fn duplicate_weekday_is_rejected_without_writes() {
        let (store, generator, group) = setup();
        let mut pattern = mon_wed(monday());
        pattern.days_of_week = vec![Weekday::Mon, Weekday::Mon];

        let err = generator
            .generate(group, &two_lessons(), &pattern, date(2025, 3, 1))
            .await
            .unwrap_err();

        match err {
            GenerationError::InvalidSchedule(v) => {
                assert!(v.contains(&ScheduleViolation::DuplicateDay(Weekday::Mon)))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.session_count(group), 0);
    }

    #[tokio::test]
    async fn empty_curriculum_is_rejected() {
        let (store, generator, group) = setup();
        let curriculum = Curriculum {
            course_id: Uuid::new_v4(),
            modules: vec![Module {
                title: "Empty".to_string(),
                lessons: vec![],
            }],
        };

        let err = generator
            .generate(group, &curriculum, &mon_wed(monday()), date(2025, 3, 1))
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::EmptyCurriculum));
        assert_eq!(store.session_count(group), 0);
    }

    #[tokio::test]
    async fn regeneration_preserves_completed_and_cancelled_sessions() {
        let (store, generator, group) = setup();
        let curriculum = two_lessons();
        let pattern = mon_wed(monday());
        let first = generator
            .generate(group, &curriculum, &pattern, date(2025, 3, 1))
            .await
            .unwrap();

        let mut completed = first.sessions[0].clone();
        completed.status = SessionStatus::Completed;
        completed.attendance_taken = true;
        store.insert_session(completed.clone());
        let mut cancelled = first.sessions[1].clone();
        cancelled.status = SessionStatus::Cancelled;
        store.insert_session(cancelled.clone());

        let second = generator
            .generate(group, &curriculum, &pattern, date(2025, 3, 6))
            .await
            .unwrap();

        assert_eq!(second.preserved, 2);
        assert_eq!(second.retired, 2);
        assert_eq!(second.created, 2);
        assert_eq!(store.session_count(group), 4);
        assert!(second.sessions.contains(&completed));
        assert!(second.sessions.contains(&cancelled));
        let keys: Vec<_> = second.sessions.iter().map(|s| s.slot_key()).collect();
        assert_eq!(keys, vec![(0, 1), (0, 2), (0, 3), (0, 4)]);
        assert_eq!(second.sessions[2].scheduled_date, date(2025, 3, 10));
        assert_eq!(second.sessions[3].scheduled_date, date(2025, 3, 12));
    }

    #[tokio::test]
    async fn regeneration_keeps_past_scheduled_sessions() {
        let (store, generator, group) = setup();
        let curriculum = two_lessons();
        let pattern = mon_wed(monday());
        let first = generator
            .generate(group, &curriculum, &pattern, date(2025, 3, 1))
            .await
            .unwrap();

        let second = generator
            .generate(group, &curriculum, &pattern, date(2025, 3, 11))
            .await
            .unwrap();

        assert_eq!(second.preserved, 3);
        assert_eq!(&second.sessions[..3], &first.sessions[..3]);
        assert_eq!(second.sessions[3].scheduled_date, date(2025, 3, 12));
        assert_eq!(second.sessions[3].session_number, 4);
        assert_eq!(store.session_count(group), 4);
    }

    fn attended() -> Vec<AttendanceRecord> {
        vec![AttendanceRecord {
            student_id: Uuid::new_v4(),
            status: AttendanceStatus::Present,
            notes: None,
            marked_at: Utc::now(),
            marked_by: None,
        }]
    }

    #[tokio::test]
    async fn regeneration_keeps_todays_session_once_attendance_is_taken() {
        let (store, generator, group) = setup();
        let curriculum = two_lessons();
        let pattern = mon_wed(monday());
        let first = generator
            .generate(group, &curriculum, &pattern, date(2025, 3, 1))
            .await
            .unwrap();
        let today_id = first.sessions[0].id;
        store.save_attendance(today_id, &attended()).await.unwrap();

        let second = generator
            .generate(group, &curriculum, &pattern, monday())
            .await
            .unwrap();

        assert_eq!(second.preserved, 1);
        assert_eq!(second.retired, 3);
        assert_eq!(store.session_count(group), 4);
        let kept = store.get_session(today_id).await.unwrap();
        assert!(kept.attendance_taken);
        assert_eq!(kept.attendance.len(), 1);
        let keys: Vec<_> = second.sessions.iter().map(|s| s.slot_key()).collect();
        assert_eq!(keys, vec![(0, 1), (0, 2), (0, 3), (0, 4)]);
        assert_eq!(second.sessions[0].id, today_id);
        assert_eq!(second.sessions[1].scheduled_date, date(2025, 3, 5));
    }

    #[tokio::test]
    async fn stale_plan_cannot_retire_an_attended_session() {
        let (store, generator, group) = setup();
        let curriculum = two_lessons();
        let pattern = mon_wed(monday());
        let first = generator
            .generate(group, &curriculum, &pattern, date(2025, 3, 1))
            .await
            .unwrap();

        let plan = plan_regeneration(group, &curriculum, &pattern, &first.sessions, monday());
        let taken = first.sessions[0].id;
        assert!(plan.retired.contains(&taken));
        store.save_attendance(taken, &attended()).await.unwrap();

        let err = store
            .replace_group_sessions(group, &plan.retired, &plan.fresh)
            .await
            .unwrap_err();

        assert!(matches!(err, PortError::Conflict(_)));
        let stored = store.list_group_sessions(group).await.unwrap();
        assert_eq!(stored.len(), 4);
        assert!(stored.iter().any(|s| s.id == taken && s.attendance_taken));
    }

    #[tokio::test]
    async fn regeneration_with_new_pattern_only_moves_future_sessions() {
        let (store, generator, group) = setup();
        let curriculum = two_lessons();
        let first = generator
            .generate(group, &curriculum, &mon_wed(monday()), date(2025, 3, 1))
            .await
            .unwrap();
        for s in &first.sessions[..2] {
            let mut done = s.clone();
            done.status = SessionStatus::Completed;
            store.insert_session(done);
        }

        // Tuesday/Thursday starting Tuesday 2025-03-04.
        let mut tue_thu = mon_wed(date(2025, 3, 4));
        tue_thu.days_of_week = vec![Weekday::Tue, Weekday::Thu];
        let second = generator
            .generate(group, &curriculum, &tue_thu, date(2025, 3, 6))
            .await
            .unwrap();

        let dates: Vec<_> = second.sessions.iter().map(|s| s.scheduled_date).collect();
        assert_eq!(
            dates,
            vec![date(2025, 3, 3), date(2025, 3, 5), date(2025, 3, 6), date(2025, 3, 11)]
        );
        assert_eq!(second.sessions[2].scheduled_date.weekday(), Weekday::Thu);
        assert_eq!(store.session_count(group), 4);
    }

    #[tokio::test]
    async fn repeated_regeneration_is_stable() {
        let (_store, generator, group) = setup();
        let curriculum = two_lessons();
        let pattern = mon_wed(monday());
        let today = date(2025, 3, 1);

        let first = generator.generate(group, &curriculum, &pattern, today).await.unwrap();
        let second = generator.generate(group, &curriculum, &pattern, today).await.unwrap();

        let shape = |o: &GenerationOutcome| {
            o.sessions
                .iter()
                .map(|s| (s.scheduled_date, s.module_index, s.session_number))
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&first), shape(&second));
    }

    #[tokio::test]
    async fn failed_write_leaves_previous_sessions_in_place() {
        let (store, generator, group) = setup();
        let curriculum = two_lessons();
        let pattern = mon_wed(monday());
        let first = generator
            .generate(group, &curriculum, &pattern, date(2025, 3, 1))
            .await
            .unwrap();

        store.fail_session_writes(true);
        let err = generator
            .generate(group, &curriculum, &pattern, date(2025, 3, 1))
            .await
            .unwrap_err();

        assert!(matches!(err, GenerationError::Persistence(_)));
        let stored = store.list_group_sessions(group).await.unwrap();
        assert_eq!(stored, first.sessions);
    }

    #[tokio::test]
    async fn concurrent_generation_for_one_group_does_not_overlap() {
        let (store, generator, group) = setup();
        let generator = Arc::new(generator);
        let curriculum = two_lessons();
        let pattern = mon_wed(monday());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let generator = generator.clone();
            let curriculum = curriculum.clone();
            let pattern = pattern.clone();
            handles.push(tokio::spawn(async move {
                generator
                    .generate(group, &curriculum, &pattern, date(2025, 3, 1))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(store.session_count(group), 4);
    }
}
