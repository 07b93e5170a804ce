//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `SchedulingStore` port from the core crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`. Multi-row writes run inside a
//! transaction so a failure leaves no partial state behind.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use class_scheduler_core::domain::{
    AttendanceRecord, CourseId, CreditAccount, CreditLedgerStats, CreditPackage, Curriculum,
    Group, GroupId, LedgerEntry, LedgerEntryKind, Lesson, Module, Session, SessionId, StudentId, WeeklyPattern,
};
use class_scheduler_core::ports::{LedgerMutation, PortError, PortResult, SchedulingStore};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `SchedulingStore` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn db_error(e: sqlx::Error) -> PortError {
    match &e {
        sqlx::Error::RowNotFound => PortError::NotFound(e.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PortError::Unavailable(e.to_string())
        }
        _ => PortError::Unexpected(e.to_string()),
    }
}

fn parse_stored<T: FromStr>(value: &str) -> PortResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| PortError::Unexpected(format!("corrupt stored value: {}", e)))
}

fn to_u32(value: i32) -> u32 {
    value.max(0) as u32
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct GroupRecord {
    id: Uuid,
    course_id: Uuid,
    start_date: NaiveDate,
    days_of_week: Vec<String>,
    time_from: NaiveTime,
    time_to: NaiveTime,
    timezone: String,
}
impl GroupRecord {
    fn to_domain(self) -> PortResult<Group> {
        let days_of_week = self
            .days_of_week
            .iter()
            .map(|d| parse_stored::<Weekday>(d))
            .collect::<PortResult<Vec<_>>>()?;
        Ok(Group {
            id: self.id,
            course_id: self.course_id,
            pattern: WeeklyPattern {
                start_date: self.start_date,
                days_of_week,
                time_from: self.time_from,
                time_to: self.time_to,
                timezone: self.timezone,
            },
        })
    }
}

#[derive(FromRow)]
struct LessonRecord {
    module_index: i32,
    module_title: String,
    lesson_title: Option<String>,
    sessions_required: Option<i32>,
}

#[derive(FromRow)]
struct SessionRecord {
    id: Uuid,
    group_id: Uuid,
    course_id: Uuid,
    module_index: i32,
    lesson_index: i32,
    session_number: i32,
    scheduled_date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    status: String,
    attendance_taken: bool,
}
impl SessionRecord {
    fn to_domain(self, attendance: Vec<AttendanceRecord>) -> PortResult<Session> {
        Ok(Session {
            id: self.id,
            group_id: self.group_id,
            course_id: self.course_id,
            module_index: to_u32(self.module_index) as usize,
            lesson_index: to_u32(self.lesson_index) as usize,
            session_number: to_u32(self.session_number),
            scheduled_date: self.scheduled_date,
            start_time: self.start_time,
            end_time: self.end_time,
            status: parse_stored(&self.status)?,
            attendance_taken: self.attendance_taken,
            attendance,
        })
    }
}

#[derive(FromRow)]
struct AttendanceRow {
    session_id: Uuid,
    student_id: Uuid,
    status: String,
    notes: Option<String>,
    marked_at: DateTime<Utc>,
    marked_by: Option<Uuid>,
}
impl AttendanceRow {
    fn to_domain(self) -> PortResult<AttendanceRecord> {
        Ok(AttendanceRecord {
            student_id: self.student_id,
            status: parse_stored(&self.status)?,
            notes: self.notes,
            marked_at: self.marked_at,
            marked_by: self.marked_by,
        })
    }
}

#[derive(FromRow)]
struct StudentStatsRecord {
    total_hours_used: i32,
    total_hours_remaining: i32,
    total_sessions_attended: i32,
}
impl StudentStatsRecord {
    fn to_domain(self) -> CreditLedgerStats {
        CreditLedgerStats {
            total_hours_used: to_u32(self.total_hours_used),
            total_hours_remaining: to_u32(self.total_hours_remaining),
            total_sessions_attended: to_u32(self.total_sessions_attended),
        }
    }
}

#[derive(FromRow)]
struct PackageRecord {
    id: Uuid,
    total_hours: i32,
    remaining_hours: i32,
    status: String,
}
impl PackageRecord {
    fn to_domain(self) -> PortResult<CreditPackage> {
        Ok(CreditPackage {
            id: self.id,
            total_hours: to_u32(self.total_hours),
            remaining_hours: to_u32(self.remaining_hours),
            status: parse_stored(&self.status)?,
        })
    }
}

#[derive(FromRow)]
struct LedgerEntryRecord {
    id: Uuid,
    student_id: Uuid,
    package_id: Uuid,
    session_id: Uuid,
    group_id: Uuid,
    kind: String,
    hours: i32,
    balance_after: i32,
    reason: String,
    actor: Option<Uuid>,
    created_at: DateTime<Utc>,
}
impl LedgerEntryRecord {
    fn to_domain(self) -> PortResult<LedgerEntry> {
        Ok(LedgerEntry {
            id: self.id,
            student_id: self.student_id,
            package_id: self.package_id,
            session_id: self.session_id,
            group_id: self.group_id,
            kind: parse_stored(&self.kind)?,
            hours: to_u32(self.hours),
            balance_after: to_u32(self.balance_after),
            reason: self.reason,
            actor: self.actor,
            created_at: self.created_at,
        })
    }
}

const SESSION_COLUMNS: &str = "id, group_id, course_id, module_index, lesson_index, session_number, \
     scheduled_date, start_time, end_time, status, attendance_taken";

impl DbAdapter {
    /// Attendance for a batch of sessions, keyed by session.
    async fn attendance_for(
        &self,
        session_ids: &[Uuid],
    ) -> PortResult<HashMap<Uuid, Vec<AttendanceRecord>>> {
        let rows = sqlx::query_as::<_, AttendanceRow>(
            "SELECT session_id, student_id, status, notes, marked_at, marked_by \
             FROM attendance_records WHERE session_id = ANY($1) ORDER BY marked_at ASC",
        )
        .bind(session_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut by_session: HashMap<Uuid, Vec<AttendanceRecord>> = HashMap::new();
        for row in rows {
            let session_id = row.session_id;
            by_session
                .entry(session_id)
                .or_default()
                .push(row.to_domain()?);
        }
        Ok(by_session)
    }
}

//=========================================================================================
// `SchedulingStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl SchedulingStore for DbAdapter {
    async fn get_group(&self, group_id: GroupId) -> PortResult<Group> {
        let record = sqlx::query_as::<_, GroupRecord>(
            "SELECT id, course_id, start_date, days_of_week, time_from, time_to, timezone \
             FROM groups WHERE id = $1",
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("Group {} not found", group_id)),
            _ => db_error(e),
        })?;
        record.to_domain()
    }

    async fn get_curriculum(&self, course_id: CourseId) -> PortResult<Curriculum> {
        let exists = sqlx::query_scalar::<_, Uuid>("SELECT id FROM courses WHERE id = $1")
            .bind(course_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        if exists.is_none() {
            return Err(PortError::NotFound(format!("Course {} not found", course_id)));
        }

        let rows = sqlx::query_as::<_, LessonRecord>(
            "SELECT m.module_index, m.title AS module_title, l.title AS lesson_title, l.sessions_required \
             FROM course_modules m \
             LEFT JOIN course_lessons l \
               ON l.course_id = m.course_id AND l.module_index = m.module_index \
             WHERE m.course_id = $1 \
             ORDER BY m.module_index ASC, l.lesson_index ASC",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut modules: Vec<Module> = Vec::new();
        let mut current_index: Option<i32> = None;
        for row in rows {
            if current_index != Some(row.module_index) {
                current_index = Some(row.module_index);
                modules.push(Module {
                    title: row.module_title.clone(),
                    lessons: Vec::new(),
                });
            }
            if let (Some(title), Some(module)) = (row.lesson_title, modules.last_mut()) {
                let sessions = row.sessions_required.map(to_u32);
                module.lessons.push(match sessions {
                    Some(n) => Lesson::with_sessions(title, n),
                    None => Lesson::new(title),
                });
            }
        }

        Ok(Curriculum { course_id, modules })
    }

    async fn list_group_sessions(&self, group_id: GroupId) -> PortResult<Vec<Session>> {
        let records = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {} FROM sessions WHERE group_id = $1 \
             ORDER BY scheduled_date ASC, start_time ASC, module_index ASC, session_number ASC",
            SESSION_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut attendance = self.attendance_for(&ids).await?;

        records
            .into_iter()
            .map(|r| {
                let records = attendance.remove(&r.id).unwrap_or_default();
                r.to_domain(records)
            })
            .collect()
    }

    async fn replace_group_sessions(
        &self,
        group_id: GroupId,
        retired: &[SessionId],
        fresh: &[Session],
    ) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Only untouched scheduled sessions may be retired; anything else is history.
        let deleted = sqlx::query(
            "DELETE FROM sessions WHERE group_id = $1 AND id = ANY($2) \
             AND status = 'scheduled' AND attendance_taken = FALSE",
        )
        .bind(group_id)
        .bind(retired)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        if deleted.rows_affected() != retired.len() as u64 {
            // Dropping `tx` rolls the delete back.
            return Err(PortError::Conflict(format!(
                "Sessions of group {} changed since they were read ({} of {} removable)",
                group_id,
                deleted.rows_affected(),
                retired.len()
            )));
        }

        for session in fresh {
            sqlx::query(
                "INSERT INTO sessions (id, group_id, course_id, module_index, lesson_index, \
                 session_number, scheduled_date, start_time, end_time, status, attendance_taken) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(session.id)
            .bind(group_id)
            .bind(session.course_id)
            .bind(session.module_index as i32)
            .bind(session.lesson_index as i32)
            .bind(session.session_number as i32)
            .bind(session.scheduled_date)
            .bind(session.start_time)
            .bind(session.end_time)
            .bind(session.status.as_str())
            .bind(session.attendance_taken)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> PortResult<Session> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {} FROM sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Session {} not found", session_id))
            }
            _ => db_error(e),
        })?;

        let mut attendance = self.attendance_for(&[session_id]).await?;
        record.to_domain(attendance.remove(&session_id).unwrap_or_default())
    }

    async fn save_attendance(
        &self,
        session_id: SessionId,
        records: &[AttendanceRecord],
    ) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let updated = sqlx::query("UPDATE sessions SET attendance_taken = TRUE WHERE id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        if updated.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Session {} not found", session_id)));
        }

        sqlx::query("DELETE FROM attendance_records WHERE session_id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        for record in records {
            sqlx::query(
                "INSERT INTO attendance_records (session_id, student_id, status, notes, marked_at, marked_by) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(session_id)
            .bind(record.student_id)
            .bind(record.status.as_str())
            .bind(record.notes.as_deref())
            .bind(record.marked_at)
            .bind(record.marked_by)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn get_credit_account(&self, student_id: StudentId) -> PortResult<CreditAccount> {
        let stats = sqlx::query_as::<_, StudentStatsRecord>(
            "SELECT total_hours_used, total_hours_remaining, total_sessions_attended \
             FROM students WHERE id = $1",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(StudentStatsRecord::to_domain)
        .unwrap_or_default();

        // Prefer the newest active package; fall back to the newest of any status.
        let package = sqlx::query_as::<_, PackageRecord>(
            "SELECT id, total_hours, remaining_hours, status FROM credit_packages \
             WHERE student_id = $1 \
             ORDER BY (status = 'active') DESC, created_at DESC LIMIT 1",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .map(PackageRecord::to_domain)
        .transpose()?;

        Ok(CreditAccount {
            student_id,
            package,
            stats,
        })
    }

    async fn get_package(
        &self,
        student_id: StudentId,
        package_id: Uuid,
    ) -> PortResult<CreditPackage> {
        sqlx::query_as::<_, PackageRecord>(
            "SELECT id, total_hours, remaining_hours, status FROM credit_packages \
             WHERE id = $1 AND student_id = $2",
        )
        .bind(package_id)
        .bind(student_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!(
                "Package {} not found for student {}",
                package_id, student_id
            )),
            _ => db_error(e),
        })?
        .to_domain()
    }

    async fn charged_package(
        &self,
        student_id: StudentId,
        session_id: SessionId,
    ) -> PortResult<Option<Uuid>> {
        let rows = sqlx::query_as::<_, (String, Uuid)>(
            "SELECT kind, package_id FROM credit_ledger \
             WHERE student_id = $1 AND session_id = $2 ORDER BY created_at ASC",
        )
        .bind(student_id)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut net = 0i64;
        let mut last_charge = None;
        for (kind, package_id) in rows {
            match parse_stored::<LedgerEntryKind>(&kind)? {
                LedgerEntryKind::Charge => {
                    net += 1;
                    last_charge = Some(package_id);
                }
                LedgerEntryKind::Refund => net -= 1,
            }
        }
        Ok(last_charge.filter(|_| net > 0))
    }

    async fn apply_ledger_mutation(&self, mutation: &LedgerMutation) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let updated = sqlx::query(
            "UPDATE credit_packages SET remaining_hours = $1 \
             WHERE id = $2 AND student_id = $3 AND remaining_hours = $4",
        )
        .bind(mutation.new_remaining as i32)
        .bind(mutation.package_id)
        .bind(mutation.student_id)
        .bind(mutation.expected_remaining as i32)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        if updated.rows_affected() == 0 {
            return Err(PortError::Conflict(format!(
                "package {} no longer holds {}h",
                mutation.package_id, mutation.expected_remaining
            )));
        }

        sqlx::query(
            "UPDATE students SET total_hours_used = $1, total_hours_remaining = $2, \
             total_sessions_attended = $3 WHERE id = $4",
        )
        .bind(mutation.stats.total_hours_used as i32)
        .bind(mutation.stats.total_hours_remaining as i32)
        .bind(mutation.stats.total_sessions_attended as i32)
        .bind(mutation.student_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let entry = &mutation.entry;
        sqlx::query(
            "INSERT INTO credit_ledger (id, student_id, package_id, session_id, group_id, kind, \
             hours, balance_after, reason, actor, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(entry.id)
        .bind(entry.student_id)
        .bind(entry.package_id)
        .bind(entry.session_id)
        .bind(entry.group_id)
        .bind(entry.kind.as_str())
        .bind(entry.hours as i32)
        .bind(entry.balance_after as i32)
        .bind(&entry.reason)
        .bind(entry.actor)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn list_ledger_entries(&self, student_id: StudentId) -> PortResult<Vec<LedgerEntry>> {
        let records = sqlx::query_as::<_, LedgerEntryRecord>(
            "SELECT id, student_id, package_id, session_id, group_id, kind, hours, balance_after, \
             reason, actor, created_at FROM credit_ledger WHERE student_id = $1 ORDER BY created_at DESC",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        records.into_iter().map(|r| r.to_domain()).collect()
    }
}
