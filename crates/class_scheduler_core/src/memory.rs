//! crates/class_scheduler_core/src/memory.rs
//!
//! In-memory implementations of the core ports, suitable for unit tests and
//! local development. All data lives in HashMaps behind a single lock, so every
//! port call is atomic. Failure switches let tests exercise the rollback and
//! partial-failure paths.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::domain::{
    AttendanceNotice, AttendanceRecord, CourseId, CreditAccount, CreditLedgerStats,
    CreditPackage, Curriculum, Group, GroupId, LedgerEntry, LedgerEntryKind, PackageStatus,
    Session, SessionId, SessionStatus, StudentId, ThresholdEvent,
};
use crate::ports::{AutomationTrigger, LedgerMutation, PortError, PortResult, SchedulingStore};

//=========================================================================================
// InMemoryStore
//=========================================================================================

#[derive(Default)]
pub struct InMemoryStore {
    data: RwLock<MemoryData>,
}

#[derive(Default)]
struct MemoryData {
    groups: HashMap<GroupId, Group>,
    curricula: HashMap<CourseId, Curriculum>,
    sessions: HashMap<SessionId, Session>,
    accounts: HashMap<StudentId, CreditAccount>,
    ledger: Vec<LedgerEntry>,

    // Failure injection
    unhealthy: bool,
    session_writes_fail: bool,
    attendance_writes_fail: bool,
    pending_conflicts: u32,
}

impl MemoryData {
    fn check_health(&self) -> PortResult<()> {
        if self.unhealthy {
            Err(PortError::Unavailable("in-memory store marked unhealthy".to_string()))
        } else {
            Ok(())
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryData> {
        self.data.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryData> {
        self.data.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers a group together with its course curriculum.
    pub fn insert_group(&self, group: Group, curriculum: Curriculum) {
        let mut data = self.write();
        data.curricula.insert(curriculum.course_id, curriculum);
        data.groups.insert(group.id, group);
    }

    /// Stores a session as-is, bypassing the generator. Useful for seeding
    /// completed or cancelled history.
    pub fn insert_session(&self, session: Session) {
        self.write().sessions.insert(session.id, session);
    }

    /// Gives a student a package. Any hours already missing from the
    /// package count as used.
    pub fn add_package(
        &self,
        student_id: StudentId,
        total_hours: u32,
        remaining_hours: u32,
        status: PackageStatus,
    ) -> Uuid {
        let package_id = Uuid::new_v4();
        let account = CreditAccount {
            student_id,
            package: Some(CreditPackage {
                id: package_id,
                total_hours,
                remaining_hours,
                status,
            }),
            stats: CreditLedgerStats {
                total_hours_used: total_hours.saturating_sub(remaining_hours),
                total_hours_remaining: remaining_hours,
                total_sessions_attended: 0,
            },
        };
        self.write().accounts.insert(student_id, account);
        package_id
    }

    pub fn set_package_status(&self, student_id: StudentId, status: PackageStatus) {
        if let Some(package) = self
            .write()
            .accounts
            .get_mut(&student_id)
            .and_then(|a| a.package.as_mut())
        {
            package.status = status;
        }
    }

    /// When unhealthy, every port call fails with `PortError::Unavailable`.
    pub fn set_healthy(&self, healthy: bool) {
        self.write().unhealthy = !healthy;
    }

    /// Makes `replace_group_sessions` fail while everything else keeps working.
    pub fn fail_session_writes(&self, fail: bool) {
        self.write().session_writes_fail = fail;
    }

    /// Makes `save_attendance` fail while everything else keeps working.
    pub fn fail_attendance_writes(&self, fail: bool) {
        self.write().attendance_writes_fail = fail;
    }

    /// The next `count` ledger writes fail with `PortError::Conflict`.
    pub fn inject_ledger_conflicts(&self, count: u32) {
        self.write().pending_conflicts = count;
    }

    pub fn session_count(&self, group_id: GroupId) -> usize {
        self.read()
            .sessions
            .values()
            .filter(|s| s.group_id == group_id)
            .count()
    }

    pub fn ledger_len(&self) -> usize {
        self.read().ledger.len()
    }
}

#[async_trait]
impl SchedulingStore for InMemoryStore {
    async fn get_group(&self, group_id: GroupId) -> PortResult<Group> {
        let data = self.read();
        data.check_health()?;
        data.groups
            .get(&group_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Group {} not found", group_id)))
    }

    async fn get_curriculum(&self, course_id: CourseId) -> PortResult<Curriculum> {
        let data = self.read();
        data.check_health()?;
        data.curricula
            .get(&course_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Course {} not found", course_id)))
    }

    async fn list_group_sessions(&self, group_id: GroupId) -> PortResult<Vec<Session>> {
        let data = self.read();
        data.check_health()?;
        let mut sessions: Vec<Session> = data
            .sessions
            .values()
            .filter(|s| s.group_id == group_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| {
            (s.scheduled_date, s.start_time, s.module_index, s.session_number)
        });
        Ok(sessions)
    }

    async fn replace_group_sessions(
        &self,
        group_id: GroupId,
        retired: &[SessionId],
        fresh: &[Session],
    ) -> PortResult<()> {
        let mut data = self.write();
        data.check_health()?;
        if data.session_writes_fail {
            return Err(PortError::Unavailable("session writes disabled".to_string()));
        }
        if let Some(foreign) = fresh.iter().find(|s| s.group_id != group_id) {
            return Err(PortError::Unexpected(format!(
                "Session {} belongs to group {}, not {}",
                foreign.id, foreign.group_id, group_id
            )));
        }
        if let Some(pinned) = retired
            .iter()
            .filter_map(|id| data.sessions.get(id))
            .find(|s| s.status != SessionStatus::Scheduled || s.attendance_taken)
        {
            return Err(PortError::Conflict(format!(
                "Session {} changed since it was read",
                pinned.id
            )));
        }
        for id in retired {
            data.sessions.remove(id);
        }
        for session in fresh {
            data.sessions.insert(session.id, session.clone());
        }
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> PortResult<Session> {
        let data = self.read();
        data.check_health()?;
        data.sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Session {} not found", session_id)))
    }

    async fn save_attendance(
        &self,
        session_id: SessionId,
        records: &[AttendanceRecord],
    ) -> PortResult<()> {
        let mut data = self.write();
        data.check_health()?;
        if data.attendance_writes_fail {
            return Err(PortError::Unavailable(
                "attendance writes disabled".to_string(),
            ));
        }
        let session = data
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| PortError::NotFound(format!("Session {} not found", session_id)))?;
        session.attendance = records.to_vec();
        session.attendance_taken = true;
        Ok(())
    }

    async fn get_credit_account(&self, student_id: StudentId) -> PortResult<CreditAccount> {
        let data = self.read();
        data.check_health()?;
        Ok(data
            .accounts
            .get(&student_id)
            .cloned()
            .unwrap_or(CreditAccount {
                student_id,
                package: None,
                stats: CreditLedgerStats::default(),
            }))
    }

    async fn get_package(
        &self,
        student_id: StudentId,
        package_id: Uuid,
    ) -> PortResult<CreditPackage> {
        let data = self.read();
        data.check_health()?;
        data.accounts
            .get(&student_id)
            .and_then(|a| a.package.clone())
            .filter(|p| p.id == package_id)
            .ok_or_else(|| PortError::NotFound(format!("Package {} not found", package_id)))
    }

    async fn charged_package(
        &self,
        student_id: StudentId,
        session_id: SessionId,
    ) -> PortResult<Option<Uuid>> {
        let data = self.read();
        data.check_health()?;
        let mut net: i64 = 0;
        let mut last_charge = None;
        for entry in data
            .ledger
            .iter()
            .filter(|e| e.student_id == student_id && e.session_id == session_id)
        {
            match entry.kind {
                LedgerEntryKind::Charge => {
                    net += 1;
                    last_charge = Some(entry.package_id);
                }
                LedgerEntryKind::Refund => net -= 1,
            }
        }
        Ok(if net > 0 { last_charge } else { None })
    }

    async fn apply_ledger_mutation(&self, mutation: &LedgerMutation) -> PortResult<()> {
        let mut data = self.write();
        data.check_health()?;
        if data.pending_conflicts > 0 {
            data.pending_conflicts -= 1;
            return Err(PortError::Conflict("injected conflict".to_string()));
        }

        let account = data.accounts.get_mut(&mutation.student_id).ok_or_else(|| {
            PortError::NotFound(format!("Student {} has no account", mutation.student_id))
        })?;
        let package = account
            .package
            .as_mut()
            .filter(|p| p.id == mutation.package_id)
            .ok_or_else(|| {
                PortError::NotFound(format!("Package {} not found", mutation.package_id))
            })?;
        if package.remaining_hours != mutation.expected_remaining {
            return Err(PortError::Conflict(format!(
                "expected {}h remaining, found {}h",
                mutation.expected_remaining, package.remaining_hours
            )));
        }
        package.remaining_hours = mutation.new_remaining;
        account.stats = mutation.stats;
        data.ledger.push(mutation.entry.clone());
        Ok(())
    }

    async fn list_ledger_entries(&self, student_id: StudentId) -> PortResult<Vec<LedgerEntry>> {
        let data = self.read();
        data.check_health()?;
        Ok(data
            .ledger
            .iter()
            .rev()
            .filter(|e| e.student_id == student_id)
            .cloned()
            .collect())
    }
}

//=========================================================================================
// RecordingTrigger
//=========================================================================================

/// An `AutomationTrigger` that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingTrigger {
    thresholds: Mutex<Vec<ThresholdEvent>>,
    notices: Mutex<Vec<AttendanceNotice>>,
    failing: Mutex<bool>,
}

impl RecordingTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|p| p.into_inner()) = failing;
    }

    pub fn thresholds(&self) -> Vec<ThresholdEvent> {
        self.thresholds
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn notices(&self) -> Vec<AttendanceNotice> {
        self.notices.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn check(&self) -> PortResult<()> {
        if *self.failing.lock().unwrap_or_else(|p| p.into_inner()) {
            Err(PortError::Unavailable("trigger disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AutomationTrigger for RecordingTrigger {
    async fn credit_thresholds_reached(&self, events: &[ThresholdEvent]) -> PortResult<()> {
        self.check()?;
        self.thresholds
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(events);
        Ok(())
    }

    async fn attendance_recorded(&self, notices: &[AttendanceNotice]) -> PortResult<()> {
        self.check()?;
        self.notices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(notices);
        Ok(())
    }
}
