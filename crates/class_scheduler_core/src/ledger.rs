//! crates/class_scheduler_core/src/ledger.rs
//!
//! The credit ledger: the only code path that changes a student's remaining
//! hours. Charges and refunds are scoped to a session so that repeating one
//! is a no-op, and are serialised per student.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    GroupId, LedgerEntry, LedgerEntryKind, SessionId, StudentId, ThresholdBucket,
};
use crate::error::LedgerError;
use crate::locks::KeyedLocks;
use crate::ports::{LedgerMutation, PortError, SchedulingStore};

/// Hours charged for one attended session.
pub const SESSION_CHARGE_HOURS: u32 = 2;

/// Balances at or below this (and above zero) are `Low`.
pub const LOW_BALANCE_THRESHOLD_HOURS: u32 = 5;

pub fn classify(remaining_hours: u32) -> ThresholdBucket {
    match remaining_hours {
        0 => ThresholdBucket::Zero,
        h if h <= LOW_BALANCE_THRESHOLD_HOURS => ThresholdBucket::Low,
        _ => ThresholdBucket::Normal,
    }
}

/// Audit context carried into every ledger entry.
#[derive(Debug, Clone)]
pub struct LedgerContext {
    pub session_id: SessionId,
    pub group_id: GroupId,
    pub reason: String,
    pub actor: Option<Uuid>,
}

/// Result of a charge or refund. `applied` is false when the session was
/// already in the requested state and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    pub student_id: StudentId,
    pub kind: LedgerEntryKind,
    pub hours: u32,
    pub remaining_hours: u32,
    pub applied: bool,
}

impl LedgerReceipt {
    pub fn bucket(&self) -> ThresholdBucket {
        classify(self.remaining_hours)
    }
}

pub struct CreditLedger {
    store: Arc<dyn SchedulingStore>,
    locks: KeyedLocks<StudentId>,
    retry_limit: u32,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn SchedulingStore>, retry_limit: u32) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            retry_limit,
        }
    }

    /// Deducts `hours`. Fails with `InsufficientCredit` rather than overdraw.
    pub async fn charge(
        &self,
        student_id: StudentId,
        hours: u32,
        ctx: &LedgerContext,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.mutate(student_id, LedgerEntryKind::Charge, hours, ctx).await
    }

    /// Reverses a charge previously applied for the same session.
    pub async fn refund(
        &self,
        student_id: StudentId,
        hours: u32,
        ctx: &LedgerContext,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.mutate(student_id, LedgerEntryKind::Refund, hours, ctx).await
    }

    async fn mutate(
        &self,
        student_id: StudentId,
        kind: LedgerEntryKind,
        hours: u32,
        ctx: &LedgerContext,
    ) -> Result<LedgerReceipt, LedgerError> {
        let _guard = self.locks.lock(&student_id).await;

        let mut attempt = 0;
        loop {
            match self.try_mutate(student_id, kind, hours, ctx).await {
                Err(LedgerError::Persistence(PortError::Conflict(reason)))
                    if attempt < self.retry_limit =>
                {
                    attempt += 1;
                    debug!(%student_id, attempt, %reason, "Ledger write conflict, retrying");
                }
                Err(LedgerError::Persistence(PortError::Conflict(reason))) => {
                    warn!(%student_id, attempt, %reason, "Ledger write conflict, giving up");
                    return Err(LedgerError::Persistence(PortError::Conflict(reason)));
                }
                other => return other,
            }
        }
    }

    async fn try_mutate(
        &self,
        student_id: StudentId,
        kind: LedgerEntryKind,
        hours: u32,
        ctx: &LedgerContext,
    ) -> Result<LedgerReceipt, LedgerError> {
        let account = self.store.get_credit_account(student_id).await?;
        let charged_from = self
            .store
            .charged_package(student_id, ctx.session_id)
            .await?;

        let package = match (kind, charged_from) {
            (LedgerEntryKind::Charge, None) => account
                .active_package()
                .cloned()
                .ok_or(LedgerError::NoActivePackage(student_id))?,
            // Refunds go back to the package that paid, even if it has expired since.
            (LedgerEntryKind::Refund, Some(package_id)) => {
                match account.package.as_ref().filter(|p| p.id == package_id) {
                    Some(p) => p.clone(),
                    None => self.store.get_package(student_id, package_id).await?,
                }
            }
            _ => {
                debug!(%student_id, session_id = %ctx.session_id, kind = kind.as_str(), "Ledger operation already reflected, skipping");
                return Ok(LedgerReceipt {
                    student_id,
                    kind,
                    hours,
                    remaining_hours: account
                        .active_package()
                        .map(|p| p.remaining_hours)
                        .unwrap_or(0),
                    applied: false,
                });
            }
        };
        let remaining = package.remaining_hours;

        let mut stats = account.stats;
        let new_remaining = match kind {
            LedgerEntryKind::Charge => {
                if hours > remaining {
                    return Err(LedgerError::InsufficientCredit {
                        requested: hours,
                        remaining,
                    });
                }
                stats.total_hours_used += hours;
                stats.total_sessions_attended += 1;
                remaining - hours
            }
            LedgerEntryKind::Refund => {
                stats.total_hours_used = stats.total_hours_used.saturating_sub(hours);
                stats.total_sessions_attended = stats.total_sessions_attended.saturating_sub(1);
                remaining + hours
            }
        };
        // Totals follow the active package; a refund to an expired one while a
        // newer package is active leaves them alone.
        if account
            .active_package()
            .map_or(true, |active| active.id == package.id)
        {
            stats.total_hours_remaining = new_remaining;
        }

        let mutation = LedgerMutation {
            student_id,
            package_id: package.id,
            expected_remaining: remaining,
            new_remaining,
            stats,
            entry: LedgerEntry {
                id: Uuid::new_v4(),
                student_id,
                package_id: package.id,
                session_id: ctx.session_id,
                group_id: ctx.group_id,
                kind,
                hours,
                balance_after: new_remaining,
                reason: ctx.reason.clone(),
                actor: ctx.actor,
                created_at: Utc::now(),
            },
        };
        self.store.apply_ledger_mutation(&mutation).await?;

        info!(
            %student_id,
            session_id = %ctx.session_id,
            kind = kind.as_str(),
            hours,
            remaining_hours = new_remaining,
            "Ledger mutation applied"
        );

        Ok(LedgerReceipt {
            student_id,
            kind,
            hours,
            remaining_hours: new_remaining,
            applied: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PackageStatus;
    use crate::memory::InMemoryStore;

    fn ctx(session_id: SessionId) -> LedgerContext {
        LedgerContext {
            session_id,
            group_id: Uuid::new_v4(),
            reason: "attendance".to_string(),
            actor: None,
        }
    }

    fn setup(remaining: u32) -> (Arc<InMemoryStore>, CreditLedger, StudentId) {
        let store = Arc::new(InMemoryStore::new());
        let student = Uuid::new_v4();
        store.add_package(student, 20, remaining, PackageStatus::Active);
        let ledger = CreditLedger::new(store.clone(), 3);
        (store, ledger, student)
    }

    #[test]
    fn classifies_buckets() {
        assert_eq!(classify(0), ThresholdBucket::Zero);
        assert_eq!(classify(1), ThresholdBucket::Low);
        assert_eq!(classify(5), ThresholdBucket::Low);
        assert_eq!(classify(6), ThresholdBucket::Normal);
    }

    #[tokio::test]
    async fn charge_updates_balance_stats_and_audit() {
        let (store, ledger, student) = setup(7);
        let session = Uuid::new_v4();

        let receipt = ledger.charge(student, 2, &ctx(session)).await.unwrap();

        assert!(receipt.applied);
        assert_eq!(receipt.remaining_hours, 5);
        assert_eq!(receipt.bucket(), ThresholdBucket::Low);
        let account = store.get_credit_account(student).await.unwrap();
        assert_eq!(account.package.as_ref().unwrap().remaining_hours, 5);
        assert_eq!(account.stats.total_hours_used, 2);
        assert_eq!(account.stats.total_hours_remaining, 5);
        assert_eq!(account.stats.total_sessions_attended, 1);
        let entries = store.list_ledger_entries(student).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LedgerEntryKind::Charge);
        assert_eq!(entries[0].session_id, session);
        assert_eq!(entries[0].balance_after, 5);
        assert_eq!(entries[0].package_id, account.package.unwrap().id);
    }

    #[tokio::test]
    async fn insufficient_credit_leaves_balance_untouched() {
        let (store, ledger, student) = setup(1);

        let err = ledger.charge(student, 2, &ctx(Uuid::new_v4())).await.unwrap_err();

        assert_eq!(
            err,
            LedgerError::InsufficientCredit {
                requested: 2,
                remaining: 1
            }
        );
        let account = store.get_credit_account(student).await.unwrap();
        assert_eq!(account.package.unwrap().remaining_hours, 1);
        assert_eq!(account.stats.total_sessions_attended, 0);
        assert!(store.list_ledger_entries(student).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn charge_then_refund_restores_original_state() {
        let (store, ledger, student) = setup(10);
        let before = store.get_credit_account(student).await.unwrap();
        let c = ctx(Uuid::new_v4());

        ledger.charge(student, 2, &c).await.unwrap();
        let receipt = ledger.refund(student, 2, &c).await.unwrap();

        assert!(receipt.applied);
        assert_eq!(receipt.remaining_hours, 10);
        let after = store.get_credit_account(student).await.unwrap();
        assert_eq!(after.package, before.package);
        assert_eq!(
            after.stats.total_sessions_attended,
            before.stats.total_sessions_attended
        );
        assert_eq!(after.stats.total_hours_used, before.stats.total_hours_used);
    }

    #[tokio::test]
    async fn repeated_charge_for_same_session_is_noop() {
        let (store, ledger, student) = setup(10);
        let c = ctx(Uuid::new_v4());

        ledger.charge(student, 2, &c).await.unwrap();
        let second = ledger.charge(student, 2, &c).await.unwrap();

        assert!(!second.applied);
        assert_eq!(second.remaining_hours, 8);
        assert_eq!(store.list_ledger_entries(student).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refund_without_charge_is_noop() {
        let (store, ledger, student) = setup(10);

        let receipt = ledger.refund(student, 2, &ctx(Uuid::new_v4())).await.unwrap();

        assert!(!receipt.applied);
        assert_eq!(receipt.remaining_hours, 10);
        assert!(store.list_ledger_entries(student).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_or_inactive_package_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = CreditLedger::new(store.clone(), 3);
        let nobody = Uuid::new_v4();
        let expired = Uuid::new_v4();
        store.add_package(expired, 20, 20, PackageStatus::Expired);

        assert_eq!(
            ledger.charge(nobody, 2, &ctx(Uuid::new_v4())).await.unwrap_err(),
            LedgerError::NoActivePackage(nobody)
        );
        assert_eq!(
            ledger.charge(expired, 2, &ctx(Uuid::new_v4())).await.unwrap_err(),
            LedgerError::NoActivePackage(expired)
        );
    }

    #[tokio::test]
    async fn refund_reaches_a_package_that_expired_after_the_charge() {
        let (store, ledger, student) = setup(10);
        let c = ctx(Uuid::new_v4());
        let charged = ledger.charge(student, 2, &c).await.unwrap();
        assert_eq!(charged.remaining_hours, 8);
        store.set_package_status(student, PackageStatus::Expired);

        let receipt = ledger.refund(student, 2, &c).await.unwrap();

        assert!(receipt.applied);
        assert_eq!(receipt.remaining_hours, 10);
        let account = store.get_credit_account(student).await.unwrap();
        let package = account.package.unwrap();
        assert_eq!(package.remaining_hours, 10);
        assert_eq!(package.status, PackageStatus::Expired);
        assert_eq!(account.stats.total_sessions_attended, 0);
        let entries = store.list_ledger_entries(student).await.unwrap();
        assert_eq!(entries[0].kind, LedgerEntryKind::Refund);
        assert_eq!(entries[0].package_id, entries[1].package_id);
    }

    #[tokio::test]
    async fn conflicts_are_retried_within_limit() {
        let (store, ledger, student) = setup(10);
        store.inject_ledger_conflicts(2);

        let receipt = ledger.charge(student, 2, &ctx(Uuid::new_v4())).await.unwrap();

        assert!(receipt.applied);
        assert_eq!(receipt.remaining_hours, 8);
    }

    #[tokio::test]
    async fn conflicts_beyond_limit_surface_as_persistence() {
        let (store, ledger, student) = setup(10);
        store.inject_ledger_conflicts(10);

        let err = ledger.charge(student, 2, &ctx(Uuid::new_v4())).await.unwrap_err();

        assert!(matches!(err, LedgerError::Persistence(PortError::Conflict(_))));
        let account = store.get_credit_account(student).await.unwrap();
        assert_eq!(account.package.unwrap().remaining_hours, 10);
    }

    #[tokio::test]
    async fn concurrent_charges_for_one_student_never_overdraw() {
        let (store, ledger, student) = setup(6);
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.charge(student, 2, &ctx(Uuid::new_v4())).await
            }));
        }
        let mut ok = 0;
        let mut insufficient = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(LedgerError::InsufficientCredit { .. }) => insufficient += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(ok, 3);
        assert_eq!(insufficient, 2);
        let account = store.get_credit_account(student).await.unwrap();
        assert_eq!(account.package.unwrap().remaining_hours, 0);
        assert_eq!(account.stats.total_sessions_attended, 3);
    }
}
