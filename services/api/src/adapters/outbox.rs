//! services/api/src/adapters/outbox.rs
//!
//! Hands automation facts to the rest of the platform by appending them to the
//! `automation_outbox` table. A separate dispatcher owns message composition and
//! delivery; this adapter only records what happened.

use async_trait::async_trait;
use class_scheduler_core::domain::{AttendanceNotice, ThresholdEvent};
use class_scheduler_core::ports::{AutomationTrigger, PortError, PortResult};
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

#[derive(Serialize)]
struct ThresholdPayload<'a> {
    bucket: &'a str,
    remaining_hours: u32,
}

#[derive(Serialize)]
struct AttendancePayload<'a> {
    status: &'a str,
}

/// One outbox row, before it is written.
struct OutboxRow {
    event_type: &'static str,
    student_id: Uuid,
    session_id: Uuid,
    group_id: Uuid,
    payload: String,
}

#[derive(Clone)]
pub struct PgOutboxTrigger {
    pool: PgPool,
}

impl PgOutboxTrigger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn append(&self, rows: Vec<OutboxRow>) -> PortResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PortError::Unavailable(e.to_string()))?;

        for row in &rows {
            sqlx::query(
                "INSERT INTO automation_outbox (event_type, student_id, session_id, group_id, payload) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(row.event_type)
            .bind(row.student_id)
            .bind(row.session_id)
            .bind(row.group_id)
            .bind(&row.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        info!(count = rows.len(), "Queued automation events");
        Ok(())
    }
}

fn to_json<T: Serialize>(value: &T) -> PortResult<String> {
    serde_json::to_string(value).map_err(|e| PortError::Unexpected(e.to_string()))
}

#[async_trait]
impl AutomationTrigger for PgOutboxTrigger {
    async fn credit_thresholds_reached(&self, events: &[ThresholdEvent]) -> PortResult<()> {
        let rows = events
            .iter()
            .map(|e| {
                Ok(OutboxRow {
                    event_type: "credit_threshold",
                    student_id: e.student_id,
                    session_id: e.session_id,
                    group_id: e.group_id,
                    payload: to_json(&ThresholdPayload {
                        bucket: e.bucket.as_str(),
                        remaining_hours: e.remaining_hours,
                    })?,
                })
            })
            .collect::<PortResult<Vec<_>>>()?;
        self.append(rows).await
    }

    async fn attendance_recorded(&self, notices: &[AttendanceNotice]) -> PortResult<()> {
        let rows = notices
            .iter()
            .map(|n| {
                Ok(OutboxRow {
                    event_type: "attendance_recorded",
                    student_id: n.student_id,
                    session_id: n.session_id,
                    group_id: n.group_id,
                    payload: to_json(&AttendancePayload {
                        status: n.status.as_str(),
                    })?,
                })
            })
            .collect::<PortResult<Vec<_>>>()?;
        self.append(rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_serialize_as_flat_objects() {
        let threshold = to_json(&ThresholdPayload {
            bucket: "low",
            remaining_hours: 4,
        })
        .unwrap();
        assert_eq!(threshold, r#"{"bucket":"low","remaining_hours":4}"#);

        let attendance = to_json(&AttendancePayload { status: "late" }).unwrap();
        assert_eq!(attendance, r#"{"status":"late"}"#);
    }
}
