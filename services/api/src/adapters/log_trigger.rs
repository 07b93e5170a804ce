//! services/api/src/adapters/log_trigger.rs
//!
//! An `AutomationTrigger` that only writes the facts to the log. Used with the
//! in-memory backend, where there is no outbox table to append to.

use async_trait::async_trait;
use class_scheduler_core::domain::{AttendanceNotice, ThresholdEvent};
use class_scheduler_core::ports::{AutomationTrigger, PortResult};
use tracing::info;

#[derive(Clone, Default)]
pub struct LogTrigger;

#[async_trait]
impl AutomationTrigger for LogTrigger {
    async fn credit_thresholds_reached(&self, events: &[ThresholdEvent]) -> PortResult<()> {
        for event in events {
            info!(
                student_id = %event.student_id,
                session_id = %event.session_id,
                bucket = event.bucket.as_str(),
                remaining_hours = event.remaining_hours,
                "Credit threshold reached"
            );
        }
        Ok(())
    }

    async fn attendance_recorded(&self, notices: &[AttendanceNotice]) -> PortResult<()> {
        for notice in notices {
            info!(
                student_id = %notice.student_id,
                session_id = %notice.session_id,
                status = notice.status.as_str(),
                "Attendance recorded"
            );
        }
        Ok(())
    }
}
