//! crates/class_scheduler_core/src/schedule.rs
//!
//! Weekly pattern validation. Runs before any expansion so that a bad pattern
//! never produces a partial schedule.

use chrono::Datelike;
use std::collections::HashSet;

use crate::domain::WeeklyPattern;
use crate::error::ScheduleViolation;

pub const MIN_DAYS_PER_WEEK: usize = 1;
pub const MAX_DAYS_PER_WEEK: usize = 3;

/// Checks every rule and reports all violations at once.
pub fn validate_pattern(pattern: &WeeklyPattern) -> Result<(), Vec<ScheduleViolation>> {
    let mut violations = Vec::new();

    let count = pattern.days_of_week.len();
    if !(MIN_DAYS_PER_WEEK..=MAX_DAYS_PER_WEEK).contains(&count) {
        violations.push(ScheduleViolation::DayCount(count));
    }

    let mut seen = HashSet::new();
    for day in &pattern.days_of_week {
        if !seen.insert(*day) {
            violations.push(ScheduleViolation::DuplicateDay(*day));
        }
    }

    let weekday = pattern.start_date.weekday();
    if !pattern.includes(weekday) {
        violations.push(ScheduleViolation::StartDayMismatch {
            date: pattern.start_date,
            weekday,
        });
    }

    if pattern.time_to <= pattern.time_from {
        violations.push(ScheduleViolation::TimeRange {
            from: pattern.time_from,
            to: pattern.time_to,
        });
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}
