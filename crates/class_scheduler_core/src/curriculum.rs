//! crates/class_scheduler_core/src/curriculum.rs
//!
//! Expands a curriculum and a weekly pattern into an ordered list of dated
//! session blueprints. Pure: no I/O, no clock.

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};

use crate::domain::{Curriculum, WeeklyPattern};

/// One session's worth of curriculum, before a date is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurriculumSlot {
    pub module_index: usize,
    pub lesson_index: usize,
    /// 1-based, restarts at every module.
    pub session_number: u32,
}

impl CurriculumSlot {
    pub fn key(&self) -> (usize, u32) {
        (self.module_index, self.session_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBlueprint {
    pub module_index: usize,
    pub lesson_index: usize,
    pub session_number: u32,
    pub scheduled_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl SessionBlueprint {
    fn from_slot(slot: CurriculumSlot, date: NaiveDate, pattern: &WeeklyPattern) -> Self {
        Self {
            module_index: slot.module_index,
            lesson_index: slot.lesson_index,
            session_number: slot.session_number,
            scheduled_date: date,
            start_time: pattern.time_from,
            end_time: pattern.time_to,
        }
    }
}

/// Output of an expansion. `total_sessions` is the single source for the
/// session count reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub blueprints: Vec<SessionBlueprint>,
    pub total_sessions: usize,
    pub days_per_week: usize,
}

impl Expansion {
    /// ⌈total_sessions / days_per_week⌉
    pub fn estimated_weeks(&self) -> usize {
        if self.days_per_week == 0 {
            return 0;
        }
        self.total_sessions.div_ceil(self.days_per_week)
    }
}

/// Walks modules, then lessons, in order; each lesson contributes
/// `sessions_required` slots.
pub fn flatten(curriculum: &Curriculum) -> Vec<CurriculumSlot> {
    let mut slots = Vec::with_capacity(curriculum.total_sessions());
    for (module_index, module) in curriculum.modules.iter().enumerate() {
        let mut session_number = 0u32;
        for (lesson_index, lesson) in module.lessons.iter().enumerate() {
            for _ in 0..lesson.sessions_required {
                session_number += 1;
                slots.push(CurriculumSlot {
                    module_index,
                    lesson_index,
                    session_number,
                });
            }
        }
    }
    slots
}

/// Calendar dates on or after `from` whose weekday is in `days`, in order.
#[derive(Debug, Clone)]
pub struct PatternDates {
    next: Option<NaiveDate>,
    days: Vec<Weekday>,
}

impl PatternDates {
    pub fn starting(from: NaiveDate, days: &[Weekday]) -> Self {
        Self {
            next: Some(from),
            days: days.to_vec(),
        }
    }
}

impl Iterator for PatternDates {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        if self.days.is_empty() {
            return None;
        }
        loop {
            let current = self.next?;
            self.next = current.succ_opt();
            if self.days.contains(&current.weekday()) {
                return Some(current);
            }
        }
    }
}

/// Zips curriculum slots with pattern dates starting at the pattern's own
/// start date. The pattern must already be validated.
pub fn expand(curriculum: &Curriculum, pattern: &WeeklyPattern) -> Expansion {
    let slots = flatten(curriculum);
    let dates = PatternDates::starting(pattern.start_date, &pattern.days_of_week);
    let blueprints = assign_dates(&slots, dates, pattern);

    Expansion {
        total_sessions: slots.len(),
        blueprints,
        days_per_week: pattern.days_of_week.len(),
    }
}

/// Slot *i* receives the *i*-th date yielded by `dates`.
pub fn assign_dates(
    slots: &[CurriculumSlot],
    dates: impl Iterator<Item = NaiveDate>,
    pattern: &WeeklyPattern,
) -> Vec<SessionBlueprint> {
    slots
        .iter()
        .zip(dates)
        .map(|(slot, date)| SessionBlueprint::from_slot(*slot, date, pattern))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Lesson, Module};
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn pattern(start: NaiveDate, days: Vec<Weekday>) -> WeeklyPattern {
        WeeklyPattern {
            start_date: start,
            days_of_week: days,
            time_from: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            time_to: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            timezone: "UTC".to_string(),
        }
    }

    fn curriculum(modules: Vec<Vec<u32>>) -> Curriculum {
        Curriculum {
            course_id: Uuid::new_v4(),
            modules: modules
                .into_iter()
                .enumerate()
                .map(|(i, lessons)| Module {
                    title: format!("Module {}", i + 1),
                    lessons: lessons
                        .into_iter()
                        .enumerate()
                        .map(|(j, n)| Lesson::with_sessions(format!("Lesson {}", j + 1), n))
                        .collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn monday_wednesday_scenario() {
        // 2025-03-03 is a Monday.
        let c = curriculum(vec![vec![2, 2]]);
        let p = pattern(date(2025, 3, 3), vec![Weekday::Mon, Weekday::Wed]);

        let expansion = expand(&c, &p);

        assert_eq!(expansion.total_sessions, 4);
        let dates: Vec<_> = expansion.blueprints.iter().map(|b| b.scheduled_date).collect();
        assert_eq!(
            dates,
            vec![date(2025, 3, 3), date(2025, 3, 5), date(2025, 3, 10), date(2025, 3, 12)]
        );
        let numbers: Vec<_> = expansion.blueprints.iter().map(|b| b.session_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert!(expansion.blueprints.iter().all(|b| b.module_index == 0));
        assert_eq!(expansion.blueprints[2].lesson_index, 1);
        assert_eq!(expansion.estimated_weeks(), 2);
    }

    #[test]
    fn session_numbers_restart_per_module() {
        let c = curriculum(vec![vec![1, 2], vec![3]]);
        let p = pattern(date(2025, 3, 4), vec![Weekday::Tue]);

        let expansion = expand(&c, &p);

        let keys: Vec<_> = expansion
            .blueprints
            .iter()
            .map(|b| (b.module_index, b.session_number))
            .collect();
        assert_eq!(keys, vec![(0, 1), (0, 2), (0, 3), (1, 1), (1, 2), (1, 3)]);
        assert_eq!(expansion.estimated_weeks(), 6);
    }

    #[test]
    fn dates_are_strictly_increasing_and_on_pattern_days() {
        let c = curriculum(vec![vec![2, 2, 2], vec![2, 1], vec![4]]);
        let days = vec![Weekday::Tue, Weekday::Thu, Weekday::Sat];
        let p = pattern(date(2025, 12, 25), days.clone());

        let expansion = expand(&c, &p);

        assert_eq!(expansion.blueprints.len(), c.total_sessions());
        assert_eq!(expansion.blueprints[0].scheduled_date, date(2025, 12, 25));
        for pair in expansion.blueprints.windows(2) {
            assert!(pair[0].scheduled_date < pair[1].scheduled_date);
        }
        assert!(expansion
            .blueprints
            .iter()
            .all(|b| days.contains(&b.scheduled_date.weekday())));
        assert_eq!(expansion.estimated_weeks(), 5);
    }

    #[test]
    fn zero_session_lessons_contribute_nothing() {
        let c = curriculum(vec![vec![0, 1], vec![]]);
        let slots = flatten(&c);
        assert_eq!(
            slots,
            vec![CurriculumSlot {
                module_index: 0,
                lesson_index: 1,
                session_number: 1,
            }]
        );
    }

    #[test]
    fn pattern_dates_skip_to_next_matching_day() {
        // Sunday 2025-03-02 -> first Wednesday is 2025-03-05.
        let dates: Vec<_> = PatternDates::starting(date(2025, 3, 2), &[Weekday::Wed])
            .take(2)
            .collect();
        assert_eq!(dates, vec![date(2025, 3, 5), date(2025, 3, 12)]);
    }

    #[test]
    fn pattern_dates_without_days_is_empty() {
        assert_eq!(PatternDates::starting(date(2025, 3, 2), &[]).next(), None);
    }
}
