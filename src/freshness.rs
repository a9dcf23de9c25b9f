//! Freshness Policy (C1): a pure, deterministic partition of courses into due/not-due per
//! source, given a single captured wall-clock reading.

use chrono::{DateTime, Utc};

use crate::{
    config::FreshnessOptions,
    model::{Course, Source},
};

#[derive(Debug, Default)]
pub struct DueSet {
    pub due_lms: Vec<Course>,
    pub due_exam: Vec<Course>,
}

/// Partitions `courses` into the due-lms and due-exam lists as of `now`. Reads `now` exactly
/// once (it is passed in, not read internally) so both lists are computed against the same
/// instant.
pub fn compute_due(courses: &[Course], now: DateTime<Utc>, opts: &FreshnessOptions) -> DueSet {
    let mut due = DueSet::default();
    for course in courses {
        if is_due(course.fresh_at(Source::Lms), now, opts.t_lms) {
            due.due_lms.push(course.clone());
        }
        if is_due(course.fresh_at(Source::Exam), now, opts.t_exam) {
            due.due_exam.push(course.clone());
        }
    }
    due
}

fn is_due(ts: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
    match ts {
        None => true,
        Some(ts) => {
            let age = now.signed_duration_since(ts);
            match chrono::Duration::from_std(threshold) {
                Ok(threshold) => age > threshold,
                Err(_) => true,
            }
        }
    }
}
