use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use std::collections::HashSet;

use crate::domain::ProgressStatus;

/// Canonical stored timestamp form: second precision, `Z` suffix, so the
/// TEXT columns compare lexicographically in date order.
pub fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Fixed letter-grade thresholds, applied to a percentage of the
/// assignment's max score.
pub fn letter_grade(percent: f64) -> &'static str {
    if percent >= 97.0 {
        "A+"
    } else if percent >= 93.0 {
        "A"
    } else if percent >= 90.0 {
        "A-"
    } else if percent >= 87.0 {
        "B+"
    } else if percent >= 83.0 {
        "B"
    } else if percent >= 80.0 {
        "B-"
    } else if percent >= 77.0 {
        "C+"
    } else if percent >= 73.0 {
        "C"
    } else if percent >= 70.0 {
        "C-"
    } else if percent >= 60.0 {
        "D"
    } else {
        "F"
    }
}

pub fn is_late(submitted_at: DateTime<Utc>, due_date: DateTime<Utc>) -> bool {
    submitted_at > due_date
}

/// Whole days past the due date; 0 when on time.
pub fn days_late(submitted_at: DateTime<Utc>, due_date: DateTime<Utc>) -> i64 {
    if submitted_at > due_date {
        (submitted_at - due_date).num_days()
    } else {
        0
    }
}

pub fn is_overdue(due_date: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    due_date < now
}

/// Whole days until the due date; 0 once it has passed.
pub fn days_until_due(due_date: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    if due_date < now {
        0
    } else {
        (due_date - now).num_days()
    }
}

/// Repairs the status/`completed_at` pairing on a progress record.
///
/// A completion timestamp on a `not_started` row promotes it to
/// `completed`; a `completed` row without a timestamp is demoted to
/// `in_progress`. Mutation entry points stamp `completed_at` before
/// calling this, so the demotion only fires on inconsistent input.
pub fn normalize_progress(
    status: ProgressStatus,
    completed_at: Option<DateTime<Utc>>,
) -> (ProgressStatus, Option<DateTime<Utc>>) {
    match (status, completed_at) {
        (ProgressStatus::NotStarted, Some(at)) => (ProgressStatus::Completed, Some(at)),
        (ProgressStatus::Completed, None) => (ProgressStatus::InProgress, None),
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressRollup {
    pub total: usize,
    pub completed: usize,
    pub completion_rate: f64,
    pub average_score: Option<f64>,
    pub best_score: Option<i64>,
    pub total_time_minutes: i64,
}

pub fn progress_rollup(rows: &[(ProgressStatus, Option<i64>, i64)]) -> ProgressRollup {
    let total = rows.len();
    let completed = rows
        .iter()
        .filter(|(status, _, _)| *status == ProgressStatus::Completed)
        .count();
    let completion_rate = if total > 0 {
        100.0 * completed as f64 / total as f64
    } else {
        0.0
    };

    let scores: Vec<i64> = rows.iter().filter_map(|(_, score, _)| *score).collect();
    let average_score = if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<i64>() as f64 / scores.len() as f64)
    };
    let best_score = scores.iter().max().copied();
    let total_time_minutes = rows.iter().map(|(_, _, t)| t).sum();

    ProgressRollup {
        total,
        completed,
        completion_rate,
        average_score,
        best_score,
        total_time_minutes,
    }
}

/// Consecutive calendar days of recorded activity, walking backward from
/// the day before `today`, capped at 30. Activity today neither starts
/// nor breaks the streak; the first inactive day ends the walk.
pub fn study_streak(active_days: &HashSet<NaiveDate>, today: NaiveDate) -> u32 {
    let mut streak = 0u32;
    for offset in 1..=30 {
        let day = today - Duration::days(offset);
        if active_days.contains(&day) {
            streak += 1;
        } else {
            break;
        }
    }
    streak
}
