// Recurrence engine - pure calendar arithmetic for scheduled jobs
//
// Month and year steps use the anchored clamp policy: the n-th occurrence is
// `anchor + n months` clamped to the last day of a short month, always counted
// from the original anchor so the anchor day comes back once months are long
// enough again (Jan 31 -> Feb 29 -> Mar 31 -> Apr 30).

use chrono::{DateTime, Duration, Months, Utc};

use crate::jobs::models::{Frequency, JobStatus, ScheduledJob};

/// The `n`-th occurrence of a schedule anchored at `anchor` (n = 0 is the anchor itself)
pub fn nth_instant(anchor: DateTime<Utc>, frequency: Frequency, n: u32) -> Option<DateTime<Utc>> {
    match frequency {
        Frequency::Once => (n == 0).then_some(anchor),
        Frequency::Daily => anchor.checked_add_signed(Duration::days(i64::from(n))),
        Frequency::Weekly => anchor.checked_add_signed(Duration::weeks(i64::from(n))),
        Frequency::Monthly => anchor.checked_add_months(Months::new(n)),
        Frequency::Yearly => n
            .checked_mul(12)
            .and_then(|months| anchor.checked_add_months(Months::new(months))),
    }
}

/// Generate `count` execution instants starting at `start`.
///
/// `Once` always yields exactly one instant.
pub fn next_instants(start: DateTime<Utc>, frequency: Frequency, count: usize) -> Vec<DateTime<Utc>> {
    if frequency == Frequency::Once {
        return vec![start];
    }

    (0..count)
        .map_while(|n| u32::try_from(n).ok().and_then(|n| nth_instant(start, frequency, n)))
        .collect()
}

/// One calendar step after `last`, or `None` for one-shot jobs.
///
/// Short months clamp relative to `last`; use [`advance_from_anchor`] to keep
/// the anchor day across several steps.
pub fn advance(last: DateTime<Utc>, frequency: Frequency) -> Option<DateTime<Utc>> {
    nth_instant(last, frequency, 1).filter(|_| frequency.is_recurring())
}

/// Next due instant of a schedule after `completed` executions
pub fn advance_from_anchor(
    anchor: DateTime<Utc>,
    frequency: Frequency,
    completed: u32,
) -> Option<DateTime<Utc>> {
    if !frequency.is_recurring() {
        return None;
    }
    nth_instant(anchor, frequency, completed)
}

/// Decide whether a job stays active after an execution
pub fn terminal_status(
    execution_count: u32,
    max_executions: u32,
    frequency: Frequency,
    next_instant: Option<DateTime<Utc>>,
) -> JobStatus {
    let once_done = frequency == Frequency::Once && execution_count > 0;
    if once_done || execution_count >= max_executions || next_instant.is_none() {
        JobStatus::Completed
    } else {
        JobStatus::Active
    }
}

/// State a job moves to after one more confirmed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurrenceOutcome {
    pub execution_count: u32,
    pub status: JobStatus,
    /// `None` once the job is terminal
    pub next_execution: Option<DateTime<Utc>>,
}

pub fn outcome_after_execution(job: &ScheduledJob) -> RecurrenceOutcome {
    let execution_count = job.execution_count.saturating_add(1);
    let next = advance_from_anchor(job.scheduled_for, job.frequency, execution_count);
    let status = terminal_status(execution_count, job.max_executions, job.frequency, next);

    RecurrenceOutcome {
        execution_count,
        status,
        next_execution: if status.is_terminal() { None } else { next },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    const ALL: [Frequency; 5] = [
        Frequency::Once,
        Frequency::Daily,
        Frequency::Weekly,
        Frequency::Monthly,
        Frequency::Yearly,
    ];

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_sequences_are_strictly_increasing() {
        let starts = [at(2024, 1, 31), at(2024, 2, 29), at(2023, 12, 31), at(2025, 6, 15)];
        for start in starts {
            for frequency in ALL {
                for count in [1usize, 2, 5, 25] {
                    let instants = next_instants(start, frequency, count);
                    let expected = if frequency == Frequency::Once { 1 } else { count };
                    assert_eq!(instants.len(), expected, "{frequency} from {start}");
                    assert_eq!(instants[0], start);
                    assert!(instants.windows(2).all(|w| w[0] < w[1]));
                }
            }
        }
    }

    #[test]
    fn test_once_returns_single_instant() {
        let start = at(2024, 3, 1);
        assert_eq!(next_instants(start, Frequency::Once, 10), vec![start]);
        assert_eq!(next_instants(start, Frequency::Once, 0), vec![start]);
        assert_eq!(advance(start, Frequency::Once), None);
    }

    #[test]
    fn test_calendar_units() {
        let start = at(2024, 3, 10);
        assert_eq!(advance(start, Frequency::Daily), Some(at(2024, 3, 11)));
        assert_eq!(advance(start, Frequency::Weekly), Some(at(2024, 3, 17)));
        assert_eq!(advance(start, Frequency::Monthly), Some(at(2024, 4, 10)));
        assert_eq!(advance(start, Frequency::Yearly), Some(at(2025, 3, 10)));
    }

    #[test]
    fn test_month_end_clamps_to_anchor_day() {
        let instants = next_instants(at(2024, 1, 31), Frequency::Monthly, 4);
        let days: Vec<(u32, u32)> = instants.iter().map(|t| (t.month(), t.day())).collect();
        assert_eq!(days, vec![(1, 31), (2, 29), (3, 31), (4, 30)]);

        // Stepping relative to the clamped instant loses the anchor day
        assert_eq!(advance(at(2024, 2, 29), Frequency::Monthly), Some(at(2024, 3, 29)));
        assert_eq!(
            advance_from_anchor(at(2024, 1, 31), Frequency::Monthly, 2),
            Some(at(2024, 3, 31))
        );
    }

    #[test]
    fn test_leap_day_yearly() {
        let instants = next_instants(at(2024, 2, 29), Frequency::Yearly, 5);
        assert_eq!(instants[1], at(2025, 2, 28));
        assert_eq!(instants[4], at(2028, 2, 29));
    }

    #[test]
    fn test_terminal_status_rules() {
        let next = Some(at(2024, 1, 2));
        assert_eq!(terminal_status(1, 1, Frequency::Once, None), JobStatus::Completed);
        assert_eq!(terminal_status(1, 5, Frequency::Once, next), JobStatus::Completed);
        assert_eq!(terminal_status(2, 3, Frequency::Daily, next), JobStatus::Active);
        assert_eq!(terminal_status(3, 3, Frequency::Daily, next), JobStatus::Completed);
        assert_eq!(terminal_status(1, 3, Frequency::Daily, None), JobStatus::Completed);
        assert_eq!(terminal_status(0, 1, Frequency::Once, Some(at(2024, 1, 1))), JobStatus::Active);
    }
}
