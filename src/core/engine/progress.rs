// Progress computation: turn a user's filtered value rows into the single
// aggregate number a goal compares against its threshold.
//
// This is the in-memory rendition of the two nested aggregations (group
// sums, then min/max across groups). The store hands us the user's joined
// value rows; everything else happens here, which keeps the logic identical
// across storage adapters and directly testable.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;

use crate::core::engine::models::{GoalRow, MaxMin, UserValueRow};
use crate::core::engine::time_buckets;
use crate::core::expr::{ExprValue, Expression, ExpressionError, Params};

/// Aggregate the user's progress for a goal.
///
/// `rows` are all value rows of the user; `tz` is the user's zone (cadence
/// windows and date grouping are local), `now` the evaluation instant.
pub fn aggregate_progress(
    goal: &GoalRow,
    rows: &[UserValueRow],
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<f64, ExpressionError> {
    let condition = match &goal.condition {
        Some(src) => Some(Expression::parse(src)?),
        None => None,
    };

    let timespan_cutoff = goal
        .timespan
        .map(|days| now - Duration::days(days as i64));
    let period_cutoff = time_buckets::period_start(tz, goal.evaluation, now);

    let mut groups: HashMap<(Option<String>, Option<String>), i64> = HashMap::new();
    let grouping = goal.group_by_dateformat.is_some() || goal.group_by_key;
    let mut total: i64 = 0;
    let mut matched = false;

    for row in rows {
        if let Some(cond) = &condition {
            let mut params = Params::new();
            params.insert(
                "variable_name".to_string(),
                ExprValue::Str(row.variable_name.clone()),
            );
            params.insert("key".to_string(), ExprValue::Str(row.key.clone()));
            match cond.evaluate(&params)? {
                ExprValue::Bool(true) => {}
                ExprValue::Bool(false) => continue,
                other => {
                    return Err(ExpressionError::Type(format!(
                        "condition evaluated to {:?}, expected bool",
                        other
                    )))
                }
            }
        }

        if let Some(cutoff) = timespan_cutoff {
            if row.datetime < cutoff {
                continue;
            }
        }

        if let Some(cutoff) = period_cutoff {
            if row.datetime < cutoff {
                continue;
            }
        }

        matched = true;
        if grouping {
            let date_part = goal
                .group_by_dateformat
                .as_deref()
                .map(|fmt| time_buckets::format_datetime(row.datetime, tz, fmt));
            let key_part = goal.group_by_key.then(|| row.key.clone());
            *groups.entry((date_part, key_part)).or_insert(0) += row.value;
        } else {
            total += row.value;
        }
    }

    if !grouping {
        return Ok(total as f64);
    }

    if !matched {
        return Ok(0.0);
    }

    let sums = groups.values().copied();
    let picked = match goal.maxmin {
        MaxMin::Max => sums.max(),
        MaxMin::Min => sums.min(),
    };
    Ok(picked.unwrap_or(0) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::models::{Evaluation, GoalOperator};
    use chrono::TimeZone;

    fn goal() -> GoalRow {
        GoalRow {
            id: 1,
            name: "test".to_string(),
            name_translation_id: None,
            condition: None,
            evaluation: Evaluation::Immediately,
            timespan: None,
            group_by_key: false,
            group_by_dateformat: None,
            goal: Some("level*100".to_string()),
            operator: Some(GoalOperator::Geq),
            maxmin: MaxMin::Max,
            achievement_id: 1,
            priority: 0,
        }
    }

    fn row(variable: &str, key: &str, dt: DateTime<Utc>, value: i64) -> UserValueRow {
        UserValueRow {
            variable_id: 1,
            variable_name: variable.to_string(),
            datetime: dt,
            key: key.to_string(),
            value,
        }
    }

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_plain_sum_without_grouping() {
        let now = utc(2026, 3, 10, 12);
        let rows = vec![
            row("points", "", utc(2026, 3, 9, 8), 40),
            row("points", "", utc(2026, 3, 10, 9), 70),
        ];
        let tz = chrono_tz::UTC;
        assert_eq!(aggregate_progress(&goal(), &rows, tz, now).unwrap(), 110.0);
    }

    #[test]
    fn test_empty_rows_yield_zero() {
        let now = utc(2026, 3, 10, 12);
        assert_eq!(
            aggregate_progress(&goal(), &[], chrono_tz::UTC, now).unwrap(),
            0.0
        );
    }

    #[test]
    fn test_condition_filters_rows() {
        let now = utc(2026, 3, 10, 12);
        let mut g = goal();
        g.condition = Some("variable_name == \"points\"".to_string());
        let rows = vec![
            row("points", "", utc(2026, 3, 10, 9), 50),
            row("other", "", utc(2026, 3, 10, 9), 999),
        ];
        assert_eq!(aggregate_progress(&g, &rows, chrono_tz::UTC, now).unwrap(), 50.0);
    }

    #[test]
    fn test_timespan_window() {
        let now = utc(2026, 3, 10, 12);
        let mut g = goal();
        g.timespan = Some(2);
        let rows = vec![
            row("points", "", utc(2026, 3, 5, 9), 100), // outside 2 days
            row("points", "", utc(2026, 3, 9, 9), 30),
        ];
        assert_eq!(aggregate_progress(&g, &rows, chrono_tz::UTC, now).unwrap(), 30.0);
    }

    #[test]
    fn test_daily_cadence_window_in_user_zone() {
        let tz = time_buckets::parse_timezone("America/Los_Angeles");
        // 06:30 UTC on March 10 is still March 9 evening in LA
        let now = utc(2026, 3, 10, 6);
        let mut g = goal();
        g.evaluation = Evaluation::Daily;
        let rows = vec![
            // 05:00 UTC March 10 = March 9 local -> inside the LA day
            row("points", "", utc(2026, 3, 10, 5), 10),
            // March 8 local -> outside
            row("points", "", utc(2026, 3, 8, 20), 99),
        ];
        assert_eq!(aggregate_progress(&g, &rows, tz, now).unwrap(), 10.0);
    }

    #[test]
    fn test_group_by_dateformat_with_min() {
        let now = utc(2026, 3, 10, 12);
        let mut g = goal();
        g.group_by_dateformat = Some("YYYY-MM-DD".to_string());
        g.maxmin = MaxMin::Min;
        let rows = vec![
            row("latency_ms", "", utc(2026, 3, 8, 9), 120),
            row("latency_ms", "", utc(2026, 3, 9, 9), 40),
            row("latency_ms", "", utc(2026, 3, 9, 10), 5),
            row("latency_ms", "", utc(2026, 3, 10, 9), 80),
        ];
        // daily sums: 120, 45, 80 -> min 45
        assert_eq!(aggregate_progress(&g, &rows, chrono_tz::UTC, now).unwrap(), 45.0);
    }

    #[test]
    fn test_group_by_key_with_max() {
        let now = utc(2026, 3, 10, 12);
        let mut g = goal();
        g.group_by_key = true;
        let rows = vec![
            row("points", "a", utc(2026, 3, 9, 9), 10),
            row("points", "a", utc(2026, 3, 10, 9), 15),
            row("points", "b", utc(2026, 3, 10, 9), 20),
        ];
        // per-key sums: a=25, b=20 -> max 25
        assert_eq!(aggregate_progress(&g, &rows, chrono_tz::UTC, now).unwrap(), 25.0);
    }

    #[test]
    fn test_grouping_with_no_matching_rows_is_zero() {
        let now = utc(2026, 3, 10, 12);
        let mut g = goal();
        g.group_by_key = true;
        g.maxmin = MaxMin::Min;
        g.condition = Some("variable_name == 'nope'".to_string());
        let rows = vec![row("points", "", utc(2026, 3, 10, 9), 10)];
        assert_eq!(aggregate_progress(&g, &rows, chrono_tz::UTC, now).unwrap(), 0.0);
    }

    #[test]
    fn test_bad_condition_is_an_error() {
        let now = utc(2026, 3, 10, 12);
        let mut g = goal();
        g.condition = Some("variable_name ==".to_string());
        let rows = vec![row("points", "", utc(2026, 3, 10, 9), 10)];
        assert!(aggregate_progress(&g, &rows, chrono_tz::UTC, now).is_err());
    }
}
