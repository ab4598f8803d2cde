// Zone-aware time arithmetic for the values store and the progress engine.
//
// Bucket boundaries and cadence windows are computed in the user's IANA
// zone: "today" starts at local midnight, weeks start on the local Monday,
// and DST transitions shift the boundary with the local clock instead of a
// fixed UTC offset.

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::core::engine::models::{Evaluation, VariableGroup};

/// Parse an IANA zone name, falling back to UTC for anything unknown.
pub fn parse_timezone(name: &str) -> Tz {
    name.parse().unwrap_or(chrono_tz::UTC)
}

/// Midnight of `date` in `tz`, as a UTC instant.
///
/// Ambiguous local times (DST fall-back) resolve to the earlier instant;
/// nonexistent local midnights (DST spring-forward across 00:00) fall
/// forward to the first valid hour.
fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    let local = match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earlier, _) => earlier,
        LocalResult::None => {
            let mut candidate = None;
            for hour in 1..=3u32 {
                let shifted = naive + chrono::Duration::hours(hour as i64);
                if let LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) =
                    tz.from_local_datetime(&shifted)
                {
                    candidate = Some(dt);
                    break;
                }
            }
            match candidate {
                Some(dt) => dt,
                None => return Utc.from_utc_datetime(&naive),
            }
        }
    };
    local.with_timezone(&Utc)
}

/// The bucket a value written at `now` collapses into, per the variable's
/// group and the user's zone.
pub fn bucket_datetime(tz: Tz, group: VariableGroup, now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let date = local.date_naive();

    match group {
        VariableGroup::Year => {
            let jan1 = NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date);
            local_midnight(tz, jan1)
        }
        VariableGroup::Month => {
            let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date);
            local_midnight(tz, first)
        }
        VariableGroup::Week => {
            let monday = date - chrono::Duration::days(local.weekday().num_days_from_monday() as i64);
            local_midnight(tz, monday)
        }
        VariableGroup::Day => local_midnight(tz, date),
        VariableGroup::None => now,
    }
}

/// Start of the current cadence window in the user's zone, or `None` when
/// the cadence applies no window (`immediately`, `end`).
pub fn period_start(tz: Tz, evaluation: Evaluation, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let group = match evaluation {
        Evaluation::Daily => VariableGroup::Day,
        Evaluation::Weekly => VariableGroup::Week,
        Evaluation::Monthly => VariableGroup::Month,
        Evaluation::Yearly => VariableGroup::Year,
        Evaluation::Immediately | Evaluation::End => return None,
    };
    Some(bucket_datetime(tz, group, now))
}

/// First instant of the next local day in `tz`, as a UTC instant. Used to
/// expire per-day caches at the user's midnight.
pub fn end_of_day(tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.with_timezone(&tz).date_naive() + chrono::Duration::days(1);
    local_midnight(tz, tomorrow)
}

/// `to_char`-style date formatting, evaluated in the user's zone.
///
/// Supported tokens: YYYY IYYY YY MM DD ID D IW WW HH24 HH12 MI SS Q.
/// Anything else is copied through literally.
pub fn format_datetime(dt: DateTime<Utc>, tz: Tz, format: &str) -> String {
    let local = dt.with_timezone(&tz);
    let mut out = String::with_capacity(format.len());
    let chars: Vec<char> = format.chars().collect();
    let mut i = 0;

    // longest token first so e.g. "YYYY" is not read as "YY" twice
    const TOKENS: &[&str] = &[
        "IYYY", "YYYY", "HH24", "HH12", "YY", "MM", "DD", "ID", "IW", "WW", "MI", "SS", "D", "Q",
    ];

    while i < chars.len() {
        let rest: String = chars[i..].iter().collect();
        let mut matched = false;
        for token in TOKENS {
            if rest.starts_with(token) {
                out.push_str(&render_token(token, &local));
                i += token.len();
                matched = true;
                break;
            }
        }
        if !matched {
            out.push(chars[i]);
            i += 1;
        }
    }

    out
}

fn render_token(token: &str, local: &DateTime<Tz>) -> String {
    match token {
        "YYYY" => format!("{:04}", local.year()),
        "IYYY" => format!("{:04}", local.iso_week().year()),
        "YY" => format!("{:02}", local.year().rem_euclid(100)),
        "MM" => format!("{:02}", local.month()),
        "DD" => format!("{:02}", local.day()),
        "HH24" => format!("{:02}", local.hour()),
        "HH12" => format!("{:02}", local.hour12().1),
        "MI" => format!("{:02}", local.minute()),
        "SS" => format!("{:02}", local.second()),
        // ISO day of the week, Monday = 1
        "ID" => format!("{}", local.weekday().number_from_monday()),
        // day of the week, Sunday = 1
        "D" => format!("{}", local.weekday().num_days_from_sunday() + 1),
        "IW" => format!("{:02}", local.iso_week().week()),
        "WW" => format!("{:02}", (local.ordinal() - 1) / 7 + 1),
        "Q" => format!("{}", (local.month() - 1) / 3 + 1),
        _ => token.to_string(),
    }
}
