//! Timezone-aware next-run computation.
//!
//! Expressions use the standard 5-field Unix layout (minute, hour,
//! day-of-month, month, day-of-week). The `cron` crate wants a leading
//! seconds field and numbers weekdays from 1 = Sunday, so numeric weekdays
//! are rewritten to names before parsing.

use std::str::FromStr;

use chrono::{DateTime, Duration, SubsecRound, TimeZone, Utc};
use chrono_tz::Tz;
use log::{debug, warn};

use crate::error::DashReportError;
use crate::schedules::Schedule;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Next run when the expression cannot be evaluated
const FALLBACK_DELAY_HOURS: i64 = 1;

/// Rewrite a Unix day-of-week field (0-7, 0 and 7 = Sunday) with day names
fn normalize_weekday_field(field: &str, expr: &str) -> Result<String, DashReportError> {
    let mut names: Vec<&str> = Vec::new();

    for part in field.split(',') {
        // Wildcards step identically over 0-6 and 1-7; names need no rewrite
        if part.starts_with('*') || part == "?" || part.chars().any(|c| c.is_ascii_alphabetic())
        {
            return Ok(field.to_string());
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step.parse::<usize>().ok().filter(|s| *s > 0).ok_or_else(|| {
                    DashReportError::Validation(format!(
                        "invalid step '{}' in cron expression '{}'",
                        step, expr
                    ))
                })?;
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = match range.split_once('-') {
            Some((start, end)) => (
                start.parse::<usize>().ok(),
                end.parse::<usize>().ok(),
            ),
            None if step > 1 => (range.parse::<usize>().ok(), Some(7)),
            None => {
                let day = range.parse::<usize>().ok();
                (day, day)
            }
        };
        let (start, end) = match (start, end) {
            (Some(start), Some(end)) if start <= end && end <= 7 => (start, end),
            _ => {
                return Err(DashReportError::Validation(format!(
                    "invalid day of week '{}' in cron expression '{}'",
                    part, expr
                )))
            }
        };

        for day in (start..=end).step_by(step) {
            let name = DAY_NAMES[day % 7];
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    Ok(names.join(","))
}

/// Convert a 5-field expression to the 6-field form the `cron` crate expects
pub fn normalize_cron_expr(expr: &str) -> Result<String, DashReportError> {
    let expr = expr.trim();
    if expr.starts_with('@') {
        return Ok(expr.to_string());
    }

    let mut fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
    if fields.len() != 5 {
        return Err(DashReportError::Validation(format!(
            "cron expression '{}' must have 5 fields",
            expr
        )));
    }
    fields.insert(0, "0".to_string());

    fields[5] = normalize_weekday_field(&fields[5], expr)?;
    Ok(fields.join(" "))
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

/// A parsed expression. When both day-of-month and day-of-week are
/// restricted a day matches if either field does, as in Unix cron, so the
/// expression is held as two schedules.
#[derive(Debug, Clone)]
pub struct CronExpr {
    schedules: Vec<cron::Schedule>,
}

impl CronExpr {
    /// First firing strictly after `after`
    pub fn next_after<Z: TimeZone>(&self, after: &DateTime<Z>) -> Option<DateTime<Z>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }
}

fn parse_normalized(normalized: &str, expr: &str) -> Result<cron::Schedule, DashReportError> {
    cron::Schedule::from_str(normalized).map_err(|e| {
        DashReportError::Validation(format!("invalid cron expression '{}': {}", expr, e))
    })
}

/// Parse a cron expression, 5-field Unix layout
pub fn parse_cron(expr: &str) -> Result<CronExpr, DashReportError> {
    if expr.trim().is_empty() {
        return Err(DashReportError::Validation(
            "cron expression cannot be empty".to_string(),
        ));
    }
    let normalized = normalize_cron_expr(expr)?;
    let fields: Vec<&str> = normalized.split_whitespace().collect();

    if fields.len() == 6 && is_restricted(fields[3]) && is_restricted(fields[5]) {
        let mut by_month_day = fields.clone();
        by_month_day[5] = "*";
        let mut by_weekday = fields.clone();
        by_weekday[3] = "*";
        return Ok(CronExpr {
            schedules: vec![
                parse_normalized(&by_month_day.join(" "), expr)?,
                parse_normalized(&by_weekday.join(" "), expr)?,
            ],
        });
    }

    Ok(CronExpr {
        schedules: vec![parse_normalized(&normalized, expr)?],
    })
}

/// Resolve an IANA zone name. Unknown names fall back to UTC with a warning.
pub fn load_timezone(name: &str) -> Tz {
    let name = name.trim();
    if name.is_empty() {
        return Tz::UTC;
    }
    match Tz::from_str(name) {
        Ok(tz) => tz,
        Err(e) => {
            warn!(
                "Unknown timezone '{}' ({}), computing next run in UTC",
                name, e
            );
            Tz::UTC
        }
    }
}

/// First firing of `cron_expr` in `timezone` strictly after `now`, in UTC,
/// whole seconds. Never fails: an unusable expression yields now + 1h.
pub fn next_run_for(cron_expr: &str, timezone: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let tz = load_timezone(timezone);
    let local_now = now.with_timezone(&tz);

    let next = parse_cron(cron_expr).and_then(|schedule| {
        schedule.next_after(&local_now).ok_or_else(|| {
            DashReportError::Validation(format!(
                "cron expression '{}' has no future firing",
                cron_expr
            ))
        })
    });

    match next {
        Ok(next) => {
            let next = next.with_timezone(&Utc).trunc_subsecs(0);
            debug!(
                "Next run for '{}' in {}: {} (local {})",
                cron_expr,
                tz.name(),
                next,
                next.with_timezone(&tz)
            );
            next
        }
        Err(e) => {
            warn!("{}; next run falls back to one hour from now", e);
            (now + Duration::hours(FALLBACK_DELAY_HOURS)).trunc_subsecs(0)
        }
    }
}

/// Next run of a schedule relative to `now`
pub fn next_run_after(schedule: &Schedule, now: DateTime<Utc>) -> DateTime<Utc> {
    next_run_for(schedule.effective_cron_expr(), &schedule.timezone, now)
}

pub fn calculate_next_run(schedule: &Schedule) -> DateTime<Utc> {
    next_run_after(schedule, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedules::test_schedule;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};
    use proptest::prelude::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_normalize_weekdays() {
        assert_eq!(normalize_cron_expr("0 0 * * 1").unwrap(), "0 0 0 * * MON");
        assert_eq!(normalize_cron_expr("0 0 * * 0").unwrap(), "0 0 0 * * SUN");
        assert_eq!(normalize_cron_expr("0 0 * * 7").unwrap(), "0 0 0 * * SUN");
        assert_eq!(
            normalize_cron_expr("30 6 * * 1-5").unwrap(),
            "0 30 6 * * MON,TUE,WED,THU,FRI"
        );
        assert_eq!(
            normalize_cron_expr("0 9 * * 5-7").unwrap(),
            "0 0 9 * * FRI,SAT,SUN"
        );
        assert_eq!(normalize_cron_expr("0 0 * * */2").unwrap(), "0 0 0 * * */2");
        assert_eq!(normalize_cron_expr("0 0 * * mon").unwrap(), "0 0 0 * * mon");
        assert!(normalize_cron_expr("0 0 * * 8").is_err());
        assert!(normalize_cron_expr("0 0 * *").is_err());
        // A sixth field would be read as seconds here but as a year by Unix tools
        assert!(normalize_cron_expr("0 0 0 * * *").is_err());
    }

    #[test]
    fn test_parse_cron_rejects_garbage() {
        assert!(parse_cron("").is_err());
        assert!(parse_cron("every day").is_err());
        assert!(parse_cron("61 0 * * *").is_err());
        assert!(parse_cron("0 0 1 * *").is_ok());
    }

    #[test]
    fn test_month_day_or_weekday() {
        // 2025-10-15 is a Wednesday: the 1st or any Monday fires next Monday
        assert_eq!(
            next_run_for("0 9 1 * 1", "UTC", utc(2025, 10, 15, 12, 0, 0)),
            utc(2025, 10, 20, 9, 0, 0)
        );
        assert_eq!(
            next_run_for("0 9 1 * 1", "UTC", utc(2025, 10, 28, 12, 0, 0)),
            utc(2025, 11, 1, 9, 0, 0)
        );
        // A wildcard weekday leaves only the day of month
        assert_eq!(
            next_run_for("0 9 1 * *", "UTC", utc(2025, 10, 15, 12, 0, 0)),
            utc(2025, 11, 1, 9, 0, 0)
        );
        assert_eq!(
            next_run_for("0 9 * * 1", "UTC", utc(2025, 10, 15, 12, 0, 0)),
            utc(2025, 10, 20, 9, 0, 0)
        );
    }

    #[test]
    fn test_daily_fires_at_next_midnight_not_now_plus_a_day() {
        // Executed at 22:35:57, the next run is the coming midnight
        let mut schedule = test_schedule(1, "daily");
        schedule.interval_type = "daily".into();
        schedule.cron_expr = String::new();
        let next = next_run_after(&schedule, utc(2025, 10, 15, 22, 35, 57));
        assert_eq!(next, utc(2025, 10, 16, 0, 0, 0));
    }

    #[test]
    fn test_weekly_and_monthly_derivations() {
        let mut schedule = test_schedule(1, "derived");
        // 2025-10-15 is a Wednesday
        schedule.interval_type = "weekly".into();
        assert_eq!(
            next_run_after(&schedule, utc(2025, 10, 15, 12, 0, 0)),
            utc(2025, 10, 20, 0, 0, 0)
        );
        schedule.interval_type = "monthly".into();
        assert_eq!(
            next_run_after(&schedule, utc(2025, 10, 15, 12, 0, 0)),
            utc(2025, 11, 1, 0, 0, 0)
        );
    }

    #[test]
    fn test_new_york_midnight_across_dst() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // Just before the spring-forward and fall-back transitions
        for now in [utc(2025, 3, 8, 12, 0, 0), utc(2025, 11, 1, 12, 0, 0)] {
            let next = next_run_for("0 0 * * *", "America/New_York", now);
            let local = next.with_timezone(&tz);
            assert_eq!((local.hour(), local.minute(), local.second()), (0, 0, 0));
            assert!(next > now);
        }
        // Midnight EST is 05:00Z, midnight EDT is 04:00Z
        assert_eq!(
            next_run_for("0 0 * * *", "America/New_York", utc(2025, 3, 8, 12, 0, 0)),
            utc(2025, 3, 9, 5, 0, 0)
        );
        assert_eq!(
            next_run_for("0 0 * * *", "America/New_York", utc(2025, 3, 9, 12, 0, 0)),
            utc(2025, 3, 10, 4, 0, 0)
        );
    }

    #[test]
    fn test_invalid_timezone_falls_back_to_utc() {
        let next = next_run_for("0 0 * * *", "Mars/Olympus_Mons", utc(2025, 10, 15, 9, 0, 0));
        assert_eq!(next, utc(2025, 10, 16, 0, 0, 0));
    }

    #[test]
    fn test_invalid_expression_falls_back_to_one_hour() {
        let now = utc(2025, 10, 15, 9, 12, 30);
        assert_eq!(
            next_run_for("not a cron", "UTC", now),
            now + Duration::hours(1)
        );
    }

    #[test]
    fn test_result_is_whole_seconds() {
        let now = utc(2025, 10, 15, 9, 12, 30) + Duration::milliseconds(250);
        assert_eq!(next_run_for("* * * * *", "UTC", now).nanosecond(), 0);
    }

    const ZONES: [&str; 5] = [
        "UTC",
        "America/New_York",
        "Europe/Berlin",
        "Asia/Kolkata",
        "Australia/Sydney",
    ];

    proptest! {
        #[test]
        fn prop_next_run_has_expected_local_clock_time(
            secs in 1_577_836_800i64..1_893_456_000i64,
            zone_idx in 0usize..ZONES.len(),
        ) {
            let now = Utc.timestamp_opt(secs, 0).unwrap();
            let zone = ZONES[zone_idx];
            let tz: Tz = zone.parse().unwrap();

            let midnight = next_run_for("0 0 * * *", zone, now);
            let local = midnight.with_timezone(&tz);
            prop_assert!(midnight > now);
            prop_assert!(midnight - now <= Duration::hours(25));
            prop_assert_eq!((local.hour(), local.minute(), local.second()), (0, 0, 0));

            let weekday = next_run_for("30 6 * * 1-5", zone, now);
            let local = weekday.with_timezone(&tz);
            prop_assert!(weekday > now);
            prop_assert_eq!((local.hour(), local.minute()), (6, 30));
            prop_assert!(!matches!(local.weekday(), Weekday::Sat | Weekday::Sun));
        }
    }
}
