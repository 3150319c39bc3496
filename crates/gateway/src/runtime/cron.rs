//! Timezone-aware schedule evaluation.
//!
//! Tasks describe their cadence as daily / weekly / monthly plus an HH:MM
//! local time; that compiles to a 5-field cron expression (min hour dom
//! month dow) evaluated in the task's IANA timezone. The next firing is
//! always computed strictly after the reference instant so a task can
//! never fire twice on the same UTC instant.

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};

use ma_domain::task::{Frequency, TaskSchedule};
use ma_domain::{Error, Result};

/// Parse a timezone string into a `chrono_tz::Tz`, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frequency → cron
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_hhmm(time: &str) -> Result<(u32, u32)> {
    let (h, m) = time
        .split_once(':')
        .ok_or_else(|| Error::InvalidArgs(format!("time '{time}' is not HH:MM")))?;
    let hour: u32 = h
        .parse()
        .map_err(|_| Error::InvalidArgs(format!("bad hour in '{time}'")))?;
    let minute: u32 = m
        .parse()
        .map_err(|_| Error::InvalidArgs(format!("bad minute in '{time}'")))?;
    if hour > 23 || minute > 59 {
        return Err(Error::InvalidArgs(format!("time '{time}' out of range")));
    }
    Ok((hour, minute))
}

/// Compile a schedule's frequency fields into a cron expression.
pub fn frequency_to_cron(schedule: &TaskSchedule) -> Result<String> {
    let frequency = schedule
        .frequency
        .ok_or_else(|| Error::InvalidArgs("schedule has no frequency".into()))?;
    let (hour, minute) = parse_hhmm(schedule.time.as_deref().unwrap_or("00:00"))?;

    match frequency {
        Frequency::Daily => Ok(format!("{minute} {hour} * * *")),
        Frequency::Weekly => {
            let dow = schedule.day_of_week.unwrap_or(1); // default Monday
            if dow > 6 {
                return Err(Error::InvalidArgs(format!("day_of_week {dow} out of 0..=6")));
            }
            Ok(format!("{minute} {hour} * * {dow}"))
        }
        Frequency::Monthly => {
            let dom = schedule.day_of_month.unwrap_or(1);
            if !(1..=31).contains(&dom) {
                return Err(Error::InvalidArgs(format!("day_of_month {dom} out of 1..=31")));
            }
            Ok(format!("{minute} {hour} {dom} * *"))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 5-field cron evaluator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Check if a **local** naive datetime matches a 5-field cron expression.
fn matches_naive(cron: &str, dt: &NaiveDateTime) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    field_matches(fields[0], dt.minute())
        && field_matches(fields[1], dt.hour())
        && field_matches(fields[2], dt.day())
        && field_matches(fields[3], dt.month())
        && field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Validate a 5-field cron expression.
pub fn validate_cron(cron: &str) -> Result<()> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::InvalidArgs(format!(
            "expected 5 cron fields, got {}",
            fields.len()
        )));
    }
    let ranges: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];
    let names = ["minute", "hour", "day-of-month", "month", "day-of-week"];
    for ((field, name), (min, max)) in fields.iter().zip(names).zip(ranges) {
        validate_field(field, name, min, max)?;
    }
    Ok(())
}

fn validate_field(field: &str, name: &str, min: u32, max: u32) -> Result<()> {
    if field == "*" {
        return Ok(());
    }
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step
            .parse()
            .map_err(|_| Error::InvalidArgs(format!("{name}: invalid step '*/{step}'")))?;
        if n == 0 || n > max {
            return Err(Error::InvalidArgs(format!("{name}: step {n} out of range")));
        }
        return Ok(());
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            let start: u32 = start_s
                .parse()
                .map_err(|_| Error::InvalidArgs(format!("{name}: invalid range start '{start_s}'")))?;
            let end: u32 = end_s
                .parse()
                .map_err(|_| Error::InvalidArgs(format!("{name}: invalid range end '{end_s}'")))?;
            if start < min || end > max || start > end {
                return Err(Error::InvalidArgs(format!(
                    "{name}: range {start}-{end} out of bounds {min}..={max}"
                )));
            }
        } else {
            let n: u32 = part
                .parse()
                .map_err(|_| Error::InvalidArgs(format!("{name}: invalid value '{part}'")))?;
            if n < min || n > max {
                return Err(Error::InvalidArgs(format!(
                    "{name}: value {n} out of range {min}..={max}"
                )));
            }
        }
    }
    Ok(())
}

/// Next occurrence **strictly after** `after`, evaluated in `tz`, returned
/// as UTC.
///
/// DST handling: local times inside a spring-forward gap are skipped;
/// fall-back overlaps resolve to the earliest (pre-transition) mapping.
pub fn next_fire_tz(
    cron: &str,
    after: &DateTime<Utc>,
    tz: chrono_tz::Tz,
) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;

    // Advance to the next whole local minute after `after`.
    let local_after = after.with_timezone(&tz).naive_local();
    let to_next_min = 60 - local_after.second() as i64;
    let mut candidate = local_after + chrono::Duration::seconds(to_next_min);
    candidate = candidate.with_second(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60; // one year of minutes
    for _ in 0..max_checks {
        if matches_naive(cron, &candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                chrono::LocalResult::None => {
                    // DST gap — this local minute doesn't exist.
                }
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

/// Compute a schedule's next firing after `after`: the UTC trigger plus
/// its local-time display mirror.
pub fn schedule_next(
    schedule: &TaskSchedule,
    after: &DateTime<Utc>,
) -> Result<(DateTime<Utc>, String)> {
    let cron = if schedule.cron.is_empty() {
        frequency_to_cron(schedule)?
    } else {
        schedule.cron.clone()
    };
    validate_cron(&cron)?;
    let tz = parse_tz(schedule.timezone.as_deref().unwrap_or("UTC"));
    let next = next_fire_tz(&cron, after, tz)
        .ok_or_else(|| Error::Other(format!("cron '{cron}' never fires")))?;
    let local = next.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string();
    Ok((next, local))
}
