//! Lightweight cron expression matcher.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Field forms: *, N, N-M, */S, N/S, N-M/S and comma lists of those.
//! Example: "0 9 * * 1-5" = weekdays at 9:00
//!
//! Matching never errors: anything unparseable simply does not match.

use agentdeck_core::error::{DeckError, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

/// Upper bounds of each field, in expression order.
pub const FIELD_MAX: [u32; 5] = [59, 23, 31, 12, 6];

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];

/// Check whether `value` satisfies one cron field.
///
/// `max` only closes open-ended steps (`*/S`, `N/S`); literals outside
/// `0..=max` are not rejected, they just never match a real clock value.
pub fn matches_field(field: &str, value: u32, max: u32) -> bool {
    let field = field.trim();
    if field == "*" {
        return true;
    }
    field
        .split(',')
        .any(|part| matches_part(part.trim(), value, max))
}

fn matches_part(part: &str, value: u32, max: u32) -> bool {
    if part == "*" {
        return true;
    }

    // Step: base/step
    if let Some((base, step)) = part.split_once('/') {
        return matches_step(base, step, value, max);
    }

    // Range: start-end
    if let Some((start, end)) = part.split_once('-') {
        return match (start.parse::<u32>(), end.parse::<u32>()) {
            (Ok(start), Ok(end)) => start <= value && value <= end,
            _ => false,
        };
    }

    // Exact
    part.parse::<u32>().is_ok_and(|n| n == value)
}

fn matches_step(base: &str, step: &str, value: u32, max: u32) -> bool {
    let step = match step.parse::<u32>() {
        Ok(s) if s > 0 => s,
        _ => return false,
    };

    let (start, end) = if base == "*" {
        (0, max)
    } else if let Some((start, end)) = base.split_once('-') {
        match (start.parse::<u32>(), end.parse::<u32>()) {
            (Ok(start), Ok(end)) => (start, end),
            _ => return false,
        }
    } else {
        match base.parse::<u32>() {
            Ok(start) => (start, max),
            Err(_) => return false,
        }
    };

    value >= start && value <= end && (value - start) % step == 0
}

/// Check whether a 5-field expression matches `date` in the date's own zone.
///
/// Day-of-month and day-of-week are ANDed like every other field.
/// Day-of-week counts from Sunday = 0.
pub fn cron_matches_date<Tz: TimeZone>(expression: &str, date: &DateTime<Tz>) -> bool {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }

    let values = [
        date.minute(),
        date.hour(),
        date.day(),
        date.month(),
        date.weekday().num_days_from_sunday(),
    ];

    fields
        .iter()
        .zip(values)
        .zip(FIELD_MAX)
        .all(|((field, value), max)| matches_field(field, value, max))
}

/// Whether two instants fall in the same calendar minute of `now`'s zone.
pub fn same_minute<Tz: TimeZone>(last: &DateTime<Utc>, now: &DateTime<Tz>) -> bool {
    let last = last.with_timezone(&now.timezone());
    last.date_naive() == now.date_naive()
        && last.hour() == now.hour()
        && last.minute() == now.minute()
}

/// A trigger is due when its expression matches `now` and it has not
/// already fired within the same calendar minute.
///
/// Missed minutes are never back-filled: only `now` is checked.
pub fn is_trigger_due<Tz: TimeZone>(
    expression: &str,
    last_fired_at: Option<DateTime<Utc>>,
    now: &DateTime<Tz>,
) -> bool {
    if !cron_matches_date(expression, now) {
        return false;
    }
    match last_fired_at {
        Some(last) => !same_minute(&last, now),
        None => true,
    }
}

/// Strict syntax check for expressions entered by operators.
///
/// The matcher itself fails closed; this is used before a trigger is saved
/// so that typos surface as errors instead of a trigger that never fires.
pub fn validate_expression(expression: &str) -> Result<()> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(DeckError::InvalidCron {
            expression: expression.to_string(),
            reason: format!("expected 5 fields, got {}", fields.len()),
        });
    }

    for (i, field) in fields.iter().enumerate() {
        for part in field.split(',') {
            if !is_valid_part(part) {
                return Err(DeckError::InvalidCron {
                    expression: expression.to_string(),
                    reason: format!("bad {} field '{}'", FIELD_NAMES[i], field),
                });
            }
        }
    }
    Ok(())
}

fn is_valid_part(part: &str) -> bool {
    let is_num = |s: &str| !s.is_empty() && s.parse::<u32>().is_ok();
    let is_range = |s: &str| s.split_once('-').is_some_and(|(a, b)| is_num(a) && is_num(b));

    if part == "*" || is_num(part) || is_range(part) {
        return true;
    }
    match part.split_once('/') {
        Some((base, step)) => {
            let step_ok = step.parse::<u32>().is_ok_and(|s| s > 0);
            step_ok && (base == "*" || is_num(base) || is_range(base))
        }
        None => false,
    }
}
