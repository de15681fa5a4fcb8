//! Human-readable schedule parsing for the CLI
//!
//! Accepted forms, tried in order:
//!
//! - `random:MIN-MAX`: a random offset in `[MIN, MAX]` after the user's
//!   latest scheduled post (or after now), for spacing out a queue
//! - unix seconds: `1767225600`
//! - RFC 3339: `2026-01-01T09:00:00Z`
//! - durations from now: `2h`, `30m`, `1day 2h`
//! - natural language: `tomorrow 9am`, `next monday 10:00`, `in 3 hours`
//!
//! The result is always a unix timestamp strictly after `now`.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::error::{CadenceError, Result};

const MIN_RANDOM_SECONDS: i64 = 30;
const MAX_RANDOM_SECONDS: i64 = 30 * 24 * 3600;

fn invalid(message: impl Into<String>) -> CadenceError {
    CadenceError::InvalidInput(message.into())
}

/// Parse `input` relative to `now`
///
/// `last_scheduled` anchors `random:` ranges so consecutive posts queue up
/// one after another.
///
/// # Errors
///
/// `CadenceError::InvalidInput` if nothing matches or the time is not in the
/// future.
pub fn parse_schedule(input: &str, now: DateTime<Utc>, last_scheduled: Option<i64>) -> Result<i64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(invalid("Schedule cannot be empty"));
    }

    let at = if let Some(range) = input.strip_prefix("random:") {
        parse_random(range, now, last_scheduled)?
    } else if let Ok(timestamp) = input.parse::<i64>() {
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| invalid(format!("Timestamp out of range: {}", timestamp)))?
    } else if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        dt.with_timezone(&Utc)
    } else if let Ok(duration) = parse_duration(input) {
        now + duration
    } else {
        chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us)
            .map_err(|_| invalid(format!("Could not understand schedule '{}'", input)))?
    };

    if at <= now {
        return Err(invalid(format!(
            "Scheduled time {} is not in the future",
            at.to_rfc3339()
        )));
    }

    Ok(at.timestamp())
}

fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input)
        .map_err(|e| invalid(format!("Could not parse duration '{}': {}", input, e)))?;

    Duration::try_seconds(std_duration.as_secs() as i64)
        .ok_or_else(|| invalid("Duration out of range"))
}

fn parse_random(range: &str, now: DateTime<Utc>, last_scheduled: Option<i64>) -> Result<DateTime<Utc>> {
    let (min, max) = range
        .split_once('-')
        .ok_or_else(|| invalid("Random schedule must look like random:MIN-MAX"))?;
    let min = parse_duration(min.trim())?.num_seconds();
    let max = parse_duration(max.trim())?.num_seconds();

    if min < MIN_RANDOM_SECONDS {
        return Err(invalid(format!(
            "Minimum random interval must be at least {} seconds",
            MIN_RANDOM_SECONDS
        )));
    }
    if max > MAX_RANDOM_SECONDS {
        return Err(invalid(format!(
            "Maximum random interval must be at most {} days",
            MAX_RANDOM_SECONDS / 86_400
        )));
    }
    if min >= max {
        return Err(invalid("Minimum must be less than maximum"));
    }

    // Anchor on the latest queued post only if it is still ahead of us
    let base = last_scheduled
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .filter(|dt| *dt > now)
        .unwrap_or(now);

    let offset = rand::thread_rng().gen_range(min..=max);
    Ok(base + Duration::seconds(offset))
}
