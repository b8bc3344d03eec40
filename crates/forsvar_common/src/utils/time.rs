// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use chrono::{DateTime, Duration, Utc};

/// Computes when the next round should fire for a scheduler that is (re)starting. A scheduler that
/// has been stopped for longer than one interval fires one interval from now instead of catching
/// up on the missed rounds.
pub fn resume_next_attack(
    last_completed: Option<DateTime<Utc>>,
    interval_secs: u64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let interval = interval_duration(interval_secs);
    match last_completed {
        Some(completed_at) => {
            let next = completed_at + interval;
            if next <= now {
                now + interval
            } else {
                next
            }
        }
        None => now + interval,
    }
}

/// Whole seconds until the target, zero if the target has passed
pub fn seconds_until(target: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let remaining = (target - now).num_seconds();
    remaining.max(0) as u64
}

/// Intervals are capped at ten years
pub fn interval_duration(interval_secs: u64) -> Duration {
    Duration::seconds(interval_secs.min(MAX_INTERVAL_SECS) as i64)
}

const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 60 * 60;
