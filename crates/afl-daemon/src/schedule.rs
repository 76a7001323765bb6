//! Wall-clock schedule math. Pure; the loops in `jobs` own the sleeping.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

/// The first occurrence of `at` (UTC) strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(at));
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

/// How long to sleep from `now` until `next`; zero if `next` already passed.
pub fn until(now: DateTime<Utc>, next: DateTime<Utc>) -> std::time::Duration {
    (next - now).to_std().unwrap_or(std::time::Duration::ZERO)
}
