use std::time::Duration;

use chrono::Utc;

pub const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Wall-clock time as epoch milliseconds, the unit every timestamp column uses.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `d` in whole milliseconds, saturating at `i64::MAX`.
pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// `"$1, $2, ..., $n"` starting at `$first`.
pub fn placeholders(first: usize, n: usize) -> String {
    (first..first + n)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ")
}
