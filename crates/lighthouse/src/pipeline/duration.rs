//! Durations as written in pipeline timeouts (`1h0m0s`, `15m`).

use std::time::Duration;

use crate::error::{Error, Result};

/// Parse a duration such as `15m`, `1h0m0s` or `168h`. A bare `0` means zero.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(value).map_err(|e| Error::InvalidDuration {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Render like Go's `time.Duration.String` for whole and fractional seconds: `15m0s`, `1h0m0s`, `1.5s`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let millis = d.subsec_millis();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    let seconds = if millis == 0 {
        format!("{seconds}s")
    } else {
        let frac = format!("{millis:03}");
        format!("{seconds}.{}s", frac.trim_end_matches('0'))
    };
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}")
    } else {
        seconds
    }
}
