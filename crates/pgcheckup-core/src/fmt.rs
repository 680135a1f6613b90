//! Shared formatting helpers for report payloads.
//!
//! All pure formatting functions (no I/O) live here. Byte sizes always use
//! IEC prefixes since PostgreSQL sizes are powers of 1024.

use chrono::{DateTime, SecondsFormat, Utc};

const IEC_UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

// ---------------------------------------------------------------------------
// Sizes
// ---------------------------------------------------------------------------

/// Format byte count with IEC prefixes.
///
/// Picks the largest unit where the scaled value is at least 1, then:
/// `>= 100` -> no decimals, `>= 10` -> one decimal, otherwise two decimals.
/// `0` -> `"0 B"`; plain bytes are never printed with decimals.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < IEC_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        return format!("{} B", bytes);
    }
    let precision = if value >= 100.0 {
        0
    } else if value >= 10.0 {
        1
    } else {
        2
    };
    format!("{:.*} {}", precision, value, IEC_UNITS[unit])
}

/// Same as [`format_bytes`] for signed inputs; negatives render as `"0 B"`.
pub fn format_bytes_i64(bytes: i64) -> String {
    format_bytes(u64::try_from(bytes).unwrap_or(0))
}

/// Format a size given in KiB: `"8 MiB"` when evenly divisible by 1024,
/// otherwise `"1536 KiB"`. Never loses precision.
pub fn format_kib_exact(kib: i64) -> String {
    if kib != 0 && kib % 1024 == 0 {
        format!("{} MiB", kib / 1024)
    } else {
        format!("{} KiB", kib)
    }
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Format a millisecond value: whole seconds when evenly divisible, else ms.
///
/// `2000` -> `"2 s"`, `1500` -> `"1500 ms"`, `0` -> `"0 ms"`.
pub fn format_ms_exact(ms: i64) -> String {
    if ms >= 1000 && ms % 1000 == 0 {
        format!("{} s", ms / 1000)
    } else {
        format!("{} ms", ms)
    }
}

/// Format uptime seconds for summaries: `"3d 4h"`, `"2h 5m"`, `"42s"`.
pub fn format_uptime(secs: i64) -> String {
    if secs <= 0 {
        "0s".to_string()
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// RFC 3339 rendering of an epoch timestamp, UTC, second precision.
pub fn format_epoch_rfc3339(epoch_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// RFC 3339 rendering of "now", UTC, microsecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// Truncate string to at most `max_chars` characters (char-boundary safe).
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
