//! Timezone-aware cron evaluator (5-field: min hour dom month dow),
//! plus `@hourly`-style descriptors.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

/// Expand a descriptor (`@hourly`, `@daily`, …) to its 5-field form.
/// Non-descriptor input is returned unchanged.
pub fn normalize_expr(expr: &str) -> Option<String> {
    let trimmed = expr.trim();
    if !trimmed.starts_with('@') {
        return Some(trimmed.to_string());
    }
    let expanded = match trimmed.to_lowercase().as_str() {
        "@hourly" => "0 * * * *",
        "@daily" | "@midnight" => "0 0 * * *",
        "@weekly" => "0 0 * * 0",
        "@monthly" => "0 0 1 * *",
        "@yearly" | "@annually" => "0 0 1 1 *",
        _ => return None,
    };
    Some(expanded.to_string())
}

/// Whether a 5-field expression (or descriptor) parses at all.
pub fn validate_expr(expr: &str) -> bool {
    let Some(expr) = normalize_expr(expr) else {
        return false;
    };
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    // Probe: every field must match at least one value in a day's sweep.
    let now = Utc::now();
    cron_next_in(&expr, &now, Utc).is_some()
}

/// Parse a cron field and check if a value matches.
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    // */N (every N)
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    // Comma-separated values, each a single number or an N-M range.
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

/// Check if a local naive datetime matches a 5-field cron expression.
fn cron_matches_naive(expr: &str, dt: &chrono::NaiveDateTime) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    cron_field_matches(fields[0], dt.minute())
        && cron_field_matches(fields[1], dt.hour())
        && cron_field_matches(fields[2], dt.day())
        && cron_field_matches(fields[3], dt.month())
        && cron_field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Next occurrence after `after`, evaluated in `tz`, returned in UTC.
///
/// DST handling: local times inside a spring-forward gap are skipped;
/// fall-back overlaps take the earliest (pre-transition) mapping.
pub fn cron_next_in<Tz: TimeZone>(
    expr: &str,
    after: &DateTime<Utc>,
    tz: Tz,
) -> Option<DateTime<Utc>> {
    let local_after = after.with_timezone(&tz).naive_local();
    let next_min_secs = 60 - (local_after.second() as i64);
    let mut candidate = local_after + chrono::Duration::seconds(next_min_secs);
    candidate = candidate.with_second(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60; // one year of minutes
    for _ in 0..max_checks {
        if cron_matches_naive(expr, &candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                chrono::LocalResult::None => {
                    // DST gap: this local minute doesn't exist.
                }
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}
