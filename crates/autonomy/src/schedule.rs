//! The schedule grammar: `cron` (5-field expression + timezone),
//! `every` (duration literal), and one-shot `at` (RFC3339 or local
//! layouts).

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use hm_domain::{Error, Result};

use crate::cron::{cron_next_in, normalize_expr, validate_expr};

/// Job timezone: the host-local zone or a named IANA zone.
#[derive(Debug, Clone, Copy)]
pub enum JobTz {
    Local,
    Named(chrono_tz::Tz),
}

impl JobTz {
    /// `"Local"` (or empty) is the host zone; unknown names fall back to
    /// UTC with a warning.
    pub fn parse(name: &str) -> Self {
        let trimmed = name.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("local") {
            return JobTz::Local;
        }
        match trimmed.parse::<chrono_tz::Tz>() {
            Ok(tz) => JobTz::Named(tz),
            Err(_) => {
                tracing::warn!(timezone = trimmed, "unknown timezone, falling back to UTC");
                JobTz::Named(chrono_tz::UTC)
            }
        }
    }

    fn cron_next(&self, expr: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobTz::Local => cron_next_in(expr, after, chrono::Local),
            JobTz::Named(tz) => cron_next_in(expr, after, *tz),
        }
    }

    fn resolve_naive(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        let resolved = match self {
            JobTz::Local => chrono::Local.from_local_datetime(&naive).earliest()?.with_timezone(&Utc),
            JobTz::Named(tz) => tz.from_local_datetime(&naive).earliest()?.with_timezone(&Utc),
        };
        Some(resolved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    /// Standard 5-field cron expression (descriptors accepted).
    Cron {
        expr: String,
        #[serde(default = "d_local")]
        tz: String,
    },
    /// Fixed interval, e.g. `"30m"`, `"1h 15m"`.
    Every { every: String },
    /// One-shot at a wall-clock time: RFC3339 or
    /// `YYYY-MM-DD[ T]HH:MM[:SS]` in the job's timezone.
    At {
        at: String,
        #[serde(default = "d_local")]
        tz: String,
    },
}

fn d_local() -> String {
    "Local".into()
}

/// Local layouts accepted by `at`.
const AT_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

impl Schedule {
    /// Validate the schedule without computing anything.
    pub fn validate(&self, default_tz: &str) -> Result<()> {
        match self {
            Schedule::Cron { expr, .. } => {
                if !validate_expr(expr) {
                    return Err(Error::Validation(format!("bad cron expression: {expr:?}")));
                }
                Ok(())
            }
            Schedule::Every { every } => {
                humantime::parse_duration(every)
                    .map_err(|e| Error::Validation(format!("bad duration {every:?}: {e}")))?;
                Ok(())
            }
            Schedule::At { at, tz } => {
                let zone = if tz.is_empty() { default_tz } else { tz };
                parse_at(at, JobTz::parse(zone))
                    .map(|_| ())
                    .ok_or_else(|| Error::Validation(format!("bad at-time: {at:?}")))
            }
        }
    }

    /// Next fire time strictly after `after`. `Ok(None)` means the
    /// schedule will never fire again (a one-shot in the past).
    pub fn next_fire(
        &self,
        after: DateTime<Utc>,
        default_tz: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            Schedule::Cron { expr, tz } => {
                let expr = normalize_expr(expr)
                    .ok_or_else(|| Error::Validation(format!("bad cron descriptor: {expr:?}")))?;
                let zone = if tz.is_empty() { default_tz } else { tz };
                Ok(JobTz::parse(zone).cron_next(&expr, &after))
            }
            Schedule::Every { every } => {
                let dur = humantime::parse_duration(every)
                    .map_err(|e| Error::Validation(format!("bad duration {every:?}: {e}")))?;
                let dur = chrono::Duration::from_std(dur)
                    .map_err(|_| Error::Validation(format!("duration out of range: {every:?}")))?;
                Ok(Some(after + dur))
            }
            Schedule::At { at, tz } => {
                let zone = if tz.is_empty() { default_tz } else { tz };
                let when = parse_at(at, JobTz::parse(zone))
                    .ok_or_else(|| Error::Validation(format!("bad at-time: {at:?}")))?;
                Ok((when > after).then_some(when))
            }
        }
    }

    /// One-shot schedules are disabled after a successful fire.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Schedule::At { .. })
    }
}

fn parse_at(raw: &str, tz: JobTz) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for layout in AT_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return tz.resolve_naive(naive);
        }
    }
    None
}
