//! The cron job store: one `jobs.json` guarded by a sibling `.lock`,
//! shared by any number of scheduler processes.
//!
//! The claim procedure runs entirely under the file lock, so a job due
//! now is claimed by exactly one scheduler; the others observe its
//! `running_at` and skip it. There is deliberately no in-memory
//! authority; every tick re-reads the store.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hm_coordinator::fsio;
use hm_domain::config::CronConfig;
use hm_domain::{Error, Result};

use crate::schedule::Schedule;

/// Tiered backoff delays after consecutive failures.
fn backoff_delay(fail_count: u32) -> Duration {
    match fail_count {
        0 | 1 => Duration::from_secs(30),
        2 => Duration::from_secs(30),
        3 => Duration::from_secs(60),
        4 => Duration::from_secs(5 * 60),
        5 => Duration::from_secs(15 * 60),
        _ => Duration::from_secs(60 * 60),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDelivery {
    /// Recipients for this job's output (fleet-wide recipients from the
    /// config are appended at send time).
    #[serde(default)]
    pub to: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: Schedule,
    /// Task text handed to the turn loop in worker mode.
    pub task: String,
    #[serde(default)]
    pub delivery: JobDelivery,
    /// Per-job execution timeout; `cron.default_timeout` when unset.
    #[serde(default)]
    pub timeout: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Set while a scheduler is executing this job (the claim).
    #[serde(default)]
    pub running_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub backoff_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fail_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl CronJob {
    pub fn new(name: &str, schedule: Schedule, task: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            enabled: true,
            schedule,
            task: task.into(),
            delivery: JobDelivery::default(),
            timeout: None,
            created_at: now,
            updated_at: now,
            next_run_at: None,
            last_run_at: None,
            running_at: None,
            backoff_until: None,
            fail_count: 0,
            last_error: None,
        }
    }

    /// File-safe ID used for the per-job run log.
    pub fn safe_id(&self) -> String {
        self.id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            .take(64)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    jobs: Vec<CronJob>,
}

/// Result of one claim pass.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    /// Jobs this scheduler now owns (their `running_at` is set).
    pub due: Vec<CronJob>,
    /// When the loop should wake next, clamped by `max_timer_delay`.
    pub next_wake: DateTime<Utc>,
}

pub struct CronStore {
    path: PathBuf,
    config: CronConfig,
    stuck_run: chrono::Duration,
    max_timer_delay: chrono::Duration,
    min_refire_gap: chrono::Duration,
}

impl CronStore {
    /// `base_dir` is the project workspace root; the store lives at
    /// `cron/jobs.json` unless `cron.store_path` overrides it.
    pub fn open(base_dir: &std::path::Path, config: CronConfig) -> Result<Self> {
        let path = match &config.store_path {
            Some(p) => PathBuf::from(p),
            None => base_dir.join("cron").join("jobs.json"),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let stuck_run = parse_cfg_duration("cron.stuck_run", &config.stuck_run)?;
        let max_timer_delay = parse_cfg_duration("cron.max_timer_delay", &config.max_timer_delay)?;
        let min_refire_gap = parse_cfg_duration("cron.min_refire_gap", &config.min_refire_gap)?;

        Ok(Self {
            path,
            config,
            stuck_run,
            max_timer_delay,
            min_refire_gap,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn config(&self) -> &CronConfig {
        &self.config
    }

    /// Per-job run log path (sibling `runs/` directory).
    pub fn run_log_path(&self, job: &CronJob) -> PathBuf {
        self.path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join("runs")
            .join(format!("{}.jsonl", job.safe_id()))
    }

    fn load(&self) -> Result<StoreFile> {
        if !self.path.is_file() {
            return Ok(StoreFile::default());
        }
        fsio::read_json(&self.path)
    }

    fn persist(&self, store: &StoreFile) -> Result<()> {
        fsio::write_json_atomic(&self.path, store)
    }

    // ── CRUD ───────────────────────────────────────────────────────

    /// Validate and insert a new job.
    pub fn add_job(&self, job: CronJob) -> Result<CronJob> {
        job.schedule.validate(&self.config.default_timezone)?;
        fsio::with_lock(&self.path, || {
            let mut store = self.load()?;
            if store.jobs.iter().any(|j| j.id == job.id) {
                return Err(Error::Validation(format!("job {} already exists", job.id)));
            }
            store.jobs.push(job.clone());
            self.persist(&store)?;
            tracing::info!(job_id = %job.id, name = %job.name, "cron job added");
            Ok(job)
        })
    }

    pub fn list_jobs(&self) -> Result<Vec<CronJob>> {
        Ok(self.load()?.jobs)
    }

    pub fn remove_job(&self, id: &str) -> Result<()> {
        fsio::with_lock(&self.path, || {
            let mut store = self.load()?;
            let before = store.jobs.len();
            store.jobs.retain(|j| j.id != id);
            if store.jobs.len() == before {
                return Err(Error::NotFound(format!("cron job {id}")));
            }
            self.persist(&store)
        })
    }

    /// Mutate one job under the lock.
    pub fn update_job(&self, id: &str, f: impl FnOnce(&mut CronJob)) -> Result<CronJob> {
        fsio::with_lock(&self.path, || {
            let mut store = self.load()?;
            let job = store
                .jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| Error::NotFound(format!("cron job {id}")))?;
            f(job);
            job.updated_at = Utc::now();
            let out = job.clone();
            self.persist(&store)?;
            Ok(out)
        })
    }

    // ── Claim / finish ─────────────────────────────────────────────

    /// One claim pass at `now`. Runs entirely under the store lock.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        fsio::with_lock(&self.path, || {
            let mut store = self.load()?;
            let mut due = Vec::new();
            let mut next_wake_candidates: Vec<DateTime<Utc>> = Vec::new();
            let mut changed = false;

            for job in store.jobs.iter_mut() {
                // 1. Reclaim stuck runs.
                if let Some(run_at) = job.running_at {
                    if now - run_at > self.stuck_run {
                        tracing::warn!(job_id = %job.id, "reclaiming stuck cron run");
                        job.running_at = None;
                        job.fail_count += 1;
                        job.last_error = Some("stuck run reclaimed".into());
                        job.backoff_until = Some(
                            now + chrono::Duration::from_std(backoff_delay(job.fail_count))
                                .unwrap_or(chrono::Duration::zero()),
                        );
                        job.updated_at = now;
                        changed = true;
                    }
                }

                if !job.enabled {
                    continue;
                }

                // 2. Fill in a missing next_run_at.
                if job.next_run_at.is_none() && job.running_at.is_none() {
                    match job.schedule.next_fire(now, &self.config.default_timezone) {
                        Ok(Some(next)) => {
                            job.next_run_at = Some(next);
                            changed = true;
                        }
                        Ok(None) => {
                            // One-shot already in the past: disable.
                            job.enabled = false;
                            changed = true;
                            continue;
                        }
                        Err(e) => {
                            job.fail_count += 1;
                            job.last_error = Some(e.to_string());
                            job.backoff_until = Some(
                                now + chrono::Duration::from_std(backoff_delay(job.fail_count))
                                    .unwrap_or(chrono::Duration::zero()),
                            );
                            job.updated_at = now;
                            changed = true;
                            continue;
                        }
                    }
                }

                // 3. Honor backoff.
                if let Some(until) = job.backoff_until {
                    if until > now {
                        next_wake_candidates.push(until);
                        continue;
                    }
                }

                // 4. Skip jobs another scheduler is running.
                if job.running_at.is_some() {
                    continue;
                }

                // 5/6. Claim due jobs; schedule the rest.
                match job.next_run_at {
                    Some(next) if next <= now => {
                        job.running_at = Some(now);
                        job.updated_at = now;
                        changed = true;
                        due.push(job.clone());
                    }
                    Some(next) => next_wake_candidates.push(next),
                    None => {}
                }
            }

            if changed {
                self.persist(&store)?;
            }

            // 7. Wake for the earliest pending time, but at least every
            // max_timer_delay so external store edits are noticed.
            let cap = now + self.max_timer_delay;
            let next_wake = next_wake_candidates
                .into_iter()
                .min()
                .map(|t| t.min(cap))
                .unwrap_or(cap)
                .max(now);

            Ok(ClaimOutcome { due, next_wake })
        })
    }

    /// Release a claimed job and record its outcome.
    pub fn finish(&self, id: &str, outcome: std::result::Result<(), String>) -> Result<CronJob> {
        let now = Utc::now();
        self.update_job(id, |job| {
            job.running_at = None;
            job.last_run_at = Some(now);
            match &outcome {
                Ok(()) => {
                    job.fail_count = 0;
                    job.last_error = None;
                    job.backoff_until = None;
                    if job.schedule.is_one_shot() {
                        job.enabled = false;
                        job.next_run_at = None;
                    } else {
                        let floor = now + self.min_refire_gap;
                        job.next_run_at = job
                            .schedule
                            .next_fire(now, &self.config.default_timezone)
                            .ok()
                            .flatten()
                            .map(|t| t.max(floor));
                    }
                }
                Err(message) => {
                    job.fail_count += 1;
                    job.last_error = Some(message.clone());
                    job.backoff_until = Some(
                        now + chrono::Duration::from_std(backoff_delay(job.fail_count))
                            .unwrap_or(chrono::Duration::zero()),
                    );
                }
            }
        })
    }

    /// Append one record to a job's dated run log, under its lock.
    pub fn append_run_log(&self, job: &CronJob, record: &serde_json::Value) -> Result<()> {
        let path = self.run_log_path(job);
        fsio::with_lock(&path, || {
            fsio::append_line(&path, &serde_json::to_string(record)?)
        })
    }
}

fn parse_cfg_duration(field: &str, raw: &str) -> Result<chrono::Duration> {
    let std = humantime::parse_duration(raw)
        .map_err(|e| Error::Config(format!("{field}: bad duration {raw:?}: {e}")))?;
    chrono::Duration::from_std(std)
        .map_err(|_| Error::Config(format!("{field}: duration out of range: {raw:?}")))
}
