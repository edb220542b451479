//! The cron runner: claims due jobs, executes each as a worker-mode
//! turn with a timeout, records the outcome into the job's run log, and
//! delivers successful output.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hm_domain::Result;
use hm_runtime::{TurnLoop, TurnOptions};

use crate::store::{CronJob, CronStore};

/// Worker-mode step budget for cron tasks.
const CRON_WORKER_STEPS: usize = 20;

/// Capability seam for delivering job output (the email gateway in the
/// host wiring; a recorder in tests).
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, subject: &str, body: &str, to: &[String]) -> Result<()>;
}

pub struct CronRunner {
    store: Arc<CronStore>,
    turn: Arc<TurnLoop>,
    delivery: Option<Arc<dyn DeliverySink>>,
}

impl CronRunner {
    pub fn new(
        store: Arc<CronStore>,
        turn: Arc<TurnLoop>,
        delivery: Option<Arc<dyn DeliverySink>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            turn,
            delivery,
        })
    }

    /// The scheduler loop: claim, spawn, sleep until `next_wake` or an
    /// external wake. Iteration errors are logged, never fatal.
    pub async fn run_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut wake: mpsc::Receiver<()>,
    ) {
        let mut wake_closed = false;
        loop {
            let outcome = match self.store.claim_due(Utc::now()) {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(error = %e, "cron claim pass failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    }
                }
            };

            for job in outcome.due {
                let runner = self.clone();
                tokio::spawn(async move {
                    runner.execute_job(job).await;
                });
            }

            let sleep_for = (outcome.next_wake - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_millis(100));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep_for) => {}
                received = wake.recv(), if !wake_closed => {
                    if received.is_none() {
                        wake_closed = true;
                    }
                }
            }
        }
    }

    /// Execute one claimed job to completion: timeout, run log, finish,
    /// delivery.
    pub async fn execute_job(&self, job: CronJob) {
        let timeout = self.job_timeout(&job);
        tracing::info!(job_id = %job.id, name = %job.name, timeout_secs = timeout.as_secs(), "cron job starting");

        let started = Utc::now();
        let result = match tokio::time::timeout(timeout, self.run_job_turn(&job)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("job timed out after {}s", timeout.as_secs())),
        };

        let record = match &result {
            Ok(output) => serde_json::json!({
                "at": started.to_rfc3339(),
                "ok": true,
                "output": output,
            }),
            Err(error) => serde_json::json!({
                "at": started.to_rfc3339(),
                "ok": false,
                "error": error,
            }),
        };
        if let Err(e) = self.store.append_run_log(&job, &record) {
            tracing::warn!(job_id = %job.id, error = %e, "failed to append cron run log");
        }

        let finish_outcome = result.as_ref().map(|_| ()).map_err(|e| e.clone());
        if let Err(e) = self.store.finish(&job.id, finish_outcome) {
            tracing::warn!(job_id = %job.id, error = %e, "failed to finish cron job");
        }

        match result {
            Ok(output) => {
                self.deliver_output(&job, &output).await;
                tracing::info!(job_id = %job.id, "cron job completed");
            }
            Err(error) => {
                tracing::warn!(job_id = %job.id, error = %error, "cron job failed");
            }
        }
    }

    fn job_timeout(&self, job: &CronJob) -> Duration {
        job.timeout
            .as_deref()
            .and_then(|t| humantime::parse_duration(t).ok())
            .or_else(|| humantime::parse_duration(&self.store.config().default_timeout).ok())
            .unwrap_or(Duration::from_secs(10 * 60))
    }

    /// Resolve the job's run (one per job, keyed by metadata) and run
    /// the task as a worker-mode turn.
    async fn run_job_turn(&self, job: &CronJob) -> Result<String> {
        let coordinator = self.turn.coordinator();
        let key = serde_json::json!(job.id);
        let run = match coordinator.find_run(|r| r.metadata.get("cron_job_id") == Some(&key))? {
            Some(run) => run,
            None => {
                let mut metadata = std::collections::BTreeMap::new();
                metadata.insert("cron_job_id".into(), key.clone());
                metadata.insert("source".into(), serde_json::json!("cron"));
                coordinator.create_run(Some(&format!("cron: {}", job.name)), Some(metadata))?
            }
        };

        let now_local = Local::now();
        let header = format!(
            "[Cron] job {} ({})\nLocal time: {}\nUTC time: {}\n\nTask:\n{}",
            job.id,
            job.name,
            now_local.format("%Y-%m-%d %H:%M:%S %Z"),
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            job.task
        );

        let outcome = self
            .turn
            .run_turn(
                &run.id,
                &header,
                &TurnOptions::worker(CRON_WORKER_STEPS),
                &mut |_| {},
            )
            .await?;
        Ok(outcome.final_text)
    }

    /// Delivery is attempted only on success, to the union of the job's
    /// recipients and the fleet-wide configured list.
    async fn deliver_output(&self, job: &CronJob, output: &str) {
        let Some(delivery) = &self.delivery else {
            return;
        };
        let mut to = job.delivery.to.clone();
        for addr in &self.store.config().email_to {
            if !to.contains(addr) {
                to.push(addr.clone());
            }
        }
        if to.is_empty() || output.trim().is_empty() {
            return;
        }

        let subject = format!(
            "{} {} — {}",
            self.store.config().email_subject_prefix,
            job.name,
            Local::now().format("%Y-%m-%d %H:%M")
        );
        if let Err(e) = delivery.deliver(&subject, output, &to).await {
            tracing::warn!(job_id = %job.id, error = %e, "cron delivery failed");
        }
    }
}
