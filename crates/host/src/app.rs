//! Host wiring: builds the coordinator, memory, turn loop, and the
//! autonomous side-channel tasks, then drives the interactive session.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hm_autonomy::{CronRunner, CronStore, HeartbeatRunner, WakeReason};
use hm_coordinator::{workspace_root, Coordinator};
use hm_domain::config::Config;
use hm_domain::llm::{ChatClient, ChatRequest, ChatResponse, Message, Role};
use hm_domain::{Error, Result};
use hm_memory::memory_md::{MemoryMdUpdater, TurnDigest};
use hm_memory::queue::UpdateQueue;
use hm_memory::{MemoryRoot, Redactor};
use hm_runtime::compaction::last_marker_index;
use hm_runtime::turn::MemoryPreamble;
use hm_runtime::{mcp, report, restart, RestartSignal, ToolRegistry, TurnLoop, TurnOptions};

use crate::outbox::FileOutbox;

const SYSTEM_PROMPT: &str = "You are Hivemind, the primary orchestrator of a local \
multi-agent coding assistant. Delegate substantial work to child agents with the \
agent_* tools; keep your own replies short and factual. Finished children are \
reported to you automatically; do not poll for them.";

/// Stand-in chat client used until a model backend is wired in.
/// Configure at least one backend; every call fails with a clear error.
struct UnconfiguredClient;

#[async_trait]
impl ChatClient for UnconfiguredClient {
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        Err(Error::chat(
            "no_model_backend_configured: wire a ChatClient implementation \
             into hm_host::App::bootstrap_with_client",
        ))
    }
}

pub struct App {
    config: Config,
    workspace: PathBuf,
    coordinator: Coordinator,
    memory_root: Option<MemoryRoot>,
    redactor: Redactor,
    turn: Arc<TurnLoop>,
    restart: RestartSignal,
    update_queue: Option<Arc<UpdateQueue>>,
    cancel: CancellationToken,
    current_run: Option<String>,
    /// Held so the cron wake channel stays open for the loop's lifetime.
    cron_wake: Option<mpsc::Sender<()>>,
}

impl App {
    /// Bootstrap with the placeholder client (model backend external).
    pub fn bootstrap(config: Config) -> Result<Self> {
        Self::bootstrap_with_client(config, Arc::new(UnconfiguredClient))
    }

    /// Full wiring against a concrete model client.
    pub fn bootstrap_with_client(config: Config, client: Arc<dyn ChatClient>) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let workspace = workspace_root(&config.memory, &cwd);
        let coordinator = Coordinator::new(&workspace);
        let restart = RestartSignal::new();
        let redactor = Redactor::from_config(&config.memory.redaction);

        let memory_root = if config.memory.enabled {
            Some(MemoryRoot::open(&workspace)?)
        } else {
            None
        };

        let mut turn = TurnLoop::new(
            client,
            Arc::new(ToolRegistry::new()),
            coordinator.clone(),
            config.compaction.clone(),
            SYSTEM_PROMPT,
        )
        .with_restart(restart.clone());

        if let Some(root) = &memory_root {
            if config.memory.auto_load_memory_into_prompt {
                turn = turn.with_memory(MemoryPreamble {
                    root: root.clone(),
                    max_chars: config.memory.memory_md_max_chars,
                });
            }
        }

        Ok(Self {
            config,
            workspace,
            coordinator,
            memory_root,
            redactor,
            turn: Arc::new(turn),
            restart,
            update_queue: None,
            cancel: CancellationToken::new(),
            current_run: None,
            cron_wake: None,
        })
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn workspace(&self) -> &std::path::Path {
        &self.workspace
    }

    fn sentinel_path(&self) -> PathBuf {
        self.workspace.join("restart.json")
    }

    /// Spawn the autonomous side-channels. Returns the heartbeat wake
    /// sender for hook integrations.
    pub fn spawn_subsystems(&mut self) -> Result<Option<mpsc::Sender<WakeReason>>> {
        let delivery: Arc<dyn hm_autonomy::DeliverySink> = Arc::new(FileOutbox::new(
            &self.workspace,
            if self.config.gateway.email.email_address.is_empty() {
                "hivemind@localhost"
            } else {
                &self.config.gateway.email.email_address
            },
        ));

        if self.config.autonomy.cron.enabled {
            let store = Arc::new(CronStore::open(
                &self.workspace,
                self.config.autonomy.cron.clone(),
            )?);
            let runner = CronRunner::new(store, self.turn.clone(), Some(delivery.clone()));
            let (wake_tx, wake_rx) = mpsc::channel(8);
            self.cron_wake = Some(wake_tx);
            tokio::spawn(runner.run_loop(self.cancel.clone(), wake_rx));
            tracing::info!("cron runner started");
        }

        let heartbeat_wake = if self.config.autonomy.heartbeat.enabled {
            let recipients = self.config.autonomy.cron.email_to.clone();
            let runner = HeartbeatRunner::new(
                self.config.autonomy.heartbeat.clone(),
                self.workspace.clone(),
                self.turn.clone(),
                delivery,
                recipients,
            );
            let (wake_tx, wake_rx) = mpsc::channel(8);
            tokio::spawn(runner.run_loop(self.cancel.clone(), wake_rx));
            tracing::info!("heartbeat runner started");
            Some(wake_tx)
        } else {
            None
        };

        if self.config.gateway.email.enabled {
            // The IMAP/SMTP transport is provided by an external crate;
            // without one the bridge stays dormant.
            tracing::warn!(
                "email gateway enabled but no mail transport is wired into this build"
            );
        }

        if let Some(root) = &self.memory_root {
            if self.config.memory.auto_update_memory_md {
                let queue = UpdateQueue::new();
                let updater = Arc::new(MemoryMdUpdater::new(
                    self.turn.client(),
                    self.config.memory.clone(),
                ));
                tokio::spawn(queue.clone().run_drainer(
                    updater,
                    root.clone(),
                    self.cancel.clone(),
                ));
                self.update_queue = Some(queue);
            }
            self.spawn_daily_summary(root.clone());
        }

        Ok(heartbeat_wake)
    }

    /// Midnight task: summarize the day that just ended, once per date.
    fn spawn_daily_summary(&self, root: MemoryRoot) {
        let client = self.turn.client();
        let redactor = self.redactor.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let now = Local::now();
                let next_midnight = (now + chrono::Duration::days(1))
                    .date_naive()
                    .and_hms_opt(0, 0, 30)
                    .unwrap_or_else(|| now.naive_local());
                let wait = (next_midnight - now.naive_local())
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(3600));
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                let yesterday = (Local::now() - chrono::Duration::days(1)).date_naive();
                match hm_memory::summary::write_daily_summary(&root, &client, yesterday, &redactor)
                    .await
                {
                    Ok(true) => tracing::info!(date = %yesterday, "daily summary written"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "daily summary failed"),
                }
            }
        });
    }

    /// Resolve the active run, creating one on first input.
    fn active_run(&mut self) -> Result<String> {
        if let Some(id) = &self.current_run {
            return Ok(id.clone());
        }
        let title = format!("session {}", Local::now().format("%Y-%m-%d %H:%M"));
        let run = self.coordinator.create_run(Some(&title), None)?;
        self.current_run = Some(run.id.clone());
        Ok(run.id)
    }

    /// One interactive turn: run, print, then feed the memory subsystem.
    pub async fn handle_user_line(&mut self, line: &str) -> Result<()> {
        // Natural-language MCP reload requests short-circuit the model.
        if mcp::text_requests_reload(line) {
            println!("mcp: no MCP manager configured in this build");
            return Ok(());
        }

        let run_id = self.active_run()?;
        let opts = TurnOptions {
            max_steps: self.config.runtime.max_steps,
            ..TurnOptions::chat(self.config.runtime.chat_tool_mode, 40)
        };

        let mut tool_records: Vec<(String, String)> = Vec::new();
        let mut emit = |m: &Message| match m.role {
            Role::Assistant => {
                let text = m.content.extract_all_text();
                if !text.is_empty() {
                    println!("{text}");
                }
            }
            Role::Tool => {
                let preview: String = m.content.extract_all_text().chars().take(120).collect();
                tool_records.push(("tool".into(), preview));
            }
            _ => {}
        };

        let outcome = self.turn.run_turn(&run_id, line, &opts, &mut emit).await?;
        drop(emit);

        self.post_turn_memory(&run_id, line, &outcome.final_text, tool_records);
        Ok(())
    }

    /// Memory side-effects of a finished turn: MEMORY.md update via the
    /// collapsing queue, session capture, and durable-note flush of any
    /// compaction summary.
    fn post_turn_memory(
        &self,
        run_id: &str,
        user_text: &str,
        final_text: &str,
        tool_records: Vec<(String, String)>,
    ) {
        let Some(root) = &self.memory_root else {
            return;
        };

        if let Some(queue) = &self.update_queue {
            queue.submit(
                run_id,
                TurnDigest {
                    run_id: run_id.to_string(),
                    user_request: user_text.to_string(),
                    assistant_reply: final_text.to_string(),
                    tool_records,
                },
            );
        }

        let today = Local::now().date_naive();
        match (
            self.coordinator.read_history(run_id),
            self.coordinator.history_fingerprint(run_id),
        ) {
            (Ok(history), Ok(Some(fingerprint))) => {
                if let Err(e) = hm_memory::capture::capture_session_from_history(
                    root,
                    run_id,
                    &history,
                    fingerprint,
                    today,
                    hm_memory::capture::DEFAULT_CAPTURE_MESSAGES,
                    &self.redactor,
                ) {
                    tracing::warn!(run_id, error = %e, "session capture failed");
                }

                // Flush durable notes out of the latest compaction summary.
                if let Some(i) = last_marker_index(&history) {
                    let summary = history[i].content.extract_all_text();
                    if let Err(e) = hm_memory::flush::flush_to_daily(
                        root,
                        &summary,
                        Some(run_id),
                        today,
                        &self.redactor,
                    ) {
                        tracing::warn!(run_id, error = %e, "durable-note flush failed");
                    }
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(run_id, error = %e, "post-turn memory read failed");
            }
            _ => {}
        }
    }

    /// Print any newly finished child results (the async poller shares
    /// its block with the in-turn `agent_wait` hook).
    pub fn report_finished_agents(&self) {
        let Some(run_id) = &self.current_run else {
            return;
        };
        match report::build_agent_report(&self.coordinator, run_id) {
            Ok(Some(agent_report)) => {
                println!("{}", agent_report.text);
                if let Err(e) = report::mark_reported(&self.coordinator, run_id, &agent_report) {
                    tracing::warn!(error = %e, "failed to persist reported results");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "agent report failed"),
        }
    }

    /// `/restart`: write the sentinel and exit 0 for the supervisor.
    pub fn restart_and_exit(&self, note: Option<&str>) -> ! {
        let mut sentinel = restart::RestartSentinel::new(
            "hivemind",
            env!("CARGO_PKG_VERSION"),
            "user requested restart",
        );
        sentinel.note = note.map(|n| n.to_string());
        sentinel.run_id = self.current_run.clone();
        if let Err(e) = restart::write_sentinel(&self.sentinel_path(), &sentinel) {
            tracing::error!(error = %e, "failed to write restart sentinel");
        }
        self.restart.request();
        self.cancel.cancel();
        tracing::info!("restarting");
        std::process::exit(0);
    }

    /// Nudge the cron loop to re-read the store (after external edits).
    pub fn wake_cron(&self) {
        if let Some(tx) = &self.cron_wake {
            let _ = tx.try_send(());
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Consume a leftover sentinel from the previous incarnation.
    pub fn log_previous_restart(&self) {
        match restart::take_sentinel(&self.sentinel_path()) {
            Ok(Some(sentinel)) => {
                tracing::info!(reason = %sentinel.reason, at = %sentinel.at, "resumed after restart");
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "could not read restart sentinel"),
        }
    }
}

/// The interactive REPL. Readline runs on a blocking thread so the
/// subsystem tasks keep ticking between prompts.
pub async fn run_interactive(mut app: App) -> anyhow::Result<()> {
    app.log_previous_restart();
    let _heartbeat_wake = app.spawn_subsystems()?;

    let mut editor = rustyline::DefaultEditor::new()?;
    loop {
        app.report_finished_agents();

        let (returned, line) = tokio::task::spawn_blocking(move || {
            let result = editor.readline("hivemind> ");
            (editor, result)
        })
        .await?;
        editor = returned;

        let line = match line {
            Ok(l) => l.trim().to_string(),
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(&line);

        match line.as_str() {
            "/exit" | "/quit" => break,
            "/version" => println!("hivemind {}", env!("CARGO_PKG_VERSION")),
            "/restart" => app.restart_and_exit(None),
            "/mcp reload" => println!("mcp: no MCP manager configured in this build"),
            _ => {
                if let Err(e) = app.handle_user_line(&line).await {
                    eprintln!("error: {e}");
                }
            }
        }
    }

    app.shutdown();
    Ok(())
}
