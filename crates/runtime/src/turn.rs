//! The turn loop: drive one round of `user → model → {tool calls}* →
//! assistant content` for an agent context.
//!
//! Every produced message goes through the `emit` callback in exactly
//! the order the model would see it on the next step: tool messages
//! follow their originating assistant message, and post-hook system
//! notes follow the tool messages they annotate. At end of turn the
//! accumulated slice is appended to the run's durable history.

use std::sync::Arc;

use chrono::{Local, Utc};

use hm_coordinator::Coordinator;
use hm_domain::config::{ChatToolMode, PromptMode};
use hm_domain::llm::{ChatClient, Message, ToolCall};
use hm_domain::Result;
use hm_memory::memory_md::sanitized_for_prompt;
use hm_memory::MemoryRoot;

use crate::compaction::{last_marker_index, Compactor};
use crate::mcp::{self, McpReloader};
use crate::policy::ToolPolicy;
use crate::report;
use crate::restart::RestartSignal;
use crate::tools::ToolRegistry;

use hm_coordinator::{AgentEventKind, NewEvent, PRIMARY_AGENT_ID};

/// Capability seam to the skills catalog (loader out of scope).
pub trait SkillsIndex: Send + Sync {
    /// Rendered index injected into the system prompt.
    fn render_index(&self) -> String;
    /// Re-scan after an install/create.
    fn reload(&self) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options & outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub prompt_mode: PromptMode,
    pub chat_tool_mode: ChatToolMode,
    /// Maximum model steps for this turn.
    pub max_steps: usize,
    pub model: Option<String>,
    /// Allow blocking waits regardless of the user's phrasing (set by
    /// channels that must return one coherent reply).
    pub force_blocking_wait: bool,
}

impl TurnOptions {
    pub fn chat(chat_tool_mode: ChatToolMode, max_steps: usize) -> Self {
        Self {
            prompt_mode: PromptMode::Chat,
            chat_tool_mode,
            max_steps,
            model: None,
            force_blocking_wait: false,
        }
    }

    pub fn worker(max_steps: usize) -> Self {
        Self {
            prompt_mode: PromptMode::Worker,
            chat_tool_mode: ChatToolMode::Full,
            max_steps,
            model: None,
            force_blocking_wait: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// The last assistant content (the final reply on a clean finish).
    pub final_text: String,
    pub steps: usize,
    /// True when the loop returned early because a restart was requested.
    pub restart_requested: bool,
    /// True when the step cap was hit before a content-only reply.
    pub turn_capped: bool,
}

/// Memory injection settings for the preamble.
#[derive(Clone)]
pub struct MemoryPreamble {
    pub root: MemoryRoot,
    pub max_chars: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnLoop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnLoop {
    client: Arc<dyn ChatClient>,
    tools: Arc<ToolRegistry>,
    coordinator: Coordinator,
    compactor: Compactor,
    system_prompt: String,
    mcp: Option<Arc<dyn McpReloader>>,
    skills: Option<Arc<dyn SkillsIndex>>,
    memory: Option<MemoryPreamble>,
    restart: RestartSignal,
}

impl TurnLoop {
    pub fn new(
        client: Arc<dyn ChatClient>,
        tools: Arc<ToolRegistry>,
        coordinator: Coordinator,
        compaction: hm_domain::config::CompactionConfig,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            compactor: Compactor::new(client.clone(), compaction),
            client,
            tools,
            coordinator,
            system_prompt: system_prompt.into(),
            mcp: None,
            skills: None,
            memory: None,
            restart: RestartSignal::new(),
        }
    }

    pub fn with_mcp(mut self, mcp: Arc<dyn McpReloader>) -> Self {
        self.mcp = Some(mcp);
        self
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillsIndex>) -> Self {
        self.skills = Some(skills);
        self
    }

    pub fn with_memory(mut self, memory: MemoryPreamble) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_restart(mut self, restart: RestartSignal) -> Self {
        self.restart = restart;
        self
    }

    pub fn client(&self) -> Arc<dyn ChatClient> {
        self.client.clone()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    fn full_system_prompt(&self) -> String {
        match &self.skills {
            Some(skills) => {
                let index = skills.render_index();
                if index.is_empty() {
                    self.system_prompt.clone()
                } else {
                    format!("{}\n\n## Available skills\n{index}", self.system_prompt)
                }
            }
            None => self.system_prompt.clone(),
        }
    }

    fn build_preamble(&self, run_id: &str) -> Vec<Message> {
        let mut preamble = vec![Message::system(self.full_system_prompt())];

        let now_local = Local::now();
        preamble.push(Message::system(format!(
            "[System Message] Current time: {} (local) / {} (UTC)",
            now_local.format("%Y-%m-%d %H:%M:%S %Z"),
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        )));

        if let Some(mem) = &self.memory {
            if let Some(text) = sanitized_for_prompt(&mem.root, mem.max_chars) {
                preamble.push(Message::system(format!(
                    "[System Message] MEMORY.md (auto-loaded, durable notes):\n{text}"
                )));
            }
        }

        preamble.push(Message::system(format!(
            "[System Message] Session context: run_id={run_id}"
        )));
        preamble
    }

    /// Run one turn against `run_id`. `emit` observes every message in
    /// model order; the turn's slice is committed to durable history on
    /// every exit path.
    pub async fn run_turn(
        &self,
        run_id: &str,
        user_text: &str,
        opts: &TurnOptions,
        emit: &mut (dyn FnMut(&Message) + Send),
    ) -> Result<TurnOutcome> {
        self.coordinator.ensure_primary(run_id)?;
        let policy = if opts.force_blocking_wait {
            ToolPolicy::new_forced_wait(opts.prompt_mode, opts.chat_tool_mode)
        } else {
            ToolPolicy::new(opts.prompt_mode, opts.chat_tool_mode, user_text)
        };
        let mut visible_defs = self.tools.definitions_where(|n| policy.visible(n));

        // Preamble + persisted history pruned to the last compaction
        // marker (earlier history was already replaced by its summary).
        let mut req_messages = self.build_preamble(run_id);
        let full_history = self.coordinator.read_history(run_id)?;
        let pruned = match last_marker_index(&full_history) {
            Some(i) => &full_history[i..],
            None => &full_history[..],
        };
        req_messages.extend_from_slice(pruned);

        let user_msg = Message::user(user_text);
        emit(&user_msg);
        req_messages.push(user_msg.clone());
        let mut turn_history = vec![user_msg];

        let mut outcome = TurnOutcome::default();
        let max_steps = opts.max_steps.max(1);

        for step in 0..max_steps {
            if self.restart.is_requested() {
                outcome.restart_requested = true;
                break;
            }
            outcome.steps = step + 1;

            let (resp, marker) = self
                .compactor
                .chat_with_compaction(&mut req_messages, &visible_defs, opts.model.as_deref())
                .await
                .map_err(|e| {
                    // Commit what we have before surfacing the failure.
                    if let Err(commit) = self.coordinator.append_history(run_id, &turn_history) {
                        tracing::warn!(run_id, error = %commit, "failed to commit partial turn history");
                    }
                    e
                })?;
            if let Some(marker) = marker {
                emit(&marker);
                turn_history.push(marker);
            }

            let assistant = Message::assistant_with_tool_calls(&resp.content, &resp.tool_calls);
            emit(&assistant);
            req_messages.push(assistant.clone());
            turn_history.push(assistant);
            outcome.final_text = resp.content.clone();

            if resp.tool_calls.is_empty() {
                self.coordinator.append_history(run_id, &turn_history)?;
                return Ok(outcome);
            }

            // ── Tool dispatch ─────────────────────────────────────────
            let mut reload_scheduled = false;
            let mut wait_saw_terminal = false;
            let mut skills_dirty = false;

            for tc in &resp.tool_calls {
                let content = self.dispatch_tool(&policy, run_id, tc).await;
                let is_error = content.starts_with("ERROR:");

                if mcp::call_triggers_reload(&tc.tool_name, &tc.arguments) && !is_error {
                    reload_scheduled = true;
                }
                if tc.tool_name == "agent_wait" && !is_error && json_shows_terminal(&content) {
                    wait_saw_terminal = true;
                }
                if !is_error
                    && tc.tool_name.starts_with("skill_")
                    && (tc.tool_name.contains("install") || tc.tool_name.contains("create"))
                {
                    skills_dirty = true;
                }

                let tool_msg = Message::tool_result(&tc.call_id, &content);
                emit(&tool_msg);
                req_messages.push(tool_msg.clone());
                turn_history.push(tool_msg);
            }

            // ── Post-hooks (notes follow the tool messages) ───────────
            if reload_scheduled {
                let note = self.run_mcp_reload().await;
                let msg = Message::system(note);
                emit(&msg);
                req_messages.push(msg.clone());
                turn_history.push(msg);
            }

            if wait_saw_terminal {
                match report::build_agent_report(&self.coordinator, run_id) {
                    Ok(Some(agent_report)) => {
                        let msg = Message::system(&agent_report.text);
                        emit(&msg);
                        req_messages.push(msg.clone());
                        turn_history.push(msg);
                        if let Err(e) =
                            report::mark_reported(&self.coordinator, run_id, &agent_report)
                        {
                            tracing::warn!(run_id, error = %e, "failed to persist reported results");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(run_id, error = %e, "agent report build failed");
                    }
                }
            }

            if skills_dirty {
                if let Some(skills) = &self.skills {
                    if let Err(e) = skills.reload() {
                        tracing::warn!(error = %e, "skills reload failed");
                    }
                    // Refresh the system prompt in place for later steps.
                    req_messages[0] = Message::system(self.full_system_prompt());
                    visible_defs = self.tools.definitions_where(|n| policy.visible(n));
                }
            }
        }

        if !outcome.restart_requested {
            outcome.turn_capped = true;
            tracing::warn!(run_id, steps = outcome.steps, "turn cap reached");
        }
        self.coordinator.append_history(run_id, &turn_history)?;
        Ok(outcome)
    }

    /// Invoke one tool. Policy violations and tool failures both become
    /// `"ERROR: …"` content for the model; nothing aborts the loop.
    async fn dispatch_tool(&self, policy: &ToolPolicy, run_id: &str, tc: &ToolCall) -> String {
        if let Err(msg) = policy.check_invocation(&tc.tool_name) {
            return format!("ERROR: {msg}");
        }
        let Some(tool) = self.tools.get(&tc.tool_name) else {
            return format!("ERROR: unknown tool '{}'", tc.tool_name);
        };

        let args = prepare_args(policy, run_id, tc);

        self.log_event(
            run_id,
            NewEvent::new(AgentEventKind::ToolCallStarted).with_message(&tc.tool_name),
        );
        let result = match tool.invoke(args).await {
            Ok(content) => content,
            Err(e) => format!("ERROR: {e}"),
        };
        self.log_event(
            run_id,
            NewEvent::new(AgentEventKind::ToolCallFinished).with_message(&tc.tool_name),
        );
        result
    }

    fn log_event(&self, run_id: &str, event: NewEvent) {
        if let Err(e) = self.coordinator.append_event(run_id, PRIMARY_AGENT_ID, event) {
            tracing::warn!(run_id, error = %e, "failed to append primary event");
        }
    }

    async fn run_mcp_reload(&self) -> String {
        match &self.mcp {
            Some(reloader) => match reloader.reload().await {
                Ok(status) => {
                    tracing::info!(status = %status, "MCP auto-reload completed");
                    format!("[System Message] MCP auto-reload completed: {status}")
                }
                Err(e) => {
                    tracing::warn!(error = %e, "MCP auto-reload failed");
                    format!("[System Message] MCP auto-reload failed: {e}")
                }
            },
            None => "[System Message] MCP auto-reload skipped: no MCP manager configured".into(),
        }
    }
}

/// Inject `run_id` where the orchestration tools expect it, and clamp
/// wait timeouts in chat mode.
fn prepare_args(policy: &ToolPolicy, run_id: &str, tc: &ToolCall) -> serde_json::Value {
    let mut args = if tc.arguments.is_object() {
        tc.arguments.clone()
    } else {
        serde_json::json!({})
    };

    let needs_run_id = tc.tool_name.starts_with("agent_") || tc.tool_name == "subagents";
    if let serde_json::Value::Object(map) = &mut args {
        if needs_run_id && !map.contains_key("run_id") {
            map.insert("run_id".into(), serde_json::json!(run_id));
        }
        if ToolPolicy::is_wait_tool(&tc.tool_name) {
            let requested = map
                .get("timeout_seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            map.insert(
                "timeout_seconds".into(),
                serde_json::json!(policy.clamp_wait_timeout(requested)),
            );
        }
    }
    args
}

/// Whether a tool result JSON reports any terminal agent status.
fn json_shows_terminal(content: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(content) else {
        return false;
    };
    fn walk(v: &serde_json::Value) -> bool {
        match v {
            serde_json::Value::Object(map) => {
                if let Some(status) = map.get("status").and_then(|s| s.as_str()) {
                    if matches!(status, "completed" | "failed" | "canceled") {
                        return true;
                    }
                }
                map.values().any(walk)
            }
            serde_json::Value::Array(items) => items.iter().any(walk),
            _ => false,
        }
    }
    walk(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::FixedTool;
    use async_trait::async_trait;
    use hm_domain::config::CompactionConfig;
    use hm_domain::llm::{ChatRequest, ChatResponse, Role};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct ScriptedClient {
        script: Mutex<Vec<ChatResponse>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
            })
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            let mut script = self.script.lock();
            if script.is_empty() {
                Ok(ChatResponse {
                    content: "fallback".into(),
                    ..Default::default()
                })
            } else {
                Ok(script.remove(0))
            }
        }
    }

    fn text_reply(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            ..Default::default()
        }
    }

    fn tool_reply(name: &str, args: serde_json::Value) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                call_id: format!("tc_{name}"),
                tool_name: name.into(),
                arguments: args,
            }],
            ..Default::default()
        }
    }

    struct FakeReloader {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl McpReloader for FakeReloader {
        async fn reload(&self) -> Result<String> {
            *self.calls.lock() += 1;
            Ok("3 tools".into())
        }
    }

    fn harness(
        script: Vec<ChatResponse>,
        tools: ToolRegistry,
    ) -> (TempDir, TurnLoop, String) {
        let dir = TempDir::new().unwrap();
        let coordinator = Coordinator::new(dir.path());
        let run = coordinator.create_run(Some("test"), None).unwrap();
        let client = ScriptedClient::new(script);
        let looped = TurnLoop::new(
            client,
            Arc::new(tools),
            coordinator,
            CompactionConfig::default(),
            "You are the orchestrator.",
        );
        (dir, looped, run.id)
    }

    fn collect_emits() -> (Arc<Mutex<Vec<Message>>>, impl FnMut(&Message)) {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        (emitted, move |m: &Message| sink.lock().push(m.clone()))
    }

    #[tokio::test]
    async fn content_only_reply_finishes_in_one_step() {
        let (_d, looped, run) = harness(vec![text_reply("hello there")], ToolRegistry::new());
        let (emitted, mut emit) = collect_emits();

        let outcome = looped
            .run_turn(&run, "hi", &TurnOptions::worker(40), &mut emit)
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "hello there");
        assert_eq!(outcome.steps, 1);
        assert!(!outcome.turn_capped);

        let emitted = emitted.lock();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].role, Role::User);
        assert_eq!(emitted[1].role, Role::Assistant);

        // History committed: user + assistant.
        let history = looped.coordinator().read_history(&run).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn tool_round_injects_run_id_and_orders_messages() {
        let spawn = FixedTool::new("agent_spawn", "{\"agent_id\":\"w1\"}");
        let mut tools = ToolRegistry::new();
        tools.register(spawn.clone());

        let (_d, looped, run) = harness(
            vec![
                tool_reply("agent_spawn", serde_json::json!({"task": "build"})),
                text_reply("spawned"),
            ],
            tools,
        );
        let (emitted, mut emit) = collect_emits();

        let outcome = looped
            .run_turn(
                &run,
                "spawn a worker",
                &TurnOptions::chat(ChatToolMode::Dispatcher, 40),
                &mut emit,
            )
            .await
            .unwrap();
        assert_eq!(outcome.final_text, "spawned");
        assert_eq!(outcome.steps, 2);

        // run_id was injected into the tool arguments.
        let calls = spawn.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["run_id"], serde_json::json!(run));
        assert_eq!(calls[0]["task"], "build");

        // Order: user, assistant(tool call), tool, assistant(final).
        let roles: Vec<Role> = emitted.lock().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    }

    #[tokio::test]
    async fn policy_violation_becomes_error_content() {
        let file_tool = FixedTool::new("write_file", "written");
        let mut tools = ToolRegistry::new();
        tools.register(file_tool.clone());

        let (_d, looped, run) = harness(
            vec![
                tool_reply("write_file", serde_json::json!({"path": "x"})),
                text_reply("understood"),
            ],
            tools,
        );
        let (emitted, mut emit) = collect_emits();

        looped
            .run_turn(
                &run,
                "write a file",
                &TurnOptions::chat(ChatToolMode::Dispatcher, 40),
                &mut emit,
            )
            .await
            .unwrap();

        // Guard rejected the call: no side effect, ERROR content to model.
        assert_eq!(file_tool.call_count(), 0);
        let emitted = emitted.lock();
        let tool_msg = emitted.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.extract_all_text().starts_with("ERROR:"));
    }

    /// MCP auto-reload: a successful write into `mcp/` schedules exactly
    /// one reload at the end of the step, and the system note lands in
    /// the turn history.
    #[tokio::test]
    async fn mcp_write_triggers_one_reload() {
        let write = FixedTool::new("write_file", "ok");
        let mut tools = ToolRegistry::new();
        tools.register(write);

        let (_d, looped, run) = harness(
            vec![
                tool_reply(
                    "write_file",
                    serde_json::json!({"path": "mcp/calculator/server.py", "content": "x"}),
                ),
                text_reply("done"),
            ],
            tools,
        );
        let reloader = Arc::new(FakeReloader {
            calls: Mutex::new(0),
        });
        let looped = looped.with_mcp(reloader.clone());
        let (_emitted, mut emit) = collect_emits();

        looped
            .run_turn(&run, "update the server", &TurnOptions::worker(40), &mut emit)
            .await
            .unwrap();

        assert_eq!(*reloader.calls.lock(), 1);
        let history = looped.coordinator().read_history(&run).unwrap();
        let note = history
            .iter()
            .find(|m| {
                m.content
                    .extract_all_text()
                    .starts_with("[System Message] MCP auto-reload completed")
            })
            .expect("reload note in history");
        assert_eq!(note.role, Role::System);
    }

    #[tokio::test]
    async fn agent_wait_posts_report_block() {
        let wait = FixedTool::new(
            "agent_wait",
            "{\"agents\":[{\"id\":\"w1\",\"status\":\"completed\"}]}",
        );
        let mut tools = ToolRegistry::new();
        tools.register(wait.clone());

        let (_d, looped, run) = harness(
            vec![
                tool_reply("agent_wait", serde_json::json!({"timeout_seconds": 600})),
                text_reply("w1 finished building"),
            ],
            tools,
        );

        // A finished child with a result on disk.
        let c = looped.coordinator().clone();
        c.create_agent(
            &run,
            hm_coordinator::NewAgent {
                agent_id: "w1".into(),
                task: "build".into(),
                metadata: Default::default(),
            },
        )
        .unwrap();
        c.write_agent_result(
            &run,
            "w1",
            &hm_coordinator::AgentResult {
                output: "built ok".into(),
                error: None,
                finished_at: Utc::now(),
            },
        )
        .unwrap();
        c.update_agent_state(&run, "w1", |s| {
            s.status = hm_coordinator::AgentStatus::Completed
        })
        .unwrap();

        let (_emitted, mut emit) = collect_emits();
        looped
            .run_turn(&run, "wait for the worker", &TurnOptions::worker(40), &mut emit)
            .await
            .unwrap();

        // The wait tool saw the clamped timeout passthrough (worker mode).
        assert_eq!(wait.calls.lock()[0]["timeout_seconds"], 600);

        let history = looped.coordinator().read_history(&run).unwrap();
        assert!(history.iter().any(|m| m
            .content
            .extract_all_text()
            .contains("Finished agent results")));

        // Reported set persisted → second report is empty.
        assert!(report::build_agent_report(&c, &run).unwrap().is_none());
    }

    #[tokio::test]
    async fn wait_timeout_clamped_in_chat_mode() {
        let wait = FixedTool::new("agent_wait", "{}");
        let mut tools = ToolRegistry::new();
        tools.register(wait.clone());

        let (_d, looped, run) = harness(
            vec![
                tool_reply("agent_wait", serde_json::json!({"timeout_seconds": 600})),
                text_reply("ok"),
            ],
            tools,
        );
        let (_emitted, mut emit) = collect_emits();
        looped
            .run_turn(
                &run,
                "wait for the worker to finish",
                &TurnOptions::chat(ChatToolMode::Dispatcher, 40),
                &mut emit,
            )
            .await
            .unwrap();
        assert_eq!(wait.calls.lock()[0]["timeout_seconds"], 15);
    }

    #[tokio::test]
    async fn turn_cap_stops_tool_ping_pong() {
        let probe = FixedTool::new("agent_state", "{\"status\":\"running\"}");
        let mut tools = ToolRegistry::new();
        tools.register(probe);

        // The model keeps asking for the same tool forever.
        let script: Vec<ChatResponse> = (0..10)
            .map(|_| tool_reply("agent_state", serde_json::json!({})))
            .collect();
        let (_d, looped, run) = harness(script, tools);
        let (_emitted, mut emit) = collect_emits();

        let outcome = looped
            .run_turn(&run, "poll forever", &TurnOptions::worker(3), &mut emit)
            .await
            .unwrap();
        assert!(outcome.turn_capped);
        assert_eq!(outcome.steps, 3);
    }

    #[tokio::test]
    async fn restart_signal_returns_immediately() {
        let (_d, looped, run) = harness(vec![text_reply("never sent")], ToolRegistry::new());
        let restart = RestartSignal::new();
        restart.request();
        let looped = looped.with_restart(restart);
        let (emitted, mut emit) = collect_emits();

        let outcome = looped
            .run_turn(&run, "hello", &TurnOptions::worker(40), &mut emit)
            .await
            .unwrap();
        assert!(outcome.restart_requested);
        assert_eq!(outcome.steps, 0);
        // Only the user message was produced.
        assert_eq!(emitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn history_pruned_to_last_compaction_marker() {
        use hm_domain::llm::COMPACTION_MARKER_PREFIX;

        struct CapturingClient {
            last: Mutex<Option<ChatRequest>>,
        }
        #[async_trait]
        impl ChatClient for CapturingClient {
            async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
                *self.last.lock() = Some(req.clone());
                Ok(text_reply("ok"))
            }
        }

        let dir = TempDir::new().unwrap();
        let coordinator = Coordinator::new(dir.path());
        let run = coordinator.create_run(None, None).unwrap();

        // Persisted history with a compaction marker in the middle.
        coordinator
            .append_history(
                &run.id,
                &[
                    Message::user("ancient question"),
                    Message::assistant("ancient answer"),
                    Message::system(format!("{COMPACTION_MARKER_PREFIX} due to context overflow.\n\nSummary…")),
                    Message::user("recent question"),
                    Message::assistant("recent answer"),
                ],
            )
            .unwrap();

        let client = Arc::new(CapturingClient {
            last: Mutex::new(None),
        });
        let looped = TurnLoop::new(
            client.clone(),
            Arc::new(ToolRegistry::new()),
            coordinator,
            CompactionConfig::default(),
            "sys",
        );
        let (_emitted, mut emit) = collect_emits();
        looped
            .run_turn(&run.id, "next", &TurnOptions::worker(40), &mut emit)
            .await
            .unwrap();

        let req = client.last.lock().clone().unwrap();
        let texts: Vec<String> = req
            .messages
            .iter()
            .map(|m| m.content.extract_all_text())
            .collect();
        assert!(
            !texts.iter().any(|t| t.contains("ancient")),
            "pre-marker history must be pruned"
        );
        assert!(texts.iter().any(|t| t.contains("recent question")));
        assert!(texts.iter().any(|t| t.starts_with(COMPACTION_MARKER_PREFIX)));
    }
}
