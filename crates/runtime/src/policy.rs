//! Tool policy: which tools the model may see and call in each mode.
//!
//! Two layers with the same predicates: the *visibility filter* shapes
//! the tool catalog sent to the model (advisory), and the *runtime
//! guard* re-checks every invocation (authoritative). In dispatcher
//! mode without an explicit blocking-wait request, progress probes are
//! additionally capped per turn to prevent busy-wait polling.

use std::sync::atomic::{AtomicU32, Ordering};

use hm_domain::config::{ChatToolMode, PromptMode};

/// Progress-probe tools capped per turn when blocking wait is off.
const PROBE_TOOLS: &[&str] = &[
    "agent_state",
    "agent_progress",
    "agent_events",
    "agent_inspect",
    "agent_result",
    "subagents",
];

/// Calls allowed per probe tool family per turn without blocking wait.
const PROBE_CAP: u32 = 3;

/// Wait tools hidden unless blocking wait is allowed.
const WAIT_TOOLS: &[&str] = &["agent_wait", "agent_signal_wait"];

/// Clamp bounds for wait-tool `timeout_seconds` in chat mode.
pub const WAIT_CLAMP_SECS: (u64, u64) = (2, 15);

/// Phrases that signal the user explicitly wants a blocking wait.
const BLOCKING_WAIT_PHRASES: &[&str] = &[
    "wait for",
    "wait until",
    "wait till",
    "block until",
    "keep waiting",
    "wait for it to finish",
    "等待",
    "等到",
    "等结果",
    "一直等",
];

/// Phrases that signal explicitly asynchronous intent; they veto the
/// blocking-wait phrases above.
const ASYNC_PHRASES: &[&str] = &[
    "don't wait",
    "do not wait",
    "no need to wait",
    "without waiting",
    "async",
    "asynchronously",
    "in the background",
    "fire and forget",
    "不用等",
    "不要等",
    "无需等待",
    "异步",
    "后台",
];

/// Whether free text explicitly asks for asynchronous behavior.
pub fn requests_async(text: &str) -> bool {
    let lower = text.to_lowercase();
    ASYNC_PHRASES.iter().any(|p| lower.contains(p))
}

/// Whether a blocking wait is allowed for this turn.
pub fn allow_blocking_wait(mode: PromptMode, user_text: &str) -> bool {
    if mode == PromptMode::Worker {
        return true;
    }
    let lower = user_text.to_lowercase();
    let wants_wait = BLOCKING_WAIT_PHRASES.iter().any(|p| lower.contains(p));
    wants_wait && !requests_async(user_text)
}

/// Per-turn policy. Constructed once at turn start from the mode pair
/// and the raw user text.
pub struct ToolPolicy {
    mode: PromptMode,
    chat_tool_mode: ChatToolMode,
    allow_blocking_wait: bool,
    probe_calls: AtomicU32,
}

impl ToolPolicy {
    pub fn new(mode: PromptMode, chat_tool_mode: ChatToolMode, user_text: &str) -> Self {
        Self {
            mode,
            chat_tool_mode,
            allow_blocking_wait: allow_blocking_wait(mode, user_text),
            probe_calls: AtomicU32::new(0),
        }
    }

    /// Like [`new`](Self::new), but with blocking wait forced on
    /// regardless of phrasing (used by channels that must return one
    /// coherent reply, e.g. the email gateway).
    pub fn new_forced_wait(mode: PromptMode, chat_tool_mode: ChatToolMode) -> Self {
        Self {
            mode,
            chat_tool_mode,
            allow_blocking_wait: true,
            probe_calls: AtomicU32::new(0),
        }
    }

    pub fn allow_blocking_wait(&self) -> bool {
        self.allow_blocking_wait
    }

    fn is_dispatcher(&self) -> bool {
        self.mode == PromptMode::Chat && self.chat_tool_mode == ChatToolMode::Dispatcher
    }

    /// Visibility filter: should this tool appear in the model's catalog?
    pub fn visible(&self, tool_name: &str) -> bool {
        if WAIT_TOOLS.contains(&tool_name) && !self.allow_blocking_wait {
            return false;
        }
        if !self.is_dispatcher() {
            return true;
        }
        tool_name.starts_with("agent_")
            || tool_name == "subagents"
            || tool_name.starts_with("skill_")
            || tool_name == "mcp_reload"
    }

    /// Runtime guard: may this invocation proceed right now? Returns a
    /// descriptive error for the model otherwise.
    pub fn check_invocation(&self, tool_name: &str) -> Result<(), String> {
        if !self.visible(tool_name) {
            return Err(format!(
                "tool '{tool_name}' is not available in this mode; delegate the work \
                 to a child agent instead"
            ));
        }
        if !self.allow_blocking_wait && PROBE_TOOLS.contains(&tool_name) {
            let used = self.probe_calls.fetch_add(1, Ordering::SeqCst);
            if used >= PROBE_CAP {
                return Err(format!(
                    "progress-probe budget exhausted ({PROBE_CAP} calls per turn); stop \
                     polling; finished agents are reported to you automatically"
                ));
            }
        }
        Ok(())
    }

    /// Clamp a wait tool's `timeout_seconds` argument. Chat mode forces
    /// the value into [2, 15] seconds; worker mode passes it through.
    pub fn clamp_wait_timeout(&self, requested: u64) -> u64 {
        if self.mode == PromptMode::Worker {
            return requested;
        }
        requested.clamp(WAIT_CLAMP_SECS.0, WAIT_CLAMP_SECS.1)
    }

    /// Whether this tool name is one of the wait tools.
    pub fn is_wait_tool(tool_name: &str) -> bool {
        WAIT_TOOLS.contains(&tool_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(user_text: &str) -> ToolPolicy {
        ToolPolicy::new(PromptMode::Chat, ChatToolMode::Dispatcher, user_text)
    }

    #[test]
    fn worker_mode_allows_everything() {
        let p = ToolPolicy::new(PromptMode::Worker, ChatToolMode::Dispatcher, "");
        assert!(p.visible("read_file"));
        assert!(p.visible("agent_wait"));
        assert!(p.check_invocation("shell_exec").is_ok());
    }

    #[test]
    fn dispatcher_hides_non_orchestration_tools() {
        let p = dispatcher("spawn three workers");
        assert!(p.visible("agent_spawn"));
        assert!(p.visible("subagents"));
        assert!(p.visible("skill_install"));
        assert!(p.visible("mcp_reload"));
        assert!(!p.visible("read_file"));
        assert!(!p.visible("shell_exec"));
    }

    #[test]
    fn wait_tools_hidden_without_phrase() {
        let p = dispatcher("spawn a worker");
        assert!(!p.visible("agent_wait"));
        assert!(!p.visible("agent_signal_wait"));
    }

    #[test]
    fn blocking_phrase_reveals_wait_tools() {
        let p = dispatcher("spawn a worker and wait for it to finish");
        assert!(p.allow_blocking_wait());
        assert!(p.visible("agent_wait"));
    }

    #[test]
    fn async_phrase_vetoes_blocking() {
        assert!(!allow_blocking_wait(
            PromptMode::Chat,
            "wait for it… actually don't wait, run it in the background"
        ));
        assert!(!allow_blocking_wait(PromptMode::Chat, "等待结果？不用等了，异步跑"));
    }

    #[test]
    fn chinese_blocking_phrase_recognized() {
        assert!(allow_blocking_wait(PromptMode::Chat, "启动任务并等待完成"));
    }

    /// In chat+dispatcher mode with no blocking-wait phrase, any
    /// non-orchestration tool call errors and performs no side effect.
    #[test]
    fn guard_rejects_invisible_tools() {
        let p = dispatcher("do a thing");
        let err = p.check_invocation("write_file").unwrap_err();
        assert!(err.contains("not available"));
    }

    #[test]
    fn probe_budget_caps_at_three() {
        let p = dispatcher("check on the workers");
        assert!(p.check_invocation("agent_state").is_ok());
        assert!(p.check_invocation("agent_progress").is_ok());
        assert!(p.check_invocation("subagents").is_ok());
        let err = p.check_invocation("agent_state").unwrap_err();
        assert!(err.contains("budget exhausted"));
    }

    #[test]
    fn probe_budget_unlimited_with_blocking_wait() {
        let p = dispatcher("wait for the workers to finish");
        for _ in 0..10 {
            assert!(p.check_invocation("agent_state").is_ok());
        }
    }

    #[test]
    fn wait_timeout_clamped_in_chat_mode() {
        let p = dispatcher("wait for it");
        assert_eq!(p.clamp_wait_timeout(0), 2);
        assert_eq!(p.clamp_wait_timeout(10), 10);
        assert_eq!(p.clamp_wait_timeout(600), 15);

        let w = ToolPolicy::new(PromptMode::Worker, ChatToolMode::Full, "");
        assert_eq!(w.clamp_wait_timeout(600), 600);
    }
}
