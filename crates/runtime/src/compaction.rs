//! Auto-compaction: transparent recovery from model-side context
//! overflow.
//!
//! Pre-flight, every tool result is clamped to a hard cap. When a chat
//! call fails with an overflow, tool results are clamped harder, the
//! conversation prefix (everything before the last `keep_last_user_turns`
//! user turns, excluding the leading system preamble) is summarized, and
//! the prefix is replaced by a single marker system note before the call
//! is retried.

use std::sync::Arc;

use hm_domain::config::CompactionConfig;
use hm_domain::llm::{
    ChatClient, ChatRequest, ChatResponse, Message, Role, ToolDefinition,
    COMPACTION_MARKER_PREFIX,
};
use hm_domain::{Error, Result};

/// Full first line of the compaction note.
pub const COMPACTION_NOTE_HEADER: &str =
    "[System Message] Context compacted automatically due to context overflow.";

/// Marker between the head and tail windows of the summarizer input.
const OMISSION_MARKER: &str = "[…omitted for brevity…]";

/// Fraction of the summarizer input budget taken from the beginning; the
/// remainder comes from the end.
const HEAD_FRACTION: usize = 3; // 1/3 head, 2/3 tail

pub struct Compactor {
    client: Arc<dyn ChatClient>,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(client: Arc<dyn ChatClient>, config: CompactionConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Clamp every tool result to the pre-flight cap. Idempotent.
    pub fn preflight(&self, messages: &mut [Message]) {
        truncate_tool_messages(messages, self.config.hard_max_tool_result_chars);
    }

    /// One model call with overflow recovery. On success returns the
    /// response plus the compaction marker note, when compaction ran
    /// (the caller persists the marker into durable history).
    pub async fn chat_with_compaction(
        &self,
        messages: &mut Vec<Message>,
        tools: &[ToolDefinition],
        model: Option<&str>,
    ) -> Result<(ChatResponse, Option<Message>)> {
        self.preflight(messages);

        let mut marker = None;
        let mut attempts = 0;
        loop {
            let req = ChatRequest {
                messages: messages.clone(),
                tools: tools.to_vec(),
                temperature: Some(0.2),
                max_tokens: None,
                model: model.map(|m| m.to_string()),
            };
            match self.client.chat(&req).await {
                Ok(resp) => return Ok((resp, marker)),
                Err(e)
                    if e.is_context_overflow()
                        && self.config.enabled
                        && attempts < self.config.max_attempts =>
                {
                    attempts += 1;
                    tracing::info!(attempt = attempts, "context overflow, compacting");
                    marker = Some(self.compact(messages).await);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Compact `messages` in place and return the marker note that now
    /// stands in for the summarized prefix.
    async fn compact(&self, messages: &mut Vec<Message>) -> Message {
        // Overflow means the hard cap wasn't enough; clamp harder.
        truncate_tool_messages(messages, self.config.overflow_max_tool_result_chars);

        let lead_end = messages
            .iter()
            .position(|m| m.role != Role::System)
            .unwrap_or(messages.len());
        let tail_start = tail_start_index(messages, self.config.keep_last_user_turns, lead_end);

        let note_text = if tail_start > lead_end {
            match self.summarize(&messages[lead_end..tail_start]).await {
                Some(summary) => format!(
                    "{COMPACTION_NOTE_HEADER}\n\nSummary of earlier conversation:\n{summary}"
                ),
                None => format!("{COMPACTION_NOTE_HEADER}\n\nEarlier messages omitted."),
            }
        } else {
            // Nothing compactable before the kept tail; the note still
            // marks that recovery ran.
            format!("{COMPACTION_NOTE_HEADER}\n\nEarlier messages omitted.")
        };

        let note = Message::system(note_text);
        if tail_start > lead_end {
            messages.splice(lead_end..tail_start, [note.clone()]);
        } else {
            messages.insert(lead_end, note.clone());
        }
        note
    }

    /// Ask the model for a bullet summary of the prefix; `None` on any
    /// failure or empty output (callers fall back to a plain omission
    /// note).
    async fn summarize(&self, prefix: &[Message]) -> Option<String> {
        let rendered = window_text(
            &render_for_summary(prefix),
            self.config.summary_input_max_chars,
        );
        let prompt = format!(
            "Summarize the following conversation history as concise bullet \
             points. Preserve the current goal, key decisions, open questions, \
             important facts, and pending work. Omit pleasantries.\n\n\
             CONVERSATION:\n{rendered}"
        );
        let req = ChatRequest {
            messages: vec![Message::user(prompt)],
            temperature: Some(0.1),
            max_tokens: Some(self.config.summary_max_tokens),
            ..Default::default()
        };
        match self.client.chat(&req).await {
            Ok(resp) => {
                let text = resp.content.trim();
                if text.is_empty() {
                    None
                } else {
                    Some(cap_chars(text, self.config.summary_max_chars))
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "compaction summary call failed");
                None
            }
        }
    }
}

/// Whether a message is the compaction marker note.
pub fn is_compaction_marker(message: &Message) -> bool {
    message.role == Role::System
        && message
            .content
            .text()
            .map(|t| t.starts_with(COMPACTION_MARKER_PREFIX))
            .unwrap_or(false)
}

/// Index of the last compaction marker in a history, if any. History
/// before the marker was already replaced and must not be re-fed.
pub fn last_marker_index(messages: &[Message]) -> Option<usize> {
    messages.iter().rposition(is_compaction_marker)
}

/// Index where the kept tail begins: the `keep`-th user message from the
/// end, never inside the leading system preamble.
fn tail_start_index(messages: &[Message], keep: usize, lead_end: usize) -> usize {
    let keep = keep.max(1);
    let mut count = 0;
    for i in (lead_end..messages.len()).rev() {
        if messages[i].role == Role::User {
            count += 1;
            if count >= keep {
                return i;
            }
        }
    }
    lead_end
}

/// Truncate every tool message body longer than `cap` chars, cutting at
/// the nearest newline within the tail quartile and appending a marker
/// that tells the model the result was shortened.
fn truncate_tool_messages(messages: &mut [Message], cap: usize) {
    for msg in messages.iter_mut() {
        if msg.role != Role::Tool {
            continue;
        }
        msg.content
            .map_tool_results(|content| truncate_tool_text(content, cap));
    }
}

/// `None` when the text already fits.
fn truncate_tool_text(content: &str, cap: usize) -> Option<String> {
    let total = content.chars().count();
    if total <= cap {
        return None;
    }
    let suffix = format!("\n[tool result truncated: {total} chars originally]");
    let budget = cap.saturating_sub(suffix.chars().count());
    let mut prefix: String = content.chars().take(budget).collect();

    // Prefer a clean cut: the last newline within the tail quartile.
    let quartile_floor = prefix.len() - prefix.len() / 4;
    if let Some(i) = prefix.rfind('\n') {
        if i >= quartile_floor {
            prefix.truncate(i);
        }
    }
    Some(format!("{prefix}{suffix}"))
}

/// Render messages for the summarizer, role-labeled, long lines clipped.
fn render_for_summary(messages: &[Message]) -> String {
    let mut buf = String::new();
    for msg in messages {
        let label = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => "System",
        };
        let text = msg.content.extract_all_text();
        if text.is_empty() {
            continue;
        }
        buf.push_str(label);
        buf.push_str(": ");
        if text.chars().count() > 2_000 {
            let head: String = text.chars().take(1_000).collect();
            let tail: String = {
                let chars: Vec<char> = text.chars().collect();
                chars[chars.len() - 500..].iter().collect()
            };
            buf.push_str(&head);
            buf.push_str(" [...] ");
            buf.push_str(&tail);
        } else {
            buf.push_str(&text);
        }
        buf.push('\n');
    }
    buf
}

/// Head/tail window: a fixed fraction of `cap` from the beginning, the
/// remainder from the end, separated by the omission marker.
fn window_text(text: &str, cap: usize) -> String {
    let total = text.chars().count();
    if total <= cap {
        return text.to_string();
    }
    let head_len = cap / HEAD_FRACTION;
    let tail_len = cap.saturating_sub(head_len);
    let chars: Vec<char> = text.chars().collect();
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[total - tail_len..].iter().collect();
    format!("{head}\n{OMISSION_MARKER}\n{tail}")
}

fn cap_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Client scripted with a sequence of results; records every request.
    struct ScriptedClient {
        script: Mutex<Vec<Result<ChatResponse>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<ChatResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request(&self, i: usize) -> ChatRequest {
            self.requests.lock()[i].clone()
        }

        fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
            self.requests.lock().push(req.clone());
            let mut script = self.script.lock();
            if script.is_empty() {
                Ok(ChatResponse::default())
            } else {
                script.remove(0)
            }
        }
    }

    fn ok(content: &str) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: content.into(),
            ..Default::default()
        })
    }

    fn overflow() -> Result<ChatResponse> {
        Err(Error::context_overflow("maximum context length exceeded"))
    }

    fn config() -> CompactionConfig {
        CompactionConfig {
            keep_last_user_turns: 2,
            overflow_max_tool_result_chars: 4_000,
            hard_max_tool_result_chars: 100_000,
            ..Default::default()
        }
    }

    #[test]
    fn truncate_cuts_at_tail_quartile_newline() {
        let mut content = String::new();
        for i in 0..2_000 {
            content.push_str(&format!("line {i}\n"));
        }
        let out = truncate_tool_text(&content, 1_000).unwrap();
        assert!(out.chars().count() <= 1_000);
        assert!(out.contains("[tool result truncated:"));
        // The cut landed on a line boundary.
        let body = out.split("\n[tool result truncated").next().unwrap();
        assert!(body.ends_with(|c: char| c.is_ascii_digit()));
    }

    #[test]
    fn short_tool_results_untouched() {
        assert!(truncate_tool_text("short", 100).is_none());
    }

    #[test]
    fn window_text_keeps_head_and_tail() {
        let text: String = (0..1_000).map(|i| format!("w{i} ")).collect();
        let windowed = window_text(&text, 300);
        assert!(windowed.starts_with("w0 "));
        assert!(windowed.contains(OMISSION_MARKER));
        assert!(windowed.trim_end().ends_with("w999"));
    }

    #[test]
    fn marker_detection() {
        let note = Message::system(format!("{COMPACTION_NOTE_HEADER}\n\nSummary…"));
        assert!(is_compaction_marker(&note));
        assert!(!is_compaction_marker(&Message::system("ordinary note")));
        let msgs = vec![Message::user("a"), note.clone(), Message::user("b")];
        assert_eq!(last_marker_index(&msgs), Some(1));
    }

    /// Overflow-recovery end-to-end: a long history with one huge tool
    /// result; the first chat overflows, the second succeeds. The final
    /// request must contain the original leading system messages, a
    /// single compaction note, the last `keep_last_user_turns` user
    /// turns, and the tool result truncated with the suffix present.
    #[tokio::test]
    async fn overflow_recovery_shapes_final_request() {
        let client = ScriptedClient::new(vec![
            overflow(),
            ok("- earlier work summarized"), // summary call
            ok("final answer"),              // retried main call
        ]);
        let compactor = Compactor::new(client.clone(), config());

        let mut messages = vec![
            Message::system("You are the orchestrator."),
            Message::system("[System Message] Session context: run_id=r1"),
        ];
        for i in 0..56 {
            messages.push(Message::user(format!("user turn {i}")));
            messages.push(Message::assistant(format!("assistant reply {i}")));
        }
        // Tail: two kept user turns with the giant tool result between.
        messages.push(Message::user("penultimate request"));
        let huge: String = (0..7_000).map(|i| format!("out {i}\n")).collect();
        assert!(huge.chars().count() >= 50_000);
        messages.push(Message::tool_result("tc_big", huge));
        messages.push(Message::user("final request"));
        assert!(messages.len() >= 117);

        let (resp, marker) = compactor
            .chat_with_compaction(&mut messages, &[], None)
            .await
            .unwrap();
        assert_eq!(resp.content, "final answer");
        assert!(marker.is_some());
        assert_eq!(client.request_count(), 3);

        let final_req = client.request(2);
        // (a) leading system messages intact.
        assert_eq!(
            final_req.messages[0].content.text().unwrap(),
            "You are the orchestrator."
        );
        assert!(final_req.messages[1]
            .content
            .text()
            .unwrap()
            .contains("run_id=r1"));
        // (b) exactly one compaction note, right after the preamble.
        let markers: Vec<usize> = final_req
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| is_compaction_marker(m))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(markers, vec![2]);
        assert!(final_req.messages[2]
            .content
            .text()
            .unwrap()
            .contains("earlier work summarized"));
        // (c) the kept tail starts at the second-to-last user turn.
        let users: Vec<String> = final_req
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.extract_all_text())
            .collect();
        assert_eq!(users, vec!["penultimate request", "final request"]);
        // (d) the tool result is truncated with the suffix present.
        let tool = final_req
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        let tool_text = tool.content.extract_all_text();
        assert!(tool_text.chars().count() <= 4_000);
        assert!(tool_text.contains("[tool result truncated:"));
    }

    #[tokio::test]
    async fn summary_failure_falls_back_to_omission_note() {
        let client = ScriptedClient::new(vec![
            overflow(),
            Err(Error::chat("summarizer down")),
            ok("recovered"),
        ]);
        let compactor = Compactor::new(client.clone(), config());

        let mut messages = vec![Message::system("sys")];
        for i in 0..10 {
            messages.push(Message::user(format!("u{i}")));
            messages.push(Message::assistant(format!("a{i}")));
        }

        let (resp, marker) = compactor
            .chat_with_compaction(&mut messages, &[], None)
            .await
            .unwrap();
        assert_eq!(resp.content, "recovered");
        let note = marker.unwrap().content.extract_all_text();
        assert!(note.contains("Earlier messages omitted."));
    }

    #[tokio::test]
    async fn attempts_exhausted_surfaces_last_error() {
        let client = ScriptedClient::new(vec![
            overflow(),
            ok("sum"),
            overflow(),
            ok("sum"),
            overflow(),
        ]);
        let compactor = Compactor::new(client, config());

        let mut messages = vec![Message::system("sys")];
        for i in 0..10 {
            messages.push(Message::user(format!("u{i}")));
            messages.push(Message::assistant(format!("a{i}")));
        }

        let err = compactor
            .chat_with_compaction(&mut messages, &[], None)
            .await
            .unwrap_err();
        assert!(err.is_context_overflow());
    }

    #[tokio::test]
    async fn non_overflow_error_propagates_immediately() {
        let client = ScriptedClient::new(vec![Err(Error::chat("503"))]);
        let compactor = Compactor::new(client.clone(), config());
        let mut messages = vec![Message::user("hi")];
        let err = compactor
            .chat_with_compaction(&mut messages, &[], None)
            .await
            .unwrap_err();
        assert!(!err.is_context_overflow());
        assert_eq!(client.request_count(), 1);
    }
}
