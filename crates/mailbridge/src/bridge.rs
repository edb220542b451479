//! The bridge proper: poll → map to run → turn → threaded reply.
//!
//! Inbound messages are processed strictly one at a time (the poll loop
//! is sequential), so messages arriving while a turn is busy simply
//! queue. Replies are awaited, so a single coherent reply goes back on
//! the original thread, unless the message text itself asks for async
//! behavior. Messages are marked seen only after the reply attempt, so
//! a crash mid-processing re-delivers (at-least-once, idempotent sink).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use hm_domain::config::{ChatToolMode, EmailGatewayConfig, PromptMode};
use hm_domain::{Error, Result};
use hm_runtime::policy::requests_async;
use hm_runtime::{TurnLoop, TurnOptions};

use crate::inbound::{parse_inbound, InboundEmail};
use crate::outbound::{reply_references, OutboundEmail};
use crate::subject::{normalized_subject, subject_key};
use crate::traits::{InboundMailbox, OutboundMailer, RawInbound};

/// Timeout for one SMTP submission.
pub const EMAIL_SEND_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for one IMAP operation.
pub const IMAP_OP_TIMEOUT: Duration = Duration::from_secs(25);

const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(5 * 60);

/// Step budget for email-driven turns.
const EMAIL_TURN_STEPS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    Connected,
    Disconnected,
    Error(String),
}

type StatusCallback = Box<dyn Fn(&GatewayStatus) + Send + Sync>;

pub struct EmailBridge {
    config: EmailGatewayConfig,
    mailbox: Arc<dyn InboundMailbox>,
    mailer: Arc<dyn OutboundMailer>,
    turn: Arc<TurnLoop>,
    chat_tool_mode: ChatToolMode,
    status: Option<StatusCallback>,
}

impl EmailBridge {
    pub fn new(
        config: EmailGatewayConfig,
        mailbox: Arc<dyn InboundMailbox>,
        mailer: Arc<dyn OutboundMailer>,
        turn: Arc<TurnLoop>,
        chat_tool_mode: ChatToolMode,
    ) -> Self {
        Self {
            config,
            mailbox,
            mailer,
            turn,
            chat_tool_mode,
            status: None,
        }
    }

    /// Register a connection-status observer.
    pub fn with_status(mut self, callback: StatusCallback) -> Self {
        self.status = Some(callback);
        self
    }

    fn notify(&self, status: GatewayStatus) {
        if let Some(cb) = &self.status {
            cb(&status);
        }
    }

    /// The poll loop. Poll errors trigger reconnection with a capped,
    /// doubling delay; processing errors affect only that message.
    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let poll = Duration::from_secs(self.config.poll_interval_seconds.max(1));
        let mut retry_delay = RECONNECT_BASE;
        let mut connected = false;

        loop {
            let polled = tokio::time::timeout(IMAP_OP_TIMEOUT, self.mailbox.poll_unseen()).await;
            match polled {
                Ok(Ok(messages)) => {
                    if !connected {
                        connected = true;
                        retry_delay = RECONNECT_BASE;
                        self.notify(GatewayStatus::Connected);
                    }
                    // One at a time; later arrivals wait their turn.
                    for raw in messages {
                        if let Err(e) = self.process_inbound(&raw).await {
                            tracing::warn!(message = %raw.id, error = %e, "inbound processing failed");
                        }
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
                Ok(Err(e)) => {
                    self.handle_poll_failure(&mut connected, e.to_string());
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                    retry_delay = (retry_delay * 2).min(RECONNECT_MAX);
                }
                Err(_) => {
                    self.handle_poll_failure(&mut connected, "IMAP poll timed out".into());
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                    retry_delay = (retry_delay * 2).min(RECONNECT_MAX);
                }
            }
        }
    }

    fn handle_poll_failure(&self, connected: &mut bool, message: String) {
        tracing::warn!(error = %message, "mailbox poll failed, will reconnect");
        if *connected {
            *connected = false;
            self.notify(GatewayStatus::Disconnected);
        }
        self.notify(GatewayStatus::Error(message));
    }

    /// Handle one inbound message end-to-end. Returns the run ID it
    /// landed in, or `None` when the sender was dropped.
    pub async fn process_inbound(&self, raw: &RawInbound) -> Result<Option<String>> {
        let email = parse_inbound(&raw.bytes)?;

        if !self.sender_allowed(&email.from) {
            tracing::info!(from = %email.from, "sender not in allowlist, dropping");
            self.mailbox.mark_seen(&raw.id).await?;
            return Ok(None);
        }

        let run_id = self.resolve_run(&email)?;
        let reply_body = self.run_email_turn(&run_id, &email).await?;
        self.send_reply(&email, &reply_body).await?;
        self.mailbox.mark_seen(&raw.id).await?;
        Ok(Some(run_id))
    }

    fn sender_allowed(&self, from: &str) -> bool {
        if self.config.allowed_senders.is_empty() {
            return true;
        }
        self.config
            .allowed_senders
            .iter()
            .any(|a| a.eq_ignore_ascii_case(from))
    }

    /// Map the message to its run by canonical subject key, creating one
    /// on first contact, and persist the thread descriptor.
    fn resolve_run(&self, email: &InboundEmail) -> Result<String> {
        let mut key = subject_key(&email.subject);
        if key.is_empty() {
            key = "(no subject)".into();
        }
        let norm = normalized_subject(&email.subject);

        let coordinator = self.turn.coordinator();
        let existing = coordinator.find_run(|r| {
            r.title()
                .map(|t| normalized_subject(t) == norm)
                .unwrap_or(false)
        })?;
        let run_id = match existing {
            Some(run) => run.id,
            None => {
                let mut metadata = std::collections::BTreeMap::new();
                metadata.insert("source".into(), serde_json::json!("email"));
                coordinator.create_run(Some(&key), Some(metadata))?.id
            }
        };

        coordinator.update_run(&run_id, |r| {
            r.metadata.insert(
                "email_thread".into(),
                serde_json::json!({
                    "message_id": email.message_id,
                    "in_reply_to": email.in_reply_to,
                    "references": email.references,
                }),
            );
        })?;
        Ok(run_id)
    }

    async fn run_email_turn(&self, run_id: &str, email: &InboundEmail) -> Result<String> {
        let opts = TurnOptions {
            prompt_mode: PromptMode::Chat,
            chat_tool_mode: self.chat_tool_mode,
            max_steps: EMAIL_TURN_STEPS,
            model: None,
            // Awaited reply unless the sender asked for async behavior.
            force_blocking_wait: !requests_async(&email.body),
        };
        let outcome = self
            .turn
            .run_turn(run_id, &email.body, &opts, &mut |_| {})
            .await?;
        Ok(outcome.final_text)
    }

    async fn send_reply(&self, email: &InboundEmail, body: &str) -> Result<()> {
        let key = subject_key(&email.subject);
        let reply = OutboundEmail {
            from: self.config.email_address.clone(),
            to: email.from.clone(),
            subject: format!("Re: {key}"),
            body: body.to_string(),
            in_reply_to: (!email.message_id.is_empty()).then(|| email.message_id.clone()),
            references: reply_references(
                &email.references,
                email.in_reply_to.as_deref(),
                &email.message_id,
            ),
        };
        tokio::time::timeout(
            EMAIL_SEND_TIMEOUT,
            self.mailer.send(&email.from, &reply.render()),
        )
        .await
        .map_err(|_| Error::Mail("SMTP send timed out".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hm_coordinator::Coordinator;
    use hm_domain::config::CompactionConfig;
    use hm_domain::llm::{ChatClient, ChatRequest, ChatResponse};
    use hm_runtime::ToolRegistry;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct FixedClient(&'static str);

    #[async_trait]
    impl ChatClient for FixedClient {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: self.0.to_string(),
                ..Default::default()
            })
        }
    }

    #[derive(Default)]
    struct RecordingMailbox {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InboundMailbox for RecordingMailbox {
        async fn poll_unseen(&self) -> Result<Vec<RawInbound>> {
            Ok(Vec::new())
        }
        async fn mark_seen(&self, id: &str) -> Result<()> {
            self.seen.lock().push(id.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl OutboundMailer for RecordingMailer {
        async fn send(&self, to: &str, message: &str) -> Result<()> {
            self.sent.lock().push((to.into(), message.into()));
            Ok(())
        }
    }

    fn bridge(
        dir: &TempDir,
        allowed: Vec<String>,
    ) -> (EmailBridge, Arc<RecordingMailbox>, Arc<RecordingMailer>) {
        let turn = Arc::new(TurnLoop::new(
            Arc::new(FixedClient("Deploy is scheduled for Friday.")),
            Arc::new(ToolRegistry::new()),
            Coordinator::new(dir.path()),
            CompactionConfig::default(),
            "email assistant",
        ));
        let mailbox = Arc::new(RecordingMailbox::default());
        let mailer = Arc::new(RecordingMailer::default());
        let config = EmailGatewayConfig {
            enabled: true,
            email_address: "bot@example.com".into(),
            allowed_senders: allowed,
            ..Default::default()
        };
        let bridge = EmailBridge::new(
            config,
            mailbox.clone(),
            mailer.clone(),
            turn,
            ChatToolMode::Dispatcher,
        );
        (bridge, mailbox, mailer)
    }

    fn raw_email(mid: &str, subject: &str, references: &str, body: &str) -> RawInbound {
        let mut headers = format!(
            "Message-ID: <{mid}>\r\nFrom: alice@example.com\r\nSubject: {subject}\r\n"
        );
        if !references.is_empty() {
            headers.push_str(&format!("In-Reply-To: {references}\r\n"));
            headers.push_str(&format!("References: {references}\r\n"));
        }
        headers.push_str("Content-Type: text/plain; charset=UTF-8\r\n\r\n");
        RawInbound {
            id: mid.to_string(),
            bytes: format!("{headers}{body}\r\n").into_bytes(),
        }
    }

    /// Session continuity: an original and its reply land in the same
    /// run, and the second outbound reply carries the full thread.
    #[tokio::test]
    async fn thread_maps_to_one_run_with_threaded_replies() {
        let dir = TempDir::new().unwrap();
        let (bridge, mailbox, mailer) = bridge(&dir, vec![]);

        let first = raw_email("mid-1", "Deploy plan", "", "Please plan the deploy.");
        let run_a = bridge.process_inbound(&first).await.unwrap().unwrap();

        let second = raw_email("mid-2", "Re: Deploy plan", "<mid-1>", "And the rollback?");
        let run_b = bridge.process_inbound(&second).await.unwrap().unwrap();

        assert_eq!(run_a, run_b, "both messages land in the same run");

        let sent = mailer.sent.lock();
        assert_eq!(sent.len(), 2);
        let (to, message) = &sent[1];
        assert_eq!(to, "alice@example.com");
        assert!(message.contains("Subject: Re: Deploy plan\r\n"));
        assert!(message.contains("In-Reply-To: <mid-2>\r\n"));
        assert!(message.contains("References: <mid-1> <mid-2>\r\n"));

        // Both messages acknowledged after processing.
        assert_eq!(*mailbox.seen.lock(), vec!["mid-1", "mid-2"]);

        // Thread descriptor persisted on the run.
        let run = bridge.turn.coordinator().get_run(&run_a).unwrap();
        let thread = &run.metadata["email_thread"];
        assert_eq!(thread["message_id"], "<mid-2>");
    }

    #[tokio::test]
    async fn disallowed_sender_dropped_after_mark_seen() {
        let dir = TempDir::new().unwrap();
        let (bridge, mailbox, mailer) = bridge(&dir, vec!["boss@example.com".into()]);

        let msg = raw_email("mid-9", "Hello", "", "hi");
        let run = bridge.process_inbound(&msg).await.unwrap();
        assert!(run.is_none());
        assert_eq!(*mailbox.seen.lock(), vec!["mid-9"]);
        assert!(mailer.sent.lock().is_empty());
        assert!(bridge.turn.coordinator().list_runs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_turn_is_cleaned_body() {
        struct CapturingClient {
            last_user: Mutex<String>,
        }
        #[async_trait]
        impl ChatClient for CapturingClient {
            async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
                if let Some(m) = req
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == hm_domain::llm::Role::User)
                {
                    *self.last_user.lock() = m.content.extract_all_text();
                }
                Ok(ChatResponse {
                    content: "ok".into(),
                    ..Default::default()
                })
            }
        }

        let dir = TempDir::new().unwrap();
        let client = Arc::new(CapturingClient {
            last_user: Mutex::new(String::new()),
        });
        let turn = Arc::new(TurnLoop::new(
            client.clone(),
            Arc::new(ToolRegistry::new()),
            Coordinator::new(dir.path()),
            CompactionConfig::default(),
            "email assistant",
        ));
        let bridge = EmailBridge::new(
            EmailGatewayConfig {
                email_address: "bot@example.com".into(),
                ..Default::default()
            },
            Arc::new(RecordingMailbox::default()),
            Arc::new(RecordingMailer::default()),
            turn,
            ChatToolMode::Dispatcher,
        );

        let msg = raw_email(
            "mid-3",
            "Re: Deploy plan",
            "<mid-1>",
            "Fresh question here.\r\n\r\n---- 原邮件 ----\r\nold quoted text",
        );
        bridge.process_inbound(&msg).await.unwrap();
        assert_eq!(*client.last_user.lock(), "Fresh question here.");
    }
}
