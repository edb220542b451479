//! Transport seams. The real IMAP/SMTP client lives outside this
//! workspace; the bridge only sees these traits, and tests drive them
//! with in-memory fakes.

use async_trait::async_trait;

use hm_domain::Result;

/// One unseen message as fetched from the mailbox.
#[derive(Debug, Clone)]
pub struct RawInbound {
    /// Mailbox-specific handle used to mark the message seen.
    pub id: String,
    /// Full RFC822 bytes.
    pub bytes: Vec<u8>,
}

/// Inbound side: poll for unseen messages, acknowledge processed ones.
#[async_trait]
pub trait InboundMailbox: Send + Sync {
    async fn poll_unseen(&self) -> Result<Vec<RawInbound>>;
    async fn mark_seen(&self, id: &str) -> Result<()>;
}

/// Outbound side: submit one fully rendered RFC822 message.
#[async_trait]
pub trait OutboundMailer: Send + Sync {
    async fn send(&self, to: &str, message: &str) -> Result<()>;
}
