use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Email gateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bi-directional IMAP/SMTP bridge mapping inbound mail threads to runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailGatewayConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Provider label used for logging only (e.g. "qq", "gmail").
    #[serde(default)]
    pub provider: String,

    #[serde(default)]
    pub email_address: String,

    /// App-specific authorization code or password.
    #[serde(default)]
    pub authorization_code: String,

    #[serde(default)]
    pub imap: ImapConfig,

    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Seconds between unseen-message polls. Must be positive.
    #[serde(default = "d_poll_interval")]
    pub poll_interval_seconds: u64,

    /// When non-empty, mail from other senders is marked seen and dropped.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
}

impl Default for EmailGatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: String::new(),
            email_address: String::new(),
            authorization_code: String::new(),
            imap: ImapConfig::default(),
            smtp: SmtpConfig::default(),
            poll_interval_seconds: d_poll_interval(),
            allowed_senders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default = "d_imap_port")]
    pub port: u16,
    #[serde(default = "d_true")]
    pub use_ssl: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: d_imap_port(),
            use_ssl: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default = "d_smtp_port")]
    pub port: u16,
    #[serde(default = "d_true")]
    pub use_ssl: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: d_smtp_port(),
            use_ssl: true,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_poll_interval() -> u64 {
    30
}
fn d_imap_port() -> u16 {
    993
}
fn d_smtp_port() -> u16 {
    465
}
