//! File outbox: the default delivery sink when no SMTP transport is
//! wired in. Each delivery is rendered as a complete RFC822 message and
//! dropped into `W/outbox/` where an external relay (or the operator)
//! can pick it up.

use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;

use hm_autonomy::DeliverySink;
use hm_domain::Result;
use hm_mailbridge::OutboundEmail;

pub struct FileOutbox {
    dir: PathBuf,
    from: String,
}

impl FileOutbox {
    pub fn new(workspace_root: &std::path::Path, from: &str) -> Self {
        Self {
            dir: workspace_root.join("outbox"),
            from: from.to_string(),
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

#[async_trait]
impl DeliverySink for FileOutbox {
    async fn deliver(&self, subject: &str, body: &str, to: &[String]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        for recipient in to {
            let email = OutboundEmail {
                from: self.from.clone(),
                to: recipient.clone(),
                subject: subject.to_string(),
                body: body.to_string(),
                in_reply_to: None,
                references: Vec::new(),
            };
            let name = format!(
                "{}-{}.eml",
                Utc::now().format("%Y%m%dT%H%M%S%.3f"),
                recipient.replace(['@', '/'], "_")
            );
            fs::write(self.dir.join(name), email.render())?;
        }
        tracing::info!(subject, recipients = to.len(), "delivery written to outbox");
        Ok(())
    }
}
