//! Outbound reply formatting: the full RFC822 message text with
//! RFC 2047 subject encoding, an RFC1123Z date, and RFC 5322 threading
//! headers (`In-Reply-To` + ordered, deduplicated `References`).

use chrono::{DateTime, Local};

/// One outbound reply, ready to be rendered and handed to the mailer.
#[derive(Debug, Clone, Default)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
    /// Ordered thread references, oldest first.
    pub references: Vec<String>,
}

impl OutboundEmail {
    /// Render the complete message (headers + body) with the given date.
    pub fn render_at(&self, date: DateTime<Local>) -> String {
        let mut out = String::new();
        out.push_str(&format!("From: {}\r\n", self.from));
        out.push_str(&format!("To: {}\r\n", self.to));
        out.push_str(&format!("Subject: {}\r\n", encode_subject(&self.subject)));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str("Content-Type: text/plain; charset=UTF-8\r\n");
        out.push_str("Content-Transfer-Encoding: 8bit\r\n");
        out.push_str(&format!("Date: {}\r\n", date.format("%a, %d %b %Y %H:%M:%S %z")));
        if let Some(mid) = &self.in_reply_to {
            out.push_str(&format!("In-Reply-To: {mid}\r\n"));
        }
        let refs = dedupe_references(&self.references);
        if !refs.is_empty() {
            out.push_str(&format!("References: {}\r\n", refs.join(" ")));
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }

    pub fn render(&self) -> String {
        self.render_at(Local::now())
    }
}

/// Build the reply's references per RFC 5322: the parent's references
/// followed by the parent's message id, order preserved, duplicates
/// dropped.
pub fn reply_references(
    parent_references: &[String],
    parent_in_reply_to: Option<&str>,
    parent_message_id: &str,
) -> Vec<String> {
    let mut refs: Vec<String> = parent_references.to_vec();
    if refs.is_empty() {
        if let Some(irt) = parent_in_reply_to {
            refs.push(irt.to_string());
        }
    }
    if !parent_message_id.is_empty() {
        refs.push(parent_message_id.to_string());
    }
    dedupe_references(&refs)
}

fn dedupe_references(refs: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    refs.iter()
        .filter(|r| !r.is_empty() && seen.insert(r.as_str()))
        .cloned()
        .collect()
}

/// RFC 2047 Q-encode a subject when it contains non-ASCII; plain ASCII
/// passes through unchanged.
pub fn encode_subject(subject: &str) -> String {
    if subject.is_ascii() && !subject.contains("=?") {
        return subject.to_string();
    }
    let mut encoded = String::from("=?UTF-8?Q?");
    for byte in subject.bytes() {
        match byte {
            b' ' => encoded.push('_'),
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b',' | b'!' | b'-' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("={byte:02X}")),
        }
    }
    encoded.push_str("?=");
    encoded
}
