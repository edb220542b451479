//! Inbound message parsing: raw RFC822 bytes → [`InboundEmail`], with
//! quoted-tail stripping so only the fresh text reaches the turn loop.

use mailparse::{addrparse, parse_mail, MailAddr, MailHeaderMap, ParsedMail};

use hm_domain::{Error, Result};

/// A parsed inbound message.
#[derive(Debug, Clone, Default)]
pub struct InboundEmail {
    /// Message-ID in canonical `<…>` form.
    pub message_id: String,
    /// Bare sender address (`alice@example.com`).
    pub from: String,
    pub subject: String,
    /// Plain-text body with quoted history removed.
    pub body: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

/// Quote-block markers that start the replied-to history.
const QUOTE_MARKERS: &[&str] = &[
    "---- 原邮件 ----",
    "----原邮件----",
    "-----Original Message-----",
    "---------- Forwarded message ----------",
];

/// Parse raw message bytes into an [`InboundEmail`].
pub fn parse_inbound(raw: &[u8]) -> Result<InboundEmail> {
    let parsed =
        parse_mail(raw).map_err(|e| Error::Mail(format!("unparseable message: {e}")))?;
    let headers = &parsed.headers;

    let message_id = headers
        .get_first_value("Message-ID")
        .map(|v| canonical_mid(&v))
        .unwrap_or_default();
    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let in_reply_to = headers
        .get_first_value("In-Reply-To")
        .map(|v| canonical_mid(&v))
        .filter(|v| !v.is_empty());
    let references = headers
        .get_first_value("References")
        .map(|v| {
            v.split_whitespace()
                .map(canonical_mid)
                .filter(|m| !m.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let from = headers
        .get_first_value("From")
        .and_then(|v| first_address(&v))
        .unwrap_or_default();

    let body = clean_body(&text_body(&parsed)?);

    Ok(InboundEmail {
        message_id,
        from,
        subject,
        body,
        in_reply_to,
        references,
    })
}

/// Normalize a message id to `<…>` form.
pub fn canonical_mid(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let bare = trimmed.trim_start_matches('<').trim_end_matches('>');
    if bare.is_empty() {
        return String::new();
    }
    format!("<{bare}>")
}

fn first_address(header: &str) -> Option<String> {
    let list = addrparse(header).ok()?;
    list.iter().find_map(|addr| match addr {
        MailAddr::Single(info) => Some(info.addr.clone()),
        MailAddr::Group(group) => group.addrs.first().map(|i| i.addr.clone()),
    })
}

/// Extract the best plain-text body: the first `text/plain` part, else
/// the top-level body.
fn text_body(parsed: &ParsedMail<'_>) -> Result<String> {
    fn find_plain(part: &ParsedMail<'_>) -> Option<String> {
        if part.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            return part.get_body().ok();
        }
        part.subparts.iter().find_map(find_plain)
    }
    if let Some(body) = find_plain(parsed) {
        return Ok(body);
    }
    parsed
        .get_body()
        .map_err(|e| Error::Mail(format!("unreadable body: {e}")))
}

/// Remove the quoted history: everything from the first quote marker (or
/// a trailing "On … wrote:" / "在 … 写道：" attribution line) onward.
pub fn clean_body(body: &str) -> String {
    let mut cut = body.len();
    for marker in QUOTE_MARKERS {
        if let Some(i) = body.find(marker) {
            cut = cut.min(i);
        }
    }

    for (offset, line) in line_offsets(body) {
        if offset >= cut {
            break;
        }
        let t = line.trim();
        let attribution_en = t.starts_with("On ") && t.ends_with("wrote:");
        let attribution_zh = t.starts_with("在") && (t.ends_with("写道：") || t.ends_with("写道:"));
        if attribution_en || attribution_zh {
            cut = offset;
            break;
        }
    }

    body[..cut].trim().to_string()
}

fn line_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split_inclusive('\n').scan(0usize, |offset, line| {
        let start = *offset;
        *offset += line.len();
        Some((start, line.trim_end_matches(['\n', '\r'])))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "Message-ID: <m1@example.com>\r\n\
From: Alice <alice@example.com>\r\n\
To: bot@example.com\r\n\
Subject: Deploy plan\r\n\
Content-Type: text/plain; charset=UTF-8\r\n\
\r\n\
Please prepare the deploy.\r\n";

    #[test]
    fn parse_simple_message() {
        let email = parse_inbound(RAW.as_bytes()).unwrap();
        assert_eq!(email.message_id, "<m1@example.com>");
        assert_eq!(email.from, "alice@example.com");
        assert_eq!(email.subject, "Deploy plan");
        assert_eq!(email.body, "Please prepare the deploy.");
        assert!(email.in_reply_to.is_none());
        assert!(email.references.is_empty());
    }

    #[test]
    fn parse_reply_with_threading_headers() {
        let raw = "Message-ID: <m2@example.com>\r\n\
From: alice@example.com\r\n\
Subject: Re: Deploy plan\r\n\
In-Reply-To: <m1@example.com>\r\n\
References: <m0@example.com> <m1@example.com>\r\n\
Content-Type: text/plain; charset=UTF-8\r\n\
\r\n\
Looks good.\r\n";
        let email = parse_inbound(raw.as_bytes()).unwrap();
        assert_eq!(email.in_reply_to.as_deref(), Some("<m1@example.com>"));
        assert_eq!(
            email.references,
            vec!["<m0@example.com>", "<m1@example.com>"]
        );
    }

    #[test]
    fn chinese_quote_block_removed() {
        let body = "请检查部署\n\n---- 原邮件 ----\n发件人: bot\n旧内容";
        assert_eq!(clean_body(body), "请检查部署");
    }

    #[test]
    fn english_attribution_line_removed() {
        let body = "Sounds good, ship it.\n\nOn Mon, Jul 27, 2026 at 9:14 AM Bot wrote:\n> earlier\n> text";
        assert_eq!(clean_body(body), "Sounds good, ship it.");
    }

    #[test]
    fn body_without_quotes_untouched() {
        assert_eq!(clean_body("just text\nwith lines"), "just text\nwith lines");
    }

    #[test]
    fn canonical_mid_forms() {
        assert_eq!(canonical_mid(" <x@y> "), "<x@y>");
        assert_eq!(canonical_mid("x@y"), "<x@y>");
        assert_eq!(canonical_mid(""), "");
        assert_eq!(canonical_mid("<>"), "");
    }
}
