/// Shared error type used across all Hivemind crates.
///
/// Variants map onto the four failure classes the substrate distinguishes:
/// validation (reject, no durable mutation), transient io (retried by the
/// owning loop), external (model / mail), and fatal (path safety, corrupt
/// store).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("path safety: {0}")]
    PathSafety(String),

    #[error("chat: {message}")]
    Chat {
        message: String,
        /// True when the backend rejected the request for exceeding its
        /// context window; drives auto-compaction.
        context_overflow: bool,
    },

    #[error("mail: {0}")]
    Mail(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// A generic chat-backend error, classifying overflow from the text.
    pub fn chat(message: impl Into<String>) -> Self {
        let message = message.into();
        let context_overflow = looks_like_context_overflow(&message);
        Error::Chat {
            message,
            context_overflow,
        }
    }

    /// A chat-backend error known to be a context overflow.
    pub fn context_overflow(message: impl Into<String>) -> Self {
        Error::Chat {
            message: message.into(),
            context_overflow: true,
        }
    }

    /// Whether this error is a model-side context overflow.
    pub fn is_context_overflow(&self) -> bool {
        matches!(
            self,
            Error::Chat {
                context_overflow: true,
                ..
            }
        )
    }
}

/// Heuristic classifier for backend error text that indicates the request
/// exceeded the model's context window.
pub fn looks_like_context_overflow(message: &str) -> bool {
    let lower = message.to_lowercase();
    const MARKERS: &[&str] = &[
        "context_length_exceeded",
        "context length",
        "context window",
        "maximum context",
        "prompt is too long",
        "too many tokens",
        "input is too long",
        "exceeds the maximum",
    ];
    MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_classifier_matches_common_backends() {
        assert!(looks_like_context_overflow(
            "400 context_length_exceeded: reduce your prompt"
        ));
        assert!(looks_like_context_overflow(
            "This model's maximum context length is 128000 tokens"
        ));
        assert!(looks_like_context_overflow("Prompt is too long: 210000 > 200000"));
        assert!(!looks_like_context_overflow("rate limit exceeded"));
        assert!(!looks_like_context_overflow("connection reset by peer"));
    }

    #[test]
    fn chat_constructor_classifies() {
        assert!(Error::chat("maximum context length exceeded").is_context_overflow());
        assert!(!Error::chat("503 service unavailable").is_context_overflow());
        assert!(Error::context_overflow("whatever").is_context_overflow());
    }
}
