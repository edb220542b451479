//! The email gateway: maps inbound mail threads to runs and mails the
//! final assistant reply back on the same thread. The raw IMAP/SMTP
//! transport sits behind the [`InboundMailbox`] / [`OutboundMailer`]
//! traits.

pub mod bridge;
pub mod inbound;
pub mod outbound;
pub mod subject;
pub mod traits;

pub use bridge::{EmailBridge, GatewayStatus};
pub use inbound::InboundEmail;
pub use outbound::OutboundEmail;
pub use subject::{normalized_subject, subject_key};
pub use traits::{InboundMailbox, OutboundMailer, RawInbound};
