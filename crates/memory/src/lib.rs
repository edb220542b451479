//! Durable memory: classified daily notes, session capture, and the
//! bounded MEMORY.md document, written with strict redaction and path
//! safety so secrets and traversal never reach the memory root.

pub mod capture;
pub mod daily;
pub mod flush;
pub mod memory_md;
pub mod paths;
pub mod queue;
pub mod read;
pub mod redact;
pub mod summary;

pub use daily::{DailyNote, NoteKind};
pub use memory_md::{MemoryMdUpdater, TurnDigest, UpdateOutcome};
pub use paths::MemoryRoot;
pub use queue::UpdateQueue;
pub use redact::Redactor;
