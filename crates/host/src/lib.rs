//! Host wiring for the `hivemind` binary: CLI surface, configuration
//! loading, subsystem startup, and the interactive loop.

pub mod app;
pub mod cli;
pub mod outbox;
