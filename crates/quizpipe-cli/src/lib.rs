//! `quizpipe` crate (library surface).
//!
//! The `quizpipe` binary is the main entrypoint. This re-exports the pipeline crates
//! for callers that want to embed the solver directly.

pub use quizpipe_core as core;
pub use quizpipe_local as local;
