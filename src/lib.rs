//! Dialogue Bridge Library
//!
//! Turn-taking bridge between a speech robot and a language-model backend.
//! The binaries are in `src/main.rs` and `src/bin/`.

pub mod agent;
pub mod cli;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod llm;
pub mod realtime;
pub mod transcript;
