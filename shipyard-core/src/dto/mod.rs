//! Data Transfer Objects for the orchestrator API
//!
//! Lightweight request/response shapes shared by the orchestrator, the HTTP
//! client and the CLI.

pub mod run;
pub mod stack;
pub mod trigger;
