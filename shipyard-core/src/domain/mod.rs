//! Core domain types
//!
//! This module contains the structures shared across Shipyard components.
//! The provisioner owns resources and secrets, the orchestrator owns stages,
//! artifacts and runs, and the runner consumes bindings and build phases.

pub mod artifact;
pub mod binding;
pub mod buildspec;
pub mod grant;
pub mod log;
pub mod resource;
pub mod run;
pub mod secret;
pub mod stage;
