//! Shipyard Core
//!
//! Core types and abstractions for the Shipyard deployment pipeline.
//!
//! This crate contains:
//! - Domain types: artifacts, the stage graph, build specs, bindings, grants,
//!   secrets, provisioned resource handles and run records
//! - Errors: the failure taxonomy shared by every component
//! - DTOs: request/response types for the orchestrator API

pub mod domain;
pub mod dto;
pub mod error;

pub use error::{BuildSpecError, FailureCause, ProvisioningError, StageGraphError};
