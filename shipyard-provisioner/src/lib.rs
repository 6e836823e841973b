//! Shipyard Provisioner
//!
//! Owns the stack's shared resources (network, registry, cluster, secrets),
//! the ledger of what each run pushed and deployed, and the permission grants
//! that let the build identity use them.

pub mod access;
pub mod config;
pub mod ledger;
pub mod provisioner;
pub mod secrets;
mod state;

pub use access::{AccessBinder, grant_build_access};
pub use config::StackConfig;
pub use provisioner::ResourceProvisioner;
pub use state::{ResourceRecord, ResourceStatus};
