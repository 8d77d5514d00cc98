//! Permission policy and human-approval plumbing.
//!
//! Three layers, composed bottom-up:
//! - [`store`] — per-user allow/deny rules persisted to YAML
//! - [`permission`] — tier + stored rules + dangerous-command filter → decision
//! - [`rendezvous`] — pending approval requests and response delivery

pub mod permission;
pub mod rendezvous;
pub mod store;

pub use permission::{PermissionCheck, PermissionDecision, PermissionService};
pub use rendezvous::{ApprovalBroker, ApprovalError, ApprovalNotifier};
pub use store::{ApprovalStore, StoreError, ToolRules, UserApprovals};
