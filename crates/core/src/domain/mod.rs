// Domain Layer - entities and invariants of on-demand repair

pub mod error;
pub mod job;
pub mod table;
pub mod token;
pub mod view;
pub mod vnode;

// Re-exports
pub use error::DomainError;
pub use job::{JobId, OngoingJob, RepairStatus};
pub use table::TableReference;
pub use token::{NodeId, TokenRange};
pub use view::OnDemandRepairJobView;
pub use vnode::VnodeState;
