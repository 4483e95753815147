//! Optimistic mutations and batches.

mod batch;
mod coordinator;
mod patch;

pub use batch::{BatchOutcome, BatchRunner, ItemOperation, ItemOutcome, ItemStatus};
pub use coordinator::{MutationCoordinator, MutationRecord, MutationStatus, Operation};
pub use patch::Patch;
