//! Mutations with optimistic updates and rollback.

mod coordinator;
mod descriptor;
mod rollback;

pub use coordinator::{
    ExecutionStatus, MutationCoordinator, MutationExecution, MutationHandle, MutationState,
    cached_or_null,
};
pub use descriptor::MutationDescriptor;
pub use rollback::{CachePatch, OptimisticUpdate, Rollback};

pub(crate) use coordinator::METRIC_ROLLBACK;
