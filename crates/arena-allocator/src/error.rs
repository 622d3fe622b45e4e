use arena_state::StateError;
use thiserror::Error;

pub type AllocatorResult<T> = Result<T, AllocatorError>;

#[derive(Debug, Error)]
pub enum AllocatorError {
    /// No node satisfies the resource requirement and every port request.
    #[error("no capacity for workload {workload_id}: {reason}")]
    NoCapacity { workload_id: String, reason: String },

    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    State(#[from] StateError),
}
