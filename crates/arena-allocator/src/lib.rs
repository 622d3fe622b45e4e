//! Arena capacity allocator: bin-packing node selection and host-port
//! reservation.
//!
//! The allocator is the only writer of allocation and reservation records.
//! Every request runs inside one ledger transaction of the state store, so
//! two concurrent requests can never observe the same free port or count
//! the same free capacity twice.
//!
//! # Components
//!
//! - **`scorer`**: Node scoring (bin-packing, balance)
//! - **`usage`**: Per-node view of the ledger (capacity minus reservations)
//! - **`allocator`**: The allocate / lookup / release operations

pub mod allocator;
pub mod error;
pub mod scorer;
pub mod usage;

pub use allocator::{Allocator, PortRequest};
pub use error::{AllocatorError, AllocatorResult};
pub use scorer::{NodeScore, ScoringWeights, rank_nodes, score_node};
pub use usage::{NodeUsage, ledger_usage};
