//! arena-state: the durable store for the Arena control plane.
//!
//! Backed by [redb](https://docs.rs/redb), holds workload records, port
//! allocations, per-workload resource reservations and the per-node
//! capacity ledger.
//!
//! # Concurrency
//!
//! Every status change goes through [`StateStore::transition`], a
//! compare-and-swap executed inside one redb write transaction. redb admits
//! a single writer at a time, so two writers racing on the same expected
//! status are serialized and the loser observes "not applied".
//!
//! Allocation bookkeeping runs through [`StateStore::ledger_txn`], which
//! hands the allocator a typed view of the ledger tables inside one write
//! transaction; the closure either commits as a whole or not at all.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod hub;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use hub::{StatusEvent, StatusHub};
pub use store::{LedgerTxn, StateStore};
pub use types::*;

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
