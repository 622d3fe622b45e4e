//! arena-watcher: the event-driven half of the Arena control plane.
//!
//! The [`Watcher`] subscribes to the orchestrator's change feed and turns
//! reported phases into status transitions as they happen:
//!
//! | Notification                                   | Transition            |
//! |------------------------------------------------|-----------------------|
//! | phase Creating / Starting / Scheduled / RequestReady | pending → starting |
//! | phase Ready                                    | starting → running    |
//! | phase Shutdown                                 | running → stopping    |
//! | delete (including tombstones)                  | stopping → stopped    |
//!
//! Events are held back until the feed's initial listing is complete, and
//! update notifications whose phase did not change are dropped.

pub mod watcher;

pub use watcher::{EventOutcome, Watcher};
