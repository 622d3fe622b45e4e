//! arena-core: shared vocabulary for the Arena control plane.
//!
//! Holds everything more than one subsystem needs to agree on:
//!
//! - **`catalog`**: game types, their port/volume/image requirements and
//!   named resource plans, loaded from TOML.
//! - **`quantity`**: `"500m"` / `"2Gi"` style quantity parsing into a typed
//!   [`ResourceRequirement`].
//! - **`duration`**: `"15s"` / `"500ms"` / `"5m"` duration parsing.
//! - **`config`**: the control-plane daemon's `arena.toml`.
//! - **`types`**: small enums shared by the store, allocator and
//!   orchestrator (port protocol).
//! - **`report`**: request bodies of the supervisor reporting API.

pub mod catalog;
pub mod config;
pub mod duration;
pub mod error;
pub mod quantity;
pub mod report;
pub mod types;

pub use catalog::{Catalog, GameConfig, HealthDecl, HealthKind, PortSpec, ResourcePlan, VolumeSpec};
pub use config::{DaemonConfig, DaemonSettings, NodeSpec};
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use quantity::{ResourceRequirement, parse_cpu_millis, parse_memory_bytes};
pub use report::{HeartbeatReport, StatusReport};
pub use types::Protocol;
