//! arena-detector: container-level failure detection.
//!
//! The orchestrator's workload phase does not surface crash loops, OOM
//! kills or image pull problems. The [`Detector`] polls pod status for every
//! `running` or `starting` workload and forces those workloads to `failed`.

pub mod detector;

pub use detector::{DetectionReport, Detector, DEFAULT_CRASH_LOOP_THRESHOLD};
