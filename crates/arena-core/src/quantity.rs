//! Resource quantity parsing.
//!
//! Catalog plans declare CPU as `"500m"` / `"2"` / `"0.5"` and memory as
//! `"512Mi"` / `"2Gi"` / `"1G"` / plain bytes. Everything downstream of the
//! catalog works with [`ResourceRequirement`], which holds normalized
//! integer units (millicores, bytes).

use serde::{Deserialize, Serialize};

/// CPU and memory needed by one workload, in normalized units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl ResourceRequirement {
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    /// Parse a requirement from raw quantity strings.
    pub fn parse(cpu: &str, memory: &str) -> Option<Self> {
        Some(Self {
            cpu_millis: parse_cpu_millis(cpu)?,
            memory_bytes: parse_memory_bytes(memory)?,
        })
    }

    /// Add a fixed overhead (e.g. the supervisor sidecar) to this requirement.
    pub fn with_overhead(self, overhead: ResourceRequirement) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_add(overhead.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(overhead.memory_bytes),
        }
    }

    /// Whether this requirement fits into the given free capacity.
    pub fn fits_within(&self, free: &ResourceRequirement) -> bool {
        self.cpu_millis <= free.cpu_millis && self.memory_bytes <= free.memory_bytes
    }
}

/// Parse a CPU quantity into millicores.
pub fn parse_cpu_millis(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(millis) = s.strip_suffix('m') {
        return millis.parse::<u64>().ok();
    }
    scaled(s, 1000.0)
}

/// Parse a memory quantity into bytes.
pub fn parse_memory_bytes(s: &str) -> Option<u64> {
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    let s = s.trim();
    for (suffix, factor) in SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return scaled(number, *factor);
        }
    }
    scaled(s, 1.0)
}

fn scaled(number: &str, factor: f64) -> Option<u64> {
    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * factor).round() as u64)
}
