//! Desired orchestrator objects for a workload.
//!
//! Pure functions from (workload, catalog entry, allocations) to the
//! workload object and volume claims the reconciler asks the orchestrator
//! to create. The same inputs always produce the same objects.

use std::collections::BTreeMap;
use std::time::Duration;

use arena_core::{ConfigError, GameConfig, HealthKind, ResourcePlan, ResourceRequirement, parse_duration};
use arena_orchestrator::{
    HealthCheckSpec, HostPortBinding, LABEL_GAME, LABEL_SERVER_ID, Labels, VolumeClaim,
    VolumeMount, WorkloadObject, WorkloadObjectStatus, WorkloadSpec, claim_name, object_name,
};
use arena_state::{Allocation, Workload};

use crate::error::ReconcileResult;

/// Path of the supervisor's readiness endpoint.
pub const SUPERVISOR_READY_PATH: &str = "/readyz";

/// What every supervisor needs to reach the control plane.
#[derive(Debug, Clone)]
pub struct SupervisorEnv {
    pub api_url: String,
    pub auth_token: String,
    /// Port of the supervisor's local health server.
    pub health_server_port: u16,
}

impl Default for SupervisorEnv {
    fn default() -> Self {
        Self {
            api_url: "http://arenad:8080".to_string(),
            auth_token: String::new(),
            health_server_port: 9090,
        }
    }
}

fn labels(workload: &Workload) -> Labels {
    Labels::from([
        (LABEL_SERVER_ID.to_string(), workload.id.clone()),
        (LABEL_GAME.to_string(), workload.game.clone()),
    ])
}

/// One claim per declared volume, sized by the plan's storage.
pub fn volume_claims(workload: &Workload, game: &GameConfig, plan: &ResourcePlan) -> Vec<VolumeClaim> {
    game.volumes
        .iter()
        .map(|volume| VolumeClaim {
            name: claim_name(&workload.id, &volume.name),
            labels: labels(workload),
            storage: plan.storage.clone(),
        })
        .collect()
}

/// The workload object pinned to `node_name` with every catalog port bound
/// to its allocated host port.
pub fn workload_object(
    workload: &Workload,
    game: &GameConfig,
    resources: ResourceRequirement,
    node_name: &str,
    allocations: &[Allocation],
    supervisor: &SupervisorEnv,
) -> ReconcileResult<WorkloadObject> {
    let mut ports = Vec::with_capacity(game.ports.len());
    for spec in &game.ports {
        let allocation = allocations
            .iter()
            .find(|a| a.port_name == spec.name)
            .ok_or_else(|| ConfigError::Invalid {
                field: "ports".to_string(),
                reason: format!("no allocation for port {:?}", spec.name),
            })?;
        ports.push(HostPortBinding {
            name: spec.name.clone(),
            container_port: spec.container_port,
            host_port: allocation.port,
            protocol: spec.protocol,
        });
    }

    let volumes = game
        .volumes
        .iter()
        .map(|volume| VolumeMount {
            name: volume.name.clone(),
            mount_path: volume.mount_path.clone(),
            claim_name: claim_name(&workload.id, &volume.name),
        })
        .collect();

    let secs = |value: &Option<String>, field: &str, default: Duration| -> ReconcileResult<u64> {
        match value {
            Some(raw) => parse_duration(raw)
                .map(|d| d.as_secs())
                .ok_or_else(|| {
                    ConfigError::InvalidDuration {
                        field: field.to_string(),
                        value: raw.clone(),
                    }
                    .into()
                }),
            None => Ok(default.as_secs()),
        }
    };

    Ok(WorkloadObject {
        name: object_name(&workload.id),
        labels: labels(workload),
        spec: WorkloadSpec {
            node_name: node_name.to_string(),
            image: game.image.clone(),
            env: supervisor_env(workload, game, &ports, supervisor)?,
            ports,
            volumes,
            resources,
            health: HealthCheckSpec {
                path: SUPERVISOR_READY_PATH.to_string(),
                port: supervisor.health_server_port,
                initial_delay_secs: secs(
                    &game.health.initial_delay,
                    "health.initial_delay",
                    Duration::ZERO,
                )?,
                period_secs: secs(&game.health.interval, "health.interval", Duration::from_secs(10))?,
            },
        },
        status: WorkloadObjectStatus::default(),
    })
}

/// Catalog env defaults overlaid with the supervisor's `ARENA_*` variables.
fn supervisor_env(
    workload: &Workload,
    game: &GameConfig,
    ports: &[HostPortBinding],
    supervisor: &SupervisorEnv,
) -> ReconcileResult<BTreeMap<String, String>> {
    let mut env: BTreeMap<String, String> = game
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    env.insert("ARENA_SERVER_ID".to_string(), workload.id.clone());
    env.insert("ARENA_API_URL".to_string(), supervisor.api_url.clone());
    env.insert("ARENA_AUTH_TOKEN".to_string(), supervisor.auth_token.clone());
    env.insert(
        "ARENA_HEALTH_SERVER_PORT".to_string(),
        supervisor.health_server_port.to_string(),
    );
    if !game.command.is_empty() {
        let command = serde_json::to_string(&game.command).map_err(|e| ConfigError::Invalid {
            field: "command".to_string(),
            reason: e.to_string(),
        })?;
        env.insert("ARENA_START_COMMAND".to_string(), command);
    }

    let health = &game.health;
    env.insert("ARENA_HEALTH_TYPE".to_string(), health.kind.as_str().to_string());
    if health.kind == HealthKind::Port {
        let target = match &health.port {
            Some(name) => ports.iter().find(|p| &p.name == name),
            None => ports.first(),
        };
        let Some(target) = target else {
            return Err(ConfigError::Invalid {
                field: "health.port".to_string(),
                reason: format!("game {} declares no matching port", game.name),
            }
            .into());
        };
        env.insert("ARENA_HEALTH_PORT".to_string(), target.container_port.to_string());
        env.insert("ARENA_HEALTH_PROTOCOL".to_string(), target.protocol.as_str().to_string());
    }
    let optional = [
        ("ARENA_HEALTH_PATTERN", &health.pattern),
        ("ARENA_HEALTH_INITIAL_DELAY", &health.initial_delay),
        ("ARENA_HEALTH_TIMEOUT", &health.timeout),
        ("ARENA_HEALTH_INTERVAL", &health.interval),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            env.insert(key.to_string(), value.clone());
        }
    }

    for port in ports {
        let key = format!("ARENA_PORT_{}", port.name.to_uppercase().replace('-', "_"));
        env.insert(key, port.host_port.to_string());
    }

    Ok(env)
}
