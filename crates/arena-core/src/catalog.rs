//! Game catalog: one entry per game type.
//!
//! The catalog is read-mostly configuration owned outside the control plane.
//! The reconciler loads it once per pass so every pending workload in that
//! pass sees the same snapshot.
//!
//! ```toml
//! [[games]]
//! name = "minecraft"
//! image = "ghcr.io/arena/minecraft:1.21"
//! command = ["java", "-jar", "server.jar", "nogui"]
//!
//! [[games.ports]]
//! name = "game"
//! container_port = 25565
//! protocol = "TCP"
//!
//! [games.plans.small]
//! cpu = "1"
//! memory = "2Gi"
//! storage = "10Gi"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::quantity::{ResourceRequirement, parse_cpu_millis, parse_memory_bytes};
use crate::types::Protocol;

/// All known game types.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    #[serde(default)]
    pub games: Vec<GameConfig>,
}

/// Configuration for one game type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameConfig {
    pub name: String,
    pub image: String,
    /// Game server command line, run by the supervisor.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub health: HealthDecl,
    #[serde(default)]
    pub plans: BTreeMap<String, ResourcePlan>,
}

/// A port the game server listens on inside its container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortSpec {
    /// Logical name ("game", "query", "rcon").
    pub name: String,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// A volume mounted into the game container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeSpec {
    pub name: String,
    pub mount_path: String,
}

/// How the supervisor decides the game server is up.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthDecl {
    #[serde(rename = "type", default)]
    pub kind: HealthKind,
    /// Name of the port (from `ports`) to dial for `port` checks.
    pub port: Option<String>,
    /// Regular expression matched against stdout for `log-pattern` checks.
    pub pattern: Option<String>,
    pub initial_delay: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HealthKind {
    #[default]
    None,
    Port,
    LogPattern,
}

impl HealthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthKind::None => "none",
            HealthKind::Port => "port",
            HealthKind::LogPattern => "log-pattern",
        }
    }
}

impl std::str::FromStr for HealthKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "none" => Ok(HealthKind::None),
            "port" => Ok(HealthKind::Port),
            "log-pattern" => Ok(HealthKind::LogPattern),
            other => Err(format!("unknown health check type: {other}")),
        }
    }
}

/// A named resource plan ("small", "large").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePlan {
    pub cpu: String,
    pub memory: String,
    /// Persistent volume size, e.g. "10Gi".
    pub storage: String,
}

impl ResourcePlan {
    /// Normalized CPU/memory requirement for this plan.
    pub fn requirement(&self) -> ConfigResult<ResourceRequirement> {
        let cpu_millis = parse_cpu_millis(&self.cpu).ok_or_else(|| ConfigError::InvalidQuantity {
            field: "cpu".to_string(),
            value: self.cpu.clone(),
        })?;
        let memory_bytes =
            parse_memory_bytes(&self.memory).ok_or_else(|| ConfigError::InvalidQuantity {
                field: "memory".to_string(),
                value: self.memory.clone(),
            })?;
        Ok(ResourceRequirement::new(cpu_millis, memory_bytes))
    }
}

impl Catalog {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn game(&self, name: &str) -> Option<&GameConfig> {
        self.games.iter().find(|g| g.name == name)
    }

    /// Resolve a game and one of its plans.
    pub fn lookup(&self, game: &str, plan: &str) -> ConfigResult<(&GameConfig, &ResourcePlan)> {
        let config = self
            .game(game)
            .ok_or_else(|| ConfigError::UnknownGame(game.to_string()))?;
        let plan_config = config.plans.get(plan).ok_or_else(|| ConfigError::UnknownPlan {
            game: game.to_string(),
            plan: plan.to_string(),
        })?;
        Ok((config, plan_config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[games]]
name = "minecraft"
image = "ghcr.io/arena/minecraft:1.21"

[[games.ports]]
name = "game"
container_port = 25565

[[games.ports]]
name = "query"
container_port = 25565
protocol = "UDP"

[[games.volumes]]
name = "data"
mount_path = "/data"

[games.env]
EULA = "TRUE"

[games.health]
type = "log-pattern"
pattern = "Done \\(.*\\)!"
timeout = "180s"

[games.plans.small]
cpu = "1"
memory = "2Gi"
storage = "10Gi"
"#;

    #[test]
    fn parse_sample_catalog() {
        let catalog = Catalog::from_toml_str(SAMPLE).unwrap();
        let game = catalog.game("minecraft").unwrap();
        assert_eq!(game.ports.len(), 2);
        assert_eq!(game.ports[0].protocol, Protocol::Tcp);
        assert_eq!(game.ports[1].protocol, Protocol::Udp);
        assert_eq!(game.health.kind, HealthKind::LogPattern);
        assert_eq!(game.env.get("EULA").map(String::as_str), Some("TRUE"));
    }

    #[test]
    fn lookup_resolves_plan() {
        let catalog = Catalog::from_toml_str(SAMPLE).unwrap();
        let (game, plan) = catalog.lookup("minecraft", "small").unwrap();
        assert_eq!(game.image, "ghcr.io/arena/minecraft:1.21");
        let req = plan.requirement().unwrap();
        assert_eq!(req.cpu_millis, 1000);
        assert_eq!(req.memory_bytes, 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn health_kind_parses_env_spelling() {
        for kind in [HealthKind::None, HealthKind::Port, HealthKind::LogPattern] {
            assert_eq!(kind.as_str().parse::<HealthKind>().unwrap(), kind);
        }
        assert_eq!("".parse::<HealthKind>().unwrap(), HealthKind::None);
        assert!("http".parse::<HealthKind>().is_err());
    }

    #[test]
    fn lookup_unknown_game_and_plan() {
        let catalog = Catalog::from_toml_str(SAMPLE).unwrap();
        assert!(matches!(
            catalog.lookup("terraria", "small"),
            Err(ConfigError::UnknownGame(_))
        ));
        assert!(matches!(
            catalog.lookup("minecraft", "huge"),
            Err(ConfigError::UnknownPlan { .. })
        ));
    }

    #[test]
    fn invalid_plan_quantity() {
        let plan = ResourcePlan {
            cpu: "one".to_string(),
            memory: "1Gi".to_string(),
            storage: "1Gi".to_string(),
        };
        assert!(matches!(
            plan.requirement(),
            Err(ConfigError::InvalidQuantity { .. })
        ));
    }

    #[test]
    fn health_defaults_to_none() {
        let catalog = Catalog::from_toml_str(
            r#"
[[games]]
name = "bare"
image = "bare:latest"
"#,
        )
        .unwrap();
        assert_eq!(catalog.games[0].health.kind, HealthKind::None);
        assert!(catalog.games[0].plans.is_empty());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let catalog = Catalog::from_file(&path).unwrap();
        assert_eq!(catalog.games.len(), 1);

        let missing = Catalog::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
