//! Configuration: TOML file loading, CLI overrides, and defaults.
//!
//! Resolution order (first found wins, values merge/override):
//! 1. CLI flags (`--mode`, `--rollback`, `--orphans`, `--log-level`)
//! 2. Explicit `--config <FILE>`
//! 3. `$MAPTREE_CONFIG` environment variable (path to config file)
//! 4. Project-local `.maptree.toml` in the current working directory
//! 5. Global `<config_dir>/maptree/config.toml`
//! 6. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::RollbackPolicy;
use crate::tree::OrphanPolicy;

/// Whether intents go through the repository or only touch the local trees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Sync,
    #[default]
    Async,
}

impl EngineMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(EngineMode::Sync),
            "async" => Some(EngineMode::Async),
            _ => None,
        }
    }
}

// ── Section configs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: Option<EngineMode>,
    /// What to do when the repository rejects an optimistic change.
    pub rollback: Option<RollbackPolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DecodeConfig {
    /// Records whose parent is missing: "root" or "reject".
    pub orphans: Option<OrphanPolicy>,
}

/// In-memory repository used by the driver binary.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RepositoryConfig {
    pub latency_ms: Option<u64>,
    /// First id handed out on create.
    pub first_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: Option<String>,
}

// ── Top-level config ─────────────────────────────────────────────────────────

/// All fields are optional so that partial configs from different sources
/// can be merged together.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MapTreeConfig {
    pub engine: EngineConfig,
    pub decode: DecodeConfig,
    pub repository: RepositoryConfig,
    pub logging: LoggingConfig,
}

pub const DEFAULT_FIRST_ID: u64 = 1000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

// ── Config file locator ──────────────────────────────────────────────────────

/// Candidate config file paths in priority order, excluding `--config`.
fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(env_path) = std::env::var("MAPTREE_CONFIG") {
        paths.push(PathBuf::from(env_path));
    }

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".maptree.toml"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("maptree").join("config.toml"));
    }

    paths
}

/// Read and parse a TOML config file. Returns `None` if the file doesn't
/// exist or can't be parsed (with a warning on stderr; logging is not up yet).
fn load_file(path: &Path) -> Option<MapTreeConfig> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<MapTreeConfig>(&content) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            eprintln!(
                "Warning: failed to parse config file {}: {}",
                path.display(),
                e
            );
            None
        }
    }
}

impl MapTreeConfig {
    /// Merge `other` on top of `self`; `other`'s `Some` values win.
    pub fn merge(self, other: &MapTreeConfig) -> MapTreeConfig {
        MapTreeConfig {
            engine: EngineConfig {
                mode: other.engine.mode.or(self.engine.mode),
                rollback: other.engine.rollback.or(self.engine.rollback),
            },
            decode: DecodeConfig {
                orphans: other.decode.orphans.or(self.decode.orphans),
            },
            repository: RepositoryConfig {
                latency_ms: other.repository.latency_ms.or(self.repository.latency_ms),
                first_id: other.repository.first_id.or(self.repository.first_id),
            },
            logging: LoggingConfig {
                level: other.logging.level.clone().or(self.logging.level),
            },
        }
    }

    /// Load the final merged configuration.
    ///
    /// `cli_config_path` comes from `--config`; `cli_overrides` are the
    /// partial overrides derived from the other flags.
    pub fn load(cli_config_path: Option<&Path>, cli_overrides: Option<&MapTreeConfig>) -> MapTreeConfig {
        let mut config = MapTreeConfig::default();

        // Lowest priority first so higher ones overwrite.
        for path in candidate_paths().iter().rev() {
            if let Some(file_cfg) = load_file(path) {
                config = config.merge(&file_cfg);
            }
        }

        if let Some(cli_path) = cli_config_path {
            match load_file(cli_path) {
                Some(file_cfg) => config = config.merge(&file_cfg),
                None => eprintln!("Warning: config file {} not loaded", cli_path.display()),
            }
        }

        if let Some(overrides) = cli_overrides {
            config = config.merge(overrides);
        }

        config
    }

    // ── Getters with built-in defaults ──────────────────────────────────────

    pub fn mode(&self) -> EngineMode {
        self.engine.mode.unwrap_or_default()
    }

    pub fn rollback(&self) -> RollbackPolicy {
        self.engine.rollback.unwrap_or_default()
    }

    pub fn orphans(&self) -> OrphanPolicy {
        self.decode.orphans.unwrap_or_default()
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.repository.latency_ms.unwrap_or(0))
    }

    pub fn first_id(&self) -> u64 {
        self.repository.first_id.unwrap_or(DEFAULT_FIRST_ID)
    }

    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}
