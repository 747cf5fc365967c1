//! Application configuration, loaded from a TOML file with per-section
//! defaults. Every section may be omitted; a missing file yields the
//! full default configuration.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::{BranchStrategy, Verbosity};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "./shipwright.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Global worker-pool concurrency: at most this many jobs mid-pipeline.
    pub concurrency: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { concurrency: 2 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub default_type: String,
    pub default_model: Option<String>,
    pub max_turns: u32,
    pub default_verbosity: Verbosity,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_type: "claude-code".to_string(),
            default_model: None,
            max_turns: 50,
            default_verbosity: Verbosity::Normal,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub workspace_dir: String,
    pub timeout_seconds: u64,
    /// Grace window between SIGTERM and SIGKILL on timeout or destroy.
    pub kill_grace_seconds: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            workspace_dir: "./workspaces".to_string(),
            timeout_seconds: 1800,
            kill_grace_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub poll_interval_seconds: u64,
    pub max_concurrent_stories: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            max_concurrent_stories: 1,
        }
    }
}

/// Per-project repository settings, snapshotted into each JobPayload.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_strategy")]
    pub branch_strategy: BranchStrategy,
    #[serde(default = "default_true")]
    pub auto_push: bool,
    #[serde(default = "default_true")]
    pub auto_create_pr: bool,
    #[serde(default)]
    pub require_approval: bool,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_strategy() -> BranchStrategy {
    BranchStrategy::FeaturePerJob
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from a TOML file. Returns defaults if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }
}
