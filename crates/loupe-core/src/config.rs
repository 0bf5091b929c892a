//! `loupe.toml` configuration.
//!
//! All sections are optional; every field falls back to a default so an
//! empty or missing file yields a working setup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoupeConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub agent: AgentConfig,
    pub dispatch: DispatchConfig,
}

impl LoupeConfig {
    /// Load from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .context(format!("failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .context(format!("failed to parse config: {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            agent = %config.agent.command,
            max_retries = config.dispatch.max_retries,
            "loaded config"
        );
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3847".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `queue.json`, its backup and the screenshots.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".loupe"),
        }
    }
}

/// How the coding agent is launched.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable to run (looked up on `PATH`).
    pub command: String,
    /// Working directory of the agent: the project being edited.
    pub project_dir: PathBuf,
    pub max_turns: u32,
    pub allowed_tools: Vec<String>,
    /// Wall-clock budget for one run.
    pub timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace_secs: u64,
    /// Appended verbatim to the command line.
    pub extra_args: Vec<String>,
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".into(),
            project_dir: PathBuf::from("."),
            max_turns: 40,
            allowed_tools: vec![
                "Read".into(),
                "Edit".into(),
                "Write".into(),
                "Glob".into(),
                "Grep".into(),
                "Bash(loupe task update:*)".into(),
            ],
            timeout_secs: 900,
            kill_grace_secs: 5,
            extra_args: Vec::new(),
        }
    }
}

/// Dispatch loop policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Run the dispatcher inside `loupe serve`.
    pub enabled: bool,
    /// Tasks with this many rejected attempts are no longer dispatched.
    pub max_retries: usize,
    /// How long shutdown waits for a running agent to exit.
    pub shutdown_grace_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Pause after the agent executable could not be started.
    pub spawn_retry_secs: u64,
    /// Pause after a run that ended without reporting; doubles per
    /// consecutive crash.
    pub crash_retry_base_ms: u64,
    pub crash_retry_max_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            shutdown_grace_secs: 10,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            spawn_retry_secs: 30,
            crash_retry_base_ms: 2_000,
            crash_retry_max_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: LoupeConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:3847");
        assert_eq!(config.agent.command, "claude");
        assert_eq!(config.dispatch.max_retries, 3);
        assert_eq!(config.agent.timeout(), Duration::from_secs(900));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: LoupeConfig = toml::from_str(
            r#"
            [agent]
            command = "/opt/bin/claude"
            max_turns = 12

            [dispatch]
            max_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.command, "/opt/bin/claude");
        assert_eq!(config.agent.max_turns, 12);
        assert_eq!(config.agent.kill_grace_secs, 5);
        assert!(!config.agent.allowed_tools.is_empty());
        assert_eq!(config.dispatch.max_retries, 2);
        assert_eq!(config.dispatch.reconnect_max_ms, 30_000);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoupeConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from(".loupe"));
    }
}
