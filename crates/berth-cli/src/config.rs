//! `berth.toml`: every field is optional and falls back to a default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use berth_pipeline::{BackoffPolicy, ContentionPolicy, PipelineSettings};
use berth_session::SessionManagerConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "berth.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    pub sessions: SessionsConfig,
    pub pipeline: PipelineConfig,
    pub responder: ResponderConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Session workspaces live directly under this directory.
    pub workspace_root: PathBuf,
    /// SQLite database holding session and checkpoint records.
    pub database: PathBuf,
    pub max_sessions: usize,
    /// Idle lifetime of a session. Unset means sessions created with
    /// `session create` never expire, while those created by `run` expire
    /// after 24 hours.
    pub ttl_secs: Option<u64>,
    pub disk_quota_mb: Option<u64>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(".berth/workspaces"),
            database: PathBuf::from(".berth/sessions.db"),
            max_sessions: 100,
            ttl_secs: None,
            disk_quota_mb: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stage_timeout_secs: Option<u64>,
    /// Attempts for stages without a repair loop. 1 disables retries.
    pub retry_attempts: usize,
    pub contention: ContentionPolicy,
    pub repair_attempts: usize,
    pub repair_backoff: BackoffPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: Some(900),
            retry_attempts: 1,
            contention: ContentionPolicy::Wait,
            repair_attempts: 3,
            repair_backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponderKind {
    Anthropic,
    /// Replays replies from `script`, a JSON array of strings.
    Scripted,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    pub kind: ResponderKind,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub api_key_env: String,
    pub script: Option<PathBuf>,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            kind: ResponderKind::Anthropic,
            base_url: None,
            model: None,
            max_tokens: berth_llm::DEFAULT_MAX_TOKENS,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            script: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub container_cli: String,
    pub cluster_cli: String,
    pub command_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            container_cli: "docker".to_string(),
            cluster_cli: "kubectl".to_string(),
            command_timeout_secs: 600,
        }
    }
}

impl BerthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sessions.max_sessions == 0 {
            return Err(anyhow!("sessions.max_sessions must be > 0"));
        }
        if self.pipeline.stage_timeout_secs == Some(0) {
            return Err(anyhow!("pipeline.stage_timeout_secs must be > 0"));
        }
        if self.pipeline.retry_attempts == 0 || self.pipeline.repair_attempts == 0 {
            return Err(anyhow!("pipeline retry and repair attempts must be > 0"));
        }
        if self.runtime.command_timeout_secs == 0 {
            return Err(anyhow!("runtime.command_timeout_secs must be > 0"));
        }
        if self.runtime.container_cli.trim().is_empty() || self.runtime.cluster_cli.trim().is_empty() {
            return Err(anyhow!("runtime binaries must not be empty"));
        }
        if self.responder.kind == ResponderKind::Scripted && self.responder.script.is_none() {
            return Err(anyhow!("responder.script is required for the scripted responder"));
        }
        Ok(())
    }

    pub fn session_manager(&self) -> SessionManagerConfig {
        let mut config = SessionManagerConfig::new(self.sessions.workspace_root.clone());
        config.max_sessions = self.sessions.max_sessions;
        config.default_ttl = self.sessions.ttl_secs.map(Duration::from_secs);
        config.disk_quota_bytes = self.sessions.disk_quota_mb.map(|mb| mb * 1024 * 1024);
        config
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            repair_attempts: self.pipeline.repair_attempts,
            repair_backoff: self.pipeline.repair_backoff.clone(),
        }
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.pipeline.stage_timeout_secs.map(Duration::from_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.command_timeout_secs)
    }
}

/// Load the config at `path`. A missing file yields the defaults; so does
/// no path at all, unless `berth.toml` exists in the current directory.
pub fn load_config(path: Option<&Path>) -> Result<BerthConfig> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        let config = BerthConfig::default();
        config.validate()?;
        return Ok(config);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let config: BerthConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    config.validate()?;
    tracing::debug!(path = %path.display(), "Loaded config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let config = load_config(Some(temp.path().join("absent.toml").as_path())).unwrap();
        assert_eq!(config, BerthConfig::default());
        assert_eq!(config.runtime.container_cli, "docker");
        assert_eq!(config.pipeline.contention, ContentionPolicy::Wait);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("berth.toml");
        fs::write(
            &path,
            r#"
[sessions]
workspace_root = "/var/lib/berth"
ttl_secs = 3600

[pipeline]
contention = "fail_fast"
repair_attempts = 5

[pipeline.repair_backoff]
kind = "exponential"
base = 250
max = 4000

[responder]
kind = "none"
"#,
        )
        .unwrap();

        let config = load_config(Some(path.as_path())).unwrap();
        assert_eq!(config.sessions.workspace_root, PathBuf::from("/var/lib/berth"));
        assert_eq!(config.sessions.max_sessions, 100);
        assert_eq!(config.pipeline.contention, ContentionPolicy::FailFast);
        assert_eq!(
            config.pipeline.repair_backoff,
            BackoffPolicy::Exponential {
                base: Duration::from_millis(250),
                max: Duration::from_secs(4),
            }
        );
        assert_eq!(config.responder.kind, ResponderKind::None);
        assert_eq!(config.runtime.cluster_cli, "kubectl");

        let manager = config.session_manager();
        assert_eq!(manager.default_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(config.pipeline_settings().repair_attempts, 5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("berth.toml");

        fs::write(&path, "[pipeline]\nrepair_attempts = 0\n").unwrap();
        assert!(load_config(Some(path.as_path())).is_err());

        fs::write(&path, "[responder]\nkind = \"scripted\"\n").unwrap();
        assert!(load_config(Some(path.as_path())).is_err());

        fs::write(&path, "[sessions\n").unwrap();
        assert!(load_config(Some(path.as_path())).is_err());
    }

    #[test]
    fn quota_is_converted_to_bytes() {
        let mut config = BerthConfig::default();
        config.sessions.disk_quota_mb = Some(2);
        assert_eq!(config.session_manager().disk_quota_bytes, Some(2 * 1024 * 1024));
    }
}
