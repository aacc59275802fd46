use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resource policy applied to every job container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Hard memory ceiling in MB (swap is pinned to the same value)
    pub memory_mb: u64,
    /// CPU share, in cores
    pub cpus: f64,
    /// Maximum number of processes/threads inside the container
    pub max_processes: u64,
    /// Thread count hint for numeric libraries
    pub max_threads: u32,
    /// Wall-clock timeout in seconds
    pub timeout_seconds: u64,
    /// Run without any network interface
    pub network_disabled: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpus: 1.0,
            max_processes: 64,
            max_threads: 2,
            timeout_seconds: 30,
            network_disabled: true,
        }
    }
}

impl ResourceLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Process-wide configuration for the plot sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Base directory for per-job workspaces
    pub workspace_base: PathBuf,
    /// Explicit container engine binary (defaults to `docker` in PATH)
    pub docker_path: Option<PathBuf>,
    /// Repository name for the sandbox image; the tag is derived from its definition
    pub image_repository: String,
    /// `uid:gid` the job runs as inside the container
    pub container_user: String,
    /// Resource limits
    pub limits: ResourceLimits,
    /// Maximum number of jobs executing at once
    pub max_concurrent_jobs: usize,
    /// Save a still-open figure when the script forgot to
    pub fallback_save: bool,
    /// Largest artifact that will be read back, in bytes
    pub max_artifact_bytes: u64,
    /// Largest amount of captured container output kept for diagnostics
    pub max_log_bytes: usize,
    /// Upper bound for each cleanup step, in seconds
    pub cleanup_grace_seconds: u64,
    /// Upper bound for an image build, in seconds
    pub build_timeout_seconds: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_base: std::env::temp_dir().join("plotbox-workspaces"),
            docker_path: None,
            image_repository: "plotbox-sandbox".to_string(),
            container_user: "10001:10001".to_string(),
            limits: ResourceLimits::default(),
            max_concurrent_jobs: 4,
            fallback_save: true,
            max_artifact_bytes: 20 * 1024 * 1024,
            max_log_bytes: 64 * 1024,
            cleanup_grace_seconds: 10,
            build_timeout_seconds: 900,
        }
    }
}

impl SandboxConfig {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Defaults, then `PLOTBOX_CONFIG` file, then `PLOTBOX_*` overrides
    pub fn from_env() -> Result<Self> {
        let base = match env_trimmed("PLOTBOX_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        base.with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_trimmed("PLOTBOX_WORKSPACE_BASE") {
            self.workspace_base = PathBuf::from(v);
        }
        if let Some(v) = env_trimmed("PLOTBOX_DOCKER") {
            self.docker_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parsed("PLOTBOX_MEMORY_MB")? {
            self.limits.memory_mb = v;
        }
        if let Some(v) = env_parsed("PLOTBOX_CPUS")? {
            self.limits.cpus = v;
        }
        if let Some(v) = env_parsed("PLOTBOX_TIMEOUT_SECONDS")? {
            self.limits.timeout_seconds = v;
        }
        if let Some(v) = env_parsed("PLOTBOX_MAX_JOBS")? {
            self.max_concurrent_jobs = v;
        }
        if let Some(v) = env_parsed("PLOTBOX_FALLBACK_SAVE")? {
            self.fallback_save = v;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the runner cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.limits.timeout_seconds == 0 {
            return Err(SandboxError::InternalError(
                "timeout_seconds must be at least 1".to_string(),
            ));
        }
        if self.limits.memory_mb < 64 {
            return Err(SandboxError::InternalError(
                "memory_mb must be at least 64".to_string(),
            ));
        }
        if self.limits.cpus.is_nan() || self.limits.cpus <= 0.0 {
            return Err(SandboxError::InternalError(
                "cpus must be positive".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(SandboxError::InternalError(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_seconds)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_seconds)
    }
}

fn env_trimmed(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_trimmed(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| SandboxError::InternalError(format!("Invalid value for {key}: {raw}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_network() {
        let config = SandboxConfig::default();
        assert!(config.limits.network_disabled);
        assert!(config.fallback_save);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plotbox.json");
        std::fs::write(
            &path,
            r#"{ "max_concurrent_jobs": 2, "limits": { "timeout_seconds": 5 } }"#,
        )
        .unwrap();

        let config = SandboxConfig::from_file(&path).unwrap();
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.limits.timeout(), Duration::from_secs(5));
        assert_eq!(config.limits.memory_mb, ResourceLimits::default().memory_mb);
        assert_eq!(config.image_repository, "plotbox-sandbox");
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = SandboxConfig::default();
        config.limits.timeout_seconds = 0;
        assert!(config.validate().is_err());
    }
}
