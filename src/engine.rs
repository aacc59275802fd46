use crate::config::ResourceLimits;
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Engine-assigned identifier of a launched container
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to launch one job container
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Container name, unique per job
    pub name: String,
    /// Fully qualified image reference
    pub image: String,
    /// Host directory mounted read-only
    pub input_dir: PathBuf,
    /// Host directory mounted read-write
    pub output_dir: PathBuf,
    /// Positional arguments for the image entry command
    pub args: Vec<String>,
    pub limits: ResourceLimits,
    pub env: Vec<(String, String)>,
    /// `uid:gid` inside the container
    pub user: String,
    /// Cap on what the engine retains of the container's output
    pub max_log_bytes: usize,
    pub labels: Vec<(String, String)>,
}

/// Output captured from a finished container
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Keep only the last `max_bytes` of each stream, on a char boundary
    pub fn truncated(mut self, max_bytes: usize) -> Self {
        self.stdout = tail(&self.stdout, max_bytes);
        self.stderr = tail(&self.stderr, max_bytes);
        self
    }
}

fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Capabilities of a container engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCapabilities {
    /// Engine name
    pub name: String,
    /// Engine version string, if known
    pub version: Option<String>,
    /// Whether `--network none` is honored
    pub network_isolation: bool,
    /// Whether memory/cpu/pids limits are enforced
    pub resource_limits: bool,
    /// Whether the container root filesystem can be made read-only
    pub read_only_rootfs: bool,
}

/// Seam between the job runner and the container runtime
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Whether an image with this reference is present locally
    async fn image_exists(&self, reference: &str) -> Result<bool>;

    /// Build `context_dir` (containing a `Dockerfile`) and tag it as `reference`
    async fn build_image(&self, reference: &str, context_dir: &Path) -> Result<()>;

    /// Launch a detached container
    async fn start(&self, spec: &LaunchSpec) -> Result<ContainerId>;

    /// Block until the container exits and return its exit status
    async fn wait(&self, id: &ContainerId) -> Result<i64>;

    /// Collect stdout/stderr of a stopped container
    async fn logs(&self, id: &ContainerId) -> Result<CapturedOutput>;

    /// Force-remove a container. Removing a missing container is not an error.
    async fn remove(&self, id: &ContainerId) -> Result<()>;

    /// Get engine capabilities
    fn capabilities(&self) -> EngineCapabilities;
}
