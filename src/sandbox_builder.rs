use crate::{config::ResourceLimits, DockerCli, PlotSandbox, Result, SandboxConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Options for creating a sandbox
#[derive(Default)]
pub struct SandboxOptions {
    /// Explicit config; `None` loads defaults, `PLOTBOX_CONFIG` and `PLOTBOX_*`
    pub config: Option<SandboxConfig>,
    /// Custom docker client binary
    pub docker_path: Option<PathBuf>,
    /// Custom workspace base directory
    pub workspace_base: Option<PathBuf>,
    /// Custom resource limits
    pub limits: Option<ResourceLimits>,
    /// Build the image now instead of on the first run
    pub prebuild_image: bool,
}

impl SandboxOptions {
    /// Use a specific docker client binary
    pub fn docker(docker_path: PathBuf) -> Self {
        Self {
            docker_path: Some(docker_path),
            ..Default::default()
        }
    }

    /// Set custom resource limits
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_workspace_base(mut self, base: PathBuf) -> Self {
        self.workspace_base = Some(base);
        self
    }

    pub fn prebuild(mut self) -> Self {
        self.prebuild_image = true;
        self
    }

    /// Merge the options over the loaded config
    pub fn resolve(self) -> Result<SandboxConfig> {
        let mut config = match self.config {
            Some(config) => config,
            None => SandboxConfig::from_env()?,
        };
        if let Some(path) = self.docker_path {
            config.docker_path = Some(path);
        }
        if let Some(base) = self.workspace_base {
            config.workspace_base = base;
        }
        if let Some(limits) = self.limits {
            config.limits = limits;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Create sandbox with custom options
pub async fn create_sandbox_with_options(options: SandboxOptions) -> Result<PlotSandbox> {
    let prebuild = options.prebuild_image;
    let config = options.resolve()?;

    let engine = match &config.docker_path {
        Some(path) => DockerCli::with_path(path.clone())?,
        None => DockerCli::new()?,
    };
    info!("[SANDBOX] Using container engine {:?}", engine.docker_path());

    let sandbox = PlotSandbox::with_engine(config, Arc::new(engine))?;
    if prebuild {
        sandbox.ensure_image().await?;
    }
    Ok(sandbox)
}

/// Create default sandbox (non-interactive, image built lazily)
pub async fn create_default_sandbox() -> Result<PlotSandbox> {
    create_sandbox_with_options(SandboxOptions::default()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_override_config() {
        let limits = ResourceLimits {
            timeout_seconds: 3,
            ..Default::default()
        };
        let config = SandboxOptions {
            config: Some(SandboxConfig::default()),
            ..SandboxOptions::docker(PathBuf::from("/usr/local/bin/docker"))
        }
        .with_limits(limits)
        .with_workspace_base(PathBuf::from("/srv/plotbox"))
        .resolve()
        .unwrap();

        assert_eq!(config.limits.timeout_seconds, 3);
        assert_eq!(config.workspace_base, PathBuf::from("/srv/plotbox"));
        assert_eq!(
            config.docker_path,
            Some(PathBuf::from("/usr/local/bin/docker"))
        );
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let limits = ResourceLimits {
            memory_mb: 1,
            ..Default::default()
        };
        let options = SandboxOptions {
            config: Some(SandboxConfig::default()),
            ..Default::default()
        }
        .with_limits(limits);
        assert!(options.resolve().is_err());
    }
}
