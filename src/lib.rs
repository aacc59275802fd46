//! Validation and sandboxed execution of generated plotting scripts.
//!
//! ```rust,ignore
//! use plotbox::{PlotSandbox, SandboxConfig};
//!
//! let sandbox = PlotSandbox::new(SandboxConfig::from_env()?)?;
//! let artifact = sandbox
//!     .run("df.plot()\nplt.savefig(output_path)", Some(csv_bytes))
//!     .await?;
//! assert_eq!(artifact.content_type, "image/png");
//! ```

pub mod analyzer;
pub mod artifact;
pub mod config;
pub mod docker;
pub mod engine;
pub mod errors;
pub mod image;
pub mod job;
pub mod runner;
pub mod sandbox_builder;
pub mod workspace;

pub use analyzer::{Rejection, Script, StaticValidator, ValidationVerdict, Violation};
pub use artifact::Artifact;
pub use config::{ResourceLimits, SandboxConfig};
pub use docker::DockerCli;
pub use engine::{ContainerEngine, EngineCapabilities};
pub use errors::{Outcome, Result, SandboxError};
pub use image::{ImageDefinition, ImageHandle, ImageManager};
pub use job::{Job, JobId, JobReport, JobState};
pub use runner::JobRunner;
pub use sandbox_builder::{create_default_sandbox, create_sandbox_with_options, SandboxOptions};

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

/// The pipeline: validator, image cache and job runner behind two entry points
pub struct PlotSandbox {
    validator: StaticValidator,
    images: ImageManager,
    definition: ImageDefinition,
    runner: Arc<JobRunner>,
    engine: Arc<dyn ContainerEngine>,
    config: Arc<SandboxConfig>,
    permits: Arc<Semaphore>,
}

impl PlotSandbox {
    /// Create a sandbox backed by the Docker CLI
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let engine = match &config.docker_path {
            Some(path) => DockerCli::with_path(path.clone())?,
            None => DockerCli::new()?,
        };
        Self::with_engine(config, Arc::new(engine))
    }

    /// Create a sandbox on any container engine
    pub fn with_engine(config: SandboxConfig, engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        config.validate()?;
        let definition = ImageDefinition::bundled(config.image_repository.clone());
        let config = Arc::new(config);
        Ok(Self {
            validator: StaticValidator::new(),
            images: ImageManager::new(engine.clone(), config.build_timeout()),
            definition,
            runner: Arc::new(JobRunner::new(engine.clone(), config.clone())),
            engine,
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
        })
    }

    /// Replace the bundled image definition
    pub fn with_definition(mut self, definition: ImageDefinition) -> Self {
        self.definition = definition;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.engine.capabilities()
    }

    /// Screen the user's prompt before it reaches the text generator
    pub fn screen_prompt(&self, prompt: &str) -> ValidationVerdict {
        self.validator.screen_prompt(prompt)
    }

    pub fn validate(&self, script: &str) -> ValidationVerdict {
        self.validator.validate(&Script::new(script), false)
    }

    pub async fn ensure_image(&self) -> Result<ImageHandle> {
        self.images.ensure_image(&self.definition).await
    }

    /// Drop the cached image outcome, e.g. after fixing a failed build
    pub fn invalidate_image(&self) -> bool {
        self.images.invalidate(&self.definition)
    }

    /// Validate, then execute in a fresh container and return the artifact
    pub async fn run(&self, script: &str, dataset: Option<Vec<u8>>) -> Result<Artifact> {
        self.run_with_report(script, dataset).await.0
    }

    /// Like [`PlotSandbox::run`], plus the internal report when a job was created
    pub async fn run_with_report(
        &self,
        script: &str,
        dataset: Option<Vec<u8>>,
    ) -> (Result<Artifact>, Option<JobReport>) {
        let script = Script::new(script);
        if let ValidationVerdict::Rejected(rejection) =
            self.validator.validate(&script, dataset.is_some())
        {
            return (Err(SandboxError::ValidationRejected(rejection.reason)), None);
        }

        let image = match self.ensure_image().await {
            Ok(image) => image,
            Err(e) => return (Err(e), None),
        };

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return (
                    Err(SandboxError::InternalError("job queue closed".into())),
                    None,
                )
            }
        };

        let job = Job::new(script, dataset, self.config.limits.clone());
        info!("[JOB] {} created", job.id());

        // Owned by its own task: abandoning this future does not abandon the job.
        let runner = self.runner.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            runner.run(job, &image).await
        });

        match task.await {
            Ok((result, report)) => (result, Some(report)),
            Err(e) => (
                Err(SandboxError::InternalError(format!("job task failed: {e}"))),
                None,
            ),
        }
    }
}
