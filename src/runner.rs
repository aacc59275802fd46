use crate::{
    artifact::{self, Artifact},
    config::SandboxConfig,
    engine::{CapturedOutput, ContainerEngine, ContainerId, LaunchSpec},
    errors::{Result, SandboxError},
    image::ImageHandle,
    job::{Job, JobReport, JobState},
    workspace::{
        IsolatedWorkspace, ARTIFACT_FILE, CONTAINER_INPUT_DIR, CONTAINER_OUTPUT_DIR, DATASET_FILE,
        SCRIPT_FILE,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Drives one [`Job`] through its lifecycle and always ends in `Cleaned`
pub struct JobRunner {
    engine: Arc<dyn ContainerEngine>,
    config: Arc<SandboxConfig>,
}

/// Per-run resources and diagnostics, released by [`JobRunner::run`]
#[derive(Default)]
struct Execution {
    workspace: Option<IsolatedWorkspace>,
    container: Option<ContainerGuard>,
    exit_code: Option<i64>,
    output: CapturedOutput,
}

impl JobRunner {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: Arc<SandboxConfig>) -> Self {
        Self { engine, config }
    }

    /// Execute `job` in `image`. The report is for internal logging only.
    pub async fn run(&self, mut job: Job, image: &ImageHandle) -> (Result<Artifact>, JobReport) {
        let mut exec = Execution::default();
        let result = self.drive(&mut job, image, &mut exec).await;

        // Artifact bytes are already in memory; nothing below may change `result`.
        let mut cleanup_errors = Vec::new();
        if let Some(container) = exec.container.take() {
            if let Err(e) = container.remove(self.config.cleanup_grace()).await {
                cleanup_errors.push(e.to_string());
            }
        }
        if let Some(mut workspace) = exec.workspace.take() {
            if let Err(e) = workspace.remove() {
                cleanup_errors.push(format!("workspace: {e}"));
            }
        }
        for e in &cleanup_errors {
            warn!("[SANDBOX] Cleanup of job {} failed: {}", job.id(), e);
        }
        job.mark_cleaned();

        let report = JobReport {
            job_id: job.id(),
            outcome: job.outcome(),
            history: job.history().to_vec(),
            exit_code: exec.exit_code,
            stderr_tail: exec.output.stderr,
            elapsed_ms: job.elapsed().as_millis(),
            cleanup_errors,
        };
        match &result {
            Ok(artifact) => info!(
                "[JOB] {} completed in {}ms ({} bytes)",
                report.job_id,
                report.elapsed_ms,
                artifact.len()
            ),
            Err(e) => warn!(
                "[JOB] {} ended {:?} ({}) exit={:?} stderr={}",
                report.job_id,
                report.outcome,
                e,
                report.exit_code,
                report.stderr_tail.trim()
            ),
        }
        (result, report)
    }

    async fn drive(
        &self,
        job: &mut Job,
        image: &ImageHandle,
        exec: &mut Execution,
    ) -> Result<Artifact> {
        let workspace = self.prepare(job)?;
        let spec = self.launch_spec(job, image, &workspace);
        exec.workspace = Some(workspace);
        job.transition(JobState::Prepared)?;

        let timeout = job.limits().timeout();
        let launched = match tokio::time::timeout(timeout, self.engine.start(&spec)).await {
            Ok(launched) => launched,
            Err(_) => Err(SandboxError::Engine(format!(
                "launch did not return within {timeout:?}"
            ))),
        };
        let id = match launched {
            Ok(id) => id,
            Err(e) => {
                error!("[SANDBOX] Failed to launch job {}: {}", job.id(), e);
                job.transition(JobState::Failed)?;
                // A container may have been created before the start failed
                exec.container = Some(ContainerGuard::new(
                    self.engine.clone(),
                    ContainerId(spec.name.clone()),
                ));
                return Err(e);
            }
        };
        exec.container = Some(ContainerGuard::new(self.engine.clone(), id.clone()));
        job.transition(JobState::Running)?;
        info!("[SANDBOX] Job {} running in container {}", job.id(), id);

        let waited = tokio::time::timeout(timeout, self.engine.wait(&id)).await;
        let engine_error = match waited {
            Ok(Ok(0)) => {
                exec.exit_code = Some(0);
                job.transition(JobState::Completed)?;
                None
            }
            Ok(Ok(code)) => {
                exec.exit_code = Some(code);
                job.transition(JobState::Failed)?;
                None
            }
            Ok(Err(e)) => {
                job.transition(JobState::Failed)?;
                Some(e)
            }
            Err(_) => {
                warn!("[SANDBOX] Job {} exceeded {:?}", job.id(), timeout);
                job.transition(JobState::TimedOut)?;
                None
            }
        };

        exec.output = self.collect_logs(&id).await;

        if let Some(e) = engine_error {
            return Err(e);
        }
        match job.state() {
            JobState::Completed => {
                let workspace = exec
                    .workspace
                    .as_ref()
                    .ok_or_else(|| SandboxError::InternalError("workspace missing".into()))?;
                artifact::retrieve(
                    workspace,
                    JobState::Completed,
                    self.config.max_artifact_bytes,
                    &exec.output.stderr,
                )
            }
            JobState::TimedOut => Err(SandboxError::JobTimedOut),
            _ => Err(SandboxError::JobFailed {
                exit_code: exec.exit_code,
            }),
        }
    }

    fn prepare(&self, job: &Job) -> Result<IsolatedWorkspace> {
        let workspace = IsolatedWorkspace::create(&self.config.workspace_base, job.id())
            .map_err(SandboxError::Workspace)?;
        workspace
            .write_script(job.script().as_str())
            .map_err(SandboxError::Workspace)?;
        workspace
            .write_dataset(job.dataset())
            .map_err(SandboxError::Workspace)?;
        Ok(workspace)
    }

    fn launch_spec(&self, job: &Job, image: &ImageHandle, workspace: &IsolatedWorkspace) -> LaunchSpec {
        let threads = job.limits().max_threads.to_string();
        let fallback = if self.config.fallback_save { "1" } else { "0" };
        LaunchSpec {
            name: format!("plotbox-{}", job.id()),
            image: image.reference.clone(),
            input_dir: workspace.input_dir(),
            output_dir: workspace.output_dir(),
            args: vec![
                format!("{CONTAINER_INPUT_DIR}/{SCRIPT_FILE}"),
                format!("{CONTAINER_INPUT_DIR}/{DATASET_FILE}"),
                format!("{CONTAINER_OUTPUT_DIR}/{ARTIFACT_FILE}"),
            ],
            limits: job.limits().clone(),
            env: vec![
                ("MPLCONFIGDIR".to_string(), "/tmp".to_string()),
                ("OMP_NUM_THREADS".to_string(), threads.clone()),
                ("OPENBLAS_NUM_THREADS".to_string(), threads.clone()),
                ("MKL_NUM_THREADS".to_string(), threads),
                ("PLOTBOX_FALLBACK_SAVE".to_string(), fallback.to_string()),
            ],
            user: self.config.container_user.clone(),
            max_log_bytes: self.config.max_log_bytes,
            labels: vec![("plotbox.job".to_string(), job.id().to_string())],
        }
    }

    async fn collect_logs(&self, id: &ContainerId) -> CapturedOutput {
        match tokio::time::timeout(self.config.cleanup_grace(), self.engine.logs(id)).await {
            Ok(Ok(output)) => output.truncated(self.config.max_log_bytes),
            Ok(Err(e)) => {
                warn!("[SANDBOX] Could not collect logs for {}: {}", id, e);
                CapturedOutput::default()
            }
            Err(_) => {
                warn!("[SANDBOX] Collecting logs for {} timed out", id);
                CapturedOutput::default()
            }
        }
    }
}

/// Removes the container on every path out of the runner, including panics
struct ContainerGuard {
    engine: Arc<dyn ContainerEngine>,
    id: Option<ContainerId>,
}

impl ContainerGuard {
    fn new(engine: Arc<dyn ContainerEngine>, id: ContainerId) -> Self {
        Self {
            engine,
            id: Some(id),
        }
    }

    async fn remove(mut self, grace: Duration) -> Result<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        match tokio::time::timeout(grace, self.engine.remove(&id)).await {
            Ok(removed) => removed,
            Err(_) => Err(SandboxError::Engine(format!(
                "removing container {id} exceeded {grace:?}"
            ))),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = self.engine.clone();
                handle.spawn(async move {
                    if let Err(e) = engine.remove(&id).await {
                        warn!("[SANDBOX] Deferred removal of {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => warn!("[SANDBOX] Container {} leaked: no runtime to remove it", id),
        }
    }
}
