use crate::{
    engine::{CapturedOutput, ContainerEngine, ContainerId, EngineCapabilities, LaunchSpec},
    errors::{Result, SandboxError},
};
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Size of the scratch tmpfs mounted at `/tmp`
const TMPFS_SPEC: &str = "/tmp:rw,noexec,nosuid,size=64m";

/// Docker driven through its command line client
pub struct DockerCli {
    docker_path: PathBuf,
}

impl DockerCli {
    /// Create an engine using `docker` from PATH
    pub fn new() -> Result<Self> {
        let docker_path = which::which("docker").map_err(|_| SandboxError::EngineNotFound)?;
        Ok(Self { docker_path })
    }

    /// Create with an explicit client binary
    pub fn with_path(docker_path: PathBuf) -> Result<Self> {
        if !docker_path.exists() {
            return Err(SandboxError::EngineNotFound);
        }
        Ok(Self { docker_path })
    }

    pub fn docker_path(&self) -> &Path {
        &self.docker_path
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.docker_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn output<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(args);
        debug!("[SANDBOX] Engine command: {:?}", cmd.as_std());
        cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::EngineNotFound
            } else {
                SandboxError::Engine(format!("failed to invoke docker: {e}"))
            }
        })
    }

    async fn checked<I, S>(&self, what: &str, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(SandboxError::Engine(format!(
                "docker {what} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

/// Arguments for `docker run`. Every value is a discrete argv slot; nothing
/// passes through a shell.
pub fn run_args(spec: &LaunchSpec) -> Vec<OsString> {
    let limits = &spec.limits;
    let mut args: Vec<OsString> = vec!["run".into(), "--detach".into()];

    args.push("--name".into());
    args.push(spec.name.clone().into());

    if limits.network_disabled {
        args.push("--network".into());
        args.push("none".into());
    }

    let memory = format!("{}m", limits.memory_mb);
    let log_size = format!("max-size={}", spec.max_log_bytes.max(1024));
    let cpus = limits.cpus.to_string();
    let pids = limits.max_processes.to_string();
    for arg in [
        "--memory",
        memory.as_str(),
        "--memory-swap",
        memory.as_str(),
        "--cpus",
        cpus.as_str(),
        "--pids-limit",
        pids.as_str(),
        "--cap-drop",
        "ALL",
        "--security-opt",
        "no-new-privileges",
        "--read-only",
        "--tmpfs",
        TMPFS_SPEC,
        "--user",
        spec.user.as_str(),
        "--log-driver",
        "json-file",
        "--log-opt",
        log_size.as_str(),
        "--log-opt",
        "max-file=1",
    ] {
        args.push(arg.into());
    }

    args.push("--volume".into());
    args.push(bind_mount(&spec.input_dir, crate::workspace::CONTAINER_INPUT_DIR, "ro"));
    args.push("--volume".into());
    args.push(bind_mount(&spec.output_dir, crate::workspace::CONTAINER_OUTPUT_DIR, "rw"));

    for (key, value) in &spec.env {
        args.push("--env".into());
        args.push(format!("{key}={value}").into());
    }
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}").into());
    }

    args.push(spec.image.clone().into());
    args.extend(spec.args.iter().map(OsString::from));
    args
}

fn bind_mount(host: &Path, container: &str, mode: &str) -> OsString {
    let mut mount = host.as_os_str().to_os_string();
    mount.push(":");
    mount.push(container);
    mount.push(":");
    mount.push(mode);
    mount
}

fn is_missing(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr);
    stderr.contains("No such container") || stderr.contains("No such image")
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let output = self
            .output(["image", "inspect", "--format", "{{.Id}}", reference])
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        if is_missing(&output.stderr) {
            return Ok(false);
        }
        Err(SandboxError::Engine(format!(
            "docker image inspect failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    async fn build_image(&self, reference: &str, context_dir: &Path) -> Result<()> {
        info!("[IMAGE] Building {}", reference);
        let args: Vec<OsString> = vec![
            "build".into(),
            "--quiet".into(),
            "--tag".into(),
            reference.into(),
            context_dir.as_os_str().to_os_string(),
        ];
        self.checked("build", args).await?;
        Ok(())
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<ContainerId> {
        let output = self.checked("run", run_args(spec)).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SandboxError::Engine("docker run printed no container id".into()))?;
        Ok(ContainerId(id.to_string()))
    }

    async fn wait(&self, id: &ContainerId) -> Result<i64> {
        let output = self.checked("wait", ["wait", id.0.as_str()]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| SandboxError::Engine(format!("unexpected docker wait output: {stdout}")))
    }

    async fn logs(&self, id: &ContainerId) -> Result<CapturedOutput> {
        let output = self.checked("logs", ["logs", id.0.as_str()]).await?;
        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn remove(&self, id: &ContainerId) -> Result<()> {
        // Kills the container if still running
        let output = self.output(["rm", "--force", id.0.as_str()]).await?;
        if output.status.success() || is_missing(&output.stderr) {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("[SANDBOX] docker rm {} failed: {}", id, stderr.trim());
        Err(SandboxError::Engine(format!("docker rm failed: {}", stderr.trim())))
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            name: "Docker CLI".to_string(),
            version: None,
            network_isolation: true,
            resource_limits: true,
            read_only_rootfs: true,
        }
    }
}
