use crate::job::JobId;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const SCRIPT_FILE: &str = "script.py";
pub const DATASET_FILE: &str = "data.csv";
pub const ARTIFACT_FILE: &str = "plot.png";

/// Where the two regions appear inside the container
pub const CONTAINER_INPUT_DIR: &str = "/sandbox/input";
pub const CONTAINER_OUTPUT_DIR: &str = "/sandbox/output";

/// Per-job directory with a read-only input region and a writable output region
pub struct IsolatedWorkspace {
    /// Path to the workspace directory
    pub path: PathBuf,
    removed: bool,
}

impl IsolatedWorkspace {
    /// Create `<base>/<job-id>/{input,output}`. Fails if the job directory already exists.
    pub fn create(base: &Path, job_id: JobId) -> io::Result<Self> {
        std::fs::create_dir_all(base)?;
        let path = base.join(job_id.to_string());
        std::fs::create_dir(&path)?;

        let workspace = Self {
            path,
            removed: false,
        };
        std::fs::create_dir(workspace.input_dir())?;
        std::fs::create_dir(workspace.output_dir())?;

        // The container runs as an unprivileged uid that must traverse input
        // and write output, regardless of the host user owning the files.
        set_mode(&workspace.path, 0o755)?;
        set_mode(&workspace.input_dir(), 0o755)?;
        set_mode(&workspace.output_dir(), 0o777)?;

        info!("[SANDBOX] Created workspace: {:?}", workspace.path);
        Ok(workspace)
    }

    pub fn input_dir(&self) -> PathBuf {
        self.path.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.path.join("output")
    }

    pub fn script_path(&self) -> PathBuf {
        self.input_dir().join(SCRIPT_FILE)
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.input_dir().join(DATASET_FILE)
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir().join(ARTIFACT_FILE)
    }

    pub fn write_script(&self, source: &str) -> io::Result<PathBuf> {
        let dest = self.script_path();
        std::fs::write(&dest, source)?;
        set_mode(&dest, 0o644)?;
        Ok(dest)
    }

    /// Write the dataset, or an empty placeholder so the path always exists
    pub fn write_dataset(&self, dataset: Option<&[u8]>) -> io::Result<PathBuf> {
        let dest = self.dataset_path();
        std::fs::write(&dest, dataset.unwrap_or_default())?;
        set_mode(&dest, 0o644)?;
        Ok(dest)
    }

    /// List all files in the output directory
    pub fn list_outputs(&self) -> io::Result<Vec<String>> {
        let mut outputs = Vec::new();
        for entry in std::fs::read_dir(self.output_dir())? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                outputs.push(name.to_string());
            }
        }
        Ok(outputs)
    }

    /// Delete both regions. Safe to call repeatedly.
    pub fn remove(&mut self) -> io::Result<()> {
        if self.removed {
            return Ok(());
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.removed = true;
        info!("[SANDBOX] Cleaned up workspace: {:?}", self.path);
        Ok(())
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(
                    "[SANDBOX] Failed to cleanup workspace {:?}: {}",
                    self.path, e
                );
            }
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
