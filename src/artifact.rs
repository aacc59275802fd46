use crate::{
    errors::{Result, SandboxError},
    job::JobState,
    workspace::{IsolatedWorkspace, ARTIFACT_FILE},
};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

/// Rendered output copied out of a job's workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

impl Artifact {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Read the expected artifact out of the output region.
///
/// Must run after the job reached a terminal state and before the workspace
/// is removed.
pub fn retrieve(
    workspace: &IsolatedWorkspace,
    terminal_state: JobState,
    max_bytes: u64,
    stderr_tail: &str,
) -> Result<Artifact> {
    let missing = |why: &str| {
        warn!(
            "[SANDBOX] No artifact ({}) after {:?}; stderr tail: {}",
            why,
            terminal_state,
            stderr_tail.trim()
        );
        SandboxError::NoArtifact { terminal_state }
    };

    if !terminal_state.is_outcome() {
        return Err(missing("job has not terminated"));
    }

    let path = workspace.artifact_path();
    let bytes = match read_regular_file(&path, max_bytes) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Err(missing("not a regular file or too large")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(missing("output path empty"))
        }
        Err(e) => {
            warn!("[SANDBOX] Failed to read artifact {:?}: {}", path, e);
            return Err(missing("unreadable"));
        }
    };

    if bytes.is_empty() {
        return Err(missing("zero-length file"));
    }

    let extra = unexpected_outputs(workspace);
    if !extra.is_empty() {
        warn!("[SANDBOX] Ignoring extra outputs: {:?}", extra);
    }

    let content_type = sniff_content_type(&bytes);
    info!(
        "[SANDBOX] Retrieved artifact: {} bytes ({})",
        bytes.len(),
        content_type
    );
    Ok(Artifact {
        bytes,
        content_type,
    })
}

/// Files in the output region other than the artifact. Never returned to callers.
fn unexpected_outputs(workspace: &IsolatedWorkspace) -> Vec<String> {
    match workspace.list_outputs() {
        Ok(mut names) => {
            names.retain(|name| name != ARTIFACT_FILE);
            names.sort();
            names
        }
        Err(e) => {
            warn!("[SANDBOX] Could not list outputs: {}", e);
            Vec::new()
        }
    }
}

/// `Ok(None)` for symlinks, non-regular files and files over `max_bytes`
fn read_regular_file(path: &Path, max_bytes: u64) -> std::io::Result<Option<Vec<u8>>> {
    let link_meta = std::fs::symlink_metadata(path)?;
    if !link_meta.file_type().is_file() {
        return Ok(None);
    }

    let file = open_no_follow(path)?;
    let meta = file.metadata()?;
    if !meta.is_file() || meta.len() > max_bytes {
        return Ok(None);
    }

    let mut bytes = Vec::with_capacity(meta.len() as usize);
    file.take(max_bytes + 1).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > max_bytes {
        return Ok(None);
    }
    Ok(Some(bytes))
}

#[cfg(unix)]
fn open_no_follow(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_no_follow(path: &Path) -> std::io::Result<File> {
    File::open(path)
}

pub fn sniff_content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"%PDF") {
        "application/pdf"
    } else if looks_like_svg(bytes) {
        "image/svg+xml"
    } else {
        "application/octet-stream"
    }
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start();
    (text.starts_with("<?xml") || text.starts_with("<svg")) && text.contains("<svg")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn workspace() -> (tempfile::TempDir, IsolatedWorkspace) {
        let base = tempfile::tempdir().unwrap();
        let ws = IsolatedWorkspace::create(base.path(), JobId::new()).unwrap();
        (base, ws)
    }

    #[test]
    fn test_reads_png() {
        let (_base, ws) = workspace();
        std::fs::write(ws.artifact_path(), PNG).unwrap();
        let artifact = retrieve(&ws, JobState::Completed, 1024, "").unwrap();
        assert_eq!(artifact.content_type, "image/png");
        assert_eq!(artifact.bytes, PNG);
    }

    #[test]
    fn test_extra_outputs_are_not_returned() {
        let (_base, ws) = workspace();
        std::fs::write(ws.artifact_path(), PNG).unwrap();
        std::fs::write(ws.output_dir().join("dump.csv"), b"a,b").unwrap();
        std::fs::write(ws.output_dir().join("b.txt"), b"x").unwrap();

        assert_eq!(unexpected_outputs(&ws), vec!["b.txt", "dump.csv"]);
        let artifact = retrieve(&ws, JobState::Completed, 1024, "").unwrap();
        assert_eq!(artifact.bytes, PNG);
    }

    #[test]
    fn test_missing_artifact_reports_terminal_state() {
        let (_base, ws) = workspace();
        let err = retrieve(&ws, JobState::Completed, 1024, "Traceback ...").unwrap_err();
        assert!(matches!(
            err,
            SandboxError::NoArtifact {
                terminal_state: JobState::Completed
            }
        ));
    }

    #[test]
    fn test_empty_and_oversize_files_rejected() {
        let (_base, ws) = workspace();
        std::fs::write(ws.artifact_path(), b"").unwrap();
        assert!(retrieve(&ws, JobState::Completed, 1024, "").is_err());

        std::fs::write(ws.artifact_path(), vec![0u8; 2048]).unwrap();
        assert!(retrieve(&ws, JobState::Completed, 1024, "").is_err());
    }

    #[test]
    fn test_not_before_termination() {
        let (_base, ws) = workspace();
        std::fs::write(ws.artifact_path(), PNG).unwrap();
        assert!(retrieve(&ws, JobState::Running, 1024, "").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_is_refused() {
        let (base, ws) = workspace();
        let secret = base.path().join("secret.png");
        std::fs::write(&secret, PNG).unwrap();
        std::os::unix::fs::symlink(&secret, ws.artifact_path()).unwrap();

        assert!(retrieve(&ws, JobState::Completed, 1024, "").is_err());
    }

    #[test]
    fn test_sniffing() {
        assert_eq!(sniff_content_type(b"\xFF\xD8\xFF\xE0"), "image/jpeg");
        assert_eq!(sniff_content_type(b"%PDF-1.4"), "application/pdf");
        assert_eq!(
            sniff_content_type(b"  <?xml version=\"1.0\"?>\n<svg xmlns=\"\"/>"),
            "image/svg+xml"
        );
        assert_eq!(sniff_content_type(b"hello"), "application/octet-stream");
    }
}
