use crate::{
    engine::ContainerEngine,
    errors::{Result, SandboxError},
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{error, info};

const DOCKERFILE: &str = include_str!("../sandbox/Dockerfile");
const ENTRY_SCRIPT: &str = include_str!("../sandbox/entry.py");

/// Number of identity hex digits used as the image tag
const TAG_LEN: usize = 12;

/// Version-controlled definition of the sandbox image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDefinition {
    pub repository: String,
    pub dockerfile: String,
    pub entry_script: String,
}

impl ImageDefinition {
    /// The definition shipped in `sandbox/`
    pub fn bundled(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            dockerfile: DOCKERFILE.to_string(),
            entry_script: ENTRY_SCRIPT.to_string(),
        }
    }

    /// SHA-256 over everything that ends up in the build context
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"Dockerfile\0");
        hasher.update(self.dockerfile.as_bytes());
        hasher.update(b"\0entry.py\0");
        hasher.update(self.entry_script.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn reference(&self) -> String {
        let identity = self.identity();
        format!("{}:{}", self.repository, &identity[..TAG_LEN])
    }
}

/// A ready-to-run image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageHandle {
    pub reference: String,
    pub identity: String,
    /// True when this process built it, false when it was already present
    pub built: bool,
}

type BuildCell = Arc<OnceCell<std::result::Result<ImageHandle, String>>>;

/// Process-wide image cache with one in-flight build per identity.
///
/// Outcomes, including failures, stay cached until [`ImageManager::invalidate`].
pub struct ImageManager {
    engine: Arc<dyn ContainerEngine>,
    build_timeout: Duration,
    builds: Mutex<HashMap<String, BuildCell>>,
}

impl ImageManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, build_timeout: Duration) -> Self {
        Self {
            engine,
            build_timeout,
            builds: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ensure_image(&self, definition: &ImageDefinition) -> Result<ImageHandle> {
        let identity = definition.identity();
        let cell = {
            let mut builds = self.builds.lock().unwrap_or_else(|e| e.into_inner());
            builds.entry(identity.clone()).or_default().clone()
        };

        if let Some(outcome) = cell.get() {
            return outcome.clone().map_err(SandboxError::ImageBuildFailure);
        }

        // The build owns its task; a caller that stops waiting leaves it running
        let engine = self.engine.clone();
        let build_timeout = self.build_timeout;
        let definition = definition.clone();
        let outcome = tokio::spawn(async move {
            cell.get_or_init(move || build_if_missing(engine, build_timeout, definition, identity))
                .await
                .clone()
        })
        .await
        .unwrap_or_else(|e| Err(format!("build task failed: {e}")));
        outcome.map_err(SandboxError::ImageBuildFailure)
    }

    /// Forget the cached outcome for this definition so the next call checks again.
    /// Returns whether anything was cached.
    pub fn invalidate(&self, definition: &ImageDefinition) -> bool {
        let mut builds = self.builds.lock().unwrap_or_else(|e| e.into_inner());
        let removed = builds.remove(&definition.identity()).is_some();
        if removed {
            info!("[IMAGE] Invalidated {}", definition.reference());
        }
        removed
    }
}

async fn build_if_missing(
    engine: Arc<dyn ContainerEngine>,
    build_timeout: Duration,
    definition: ImageDefinition,
    identity: String,
) -> std::result::Result<ImageHandle, String> {
    let reference = format!("{}:{}", definition.repository, &identity[..TAG_LEN]);

    let exists = engine
        .image_exists(&reference)
        .await
        .map_err(|e| e.to_string())?;
    if exists {
        info!("[IMAGE] Reusing {}", reference);
        return Ok(ImageHandle {
            reference,
            identity,
            built: false,
        });
    }

    let context = tempfile::Builder::new()
        .prefix("plotbox-image-")
        .tempdir()
        .map_err(|e| format!("build context: {e}"))?;
    std::fs::write(context.path().join("Dockerfile"), &definition.dockerfile)
        .map_err(|e| format!("build context: {e}"))?;
    std::fs::write(context.path().join("entry.py"), &definition.entry_script)
        .map_err(|e| format!("build context: {e}"))?;

    info!("[IMAGE] Building {} (first use)", reference);
    let built = tokio::time::timeout(
        build_timeout,
        engine.build_image(&reference, context.path()),
    )
    .await;

    match built {
        Ok(Ok(())) => {
            info!("[IMAGE] Built {}", reference);
            Ok(ImageHandle {
                reference,
                identity,
                built: true,
            })
        }
        Ok(Err(e)) => {
            error!("[IMAGE] Build of {} failed: {}", reference, e);
            Err(e.to_string())
        }
        Err(_) => {
            error!(
                "[IMAGE] Build of {} exceeded {:?}",
                reference, build_timeout
            );
            Err(format!("build exceeded {:?}", build_timeout))
        }
    }
}
