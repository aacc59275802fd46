use anyhow::Context;
use base64::Engine as _;
use plotbox::{PlotSandbox, SandboxConfig, SandboxError, ValidationVerdict};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Default, Clone, PartialEq)]
struct WorkerArgs {
    config_path: Option<PathBuf>,
    workspace_base: Option<PathBuf>,
    docker_path: Option<PathBuf>,
}

impl WorkerArgs {
    fn parse(args: &[String]) -> Self {
        let mut parsed = Self::default();
        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).map(PathBuf::from);
            match args[i].as_str() {
                "--config" => {
                    parsed.config_path = value;
                    i += 2;
                }
                "--workspace-base" => {
                    parsed.workspace_base = value;
                    i += 2;
                }
                "--docker" => {
                    parsed.docker_path = value;
                    i += 2;
                }
                _ => i += 1,
            }
        }
        parsed
    }

    /// Defaults, config file, `PLOTBOX_*` env, then these flags
    fn into_config(self) -> anyhow::Result<SandboxConfig> {
        let file = self
            .config_path
            .or_else(|| std::env::var("PLOTBOX_CONFIG").ok().map(PathBuf::from));
        let base = match &file {
            Some(path) => SandboxConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => SandboxConfig::default(),
        };
        let mut config = base.with_env_overrides()?;
        if let Some(base) = self.workspace_base {
            config.workspace_base = base;
        }
        if let Some(docker) = self.docker_path {
            config.docker_path = Some(docker);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "plotbox_worker=info,plotbox=info".to_string()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = WorkerArgs::parse(&args).into_config()?;
    tracing::info!(
        "plotbox-worker starting (workspace_base={:?})",
        config.workspace_base
    );
    let sandbox = Arc::new(PlotSandbox::new(config).context("starting sandbox")?);

    let (tx, mut rx) = mpsc::channel::<Value>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(resp) = rx.recv().await {
            let line = serde_json::to_string(&resp)?;
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("invalid json-rpc line ({} bytes): {}", line.len(), e);
                continue;
            }
        };

        let method = parsed.get("method").and_then(|m| m.as_str()).unwrap_or("");
        if method == "exit" || method == "shutdown" {
            if let Some(id) = parsed.get("id").cloned() {
                tx.send(json!({ "jsonrpc": "2.0", "result": null, "id": id }))
                    .await?;
            }
            break;
        }

        // Each request runs on its own task; responses carry the request id.
        let sandbox = sandbox.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(resp) = handle_message(&sandbox, parsed).await {
                let _ = tx.send(resp).await;
            }
        });
    }

    drop(tx);
    writer.await??;
    Ok(())
}

async fn handle_message(sandbox: &PlotSandbox, msg: Value) -> Option<Value> {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    // Notifications have no id
    let id = msg.get("id").cloned()?;
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    let result = match method {
        "initialize" => Ok(json!({
            "serverInfo": {
                "name": "plotbox-worker",
                "version": env!("CARGO_PKG_VERSION")
            },
            "methods": [
                "health", "screen_prompt", "validate", "ensure_image",
                "invalidate_image", "run", "shutdown"
            ]
        })),
        "health" => Ok(json!({
            "ok": true,
            "worker": "plotbox-worker",
            "version": env!("CARGO_PKG_VERSION"),
            "engine": sandbox.capabilities(),
            "limits": sandbox.config().limits,
        })),
        "screen_prompt" => string_param(&params, "prompt")
            .map(|prompt| verdict_json(&sandbox.screen_prompt(prompt))),
        "validate" => string_param(&params, "code").map(|code| verdict_json(&sandbox.validate(code))),
        "ensure_image" => sandbox
            .ensure_image()
            .await
            .map(|handle| json!(handle))
            .map_err(|e| error_json(&e)),
        "invalidate_image" => Ok(json!({ "invalidated": sandbox.invalidate_image() })),
        "run" => run_call(sandbox, &params).await,
        _ => Err(json!({
            "code": -32601,
            "message": format!("Method not found: {}", method)
        })),
    };

    Some(match result {
        Ok(v) => json!({ "jsonrpc": "2.0", "result": v, "id": id }),
        Err(err_obj) => json!({ "jsonrpc": "2.0", "error": err_obj, "id": id }),
    })
}

fn string_param<'a>(params: &'a Value, name: &str) -> Result<&'a str, Value> {
    params.get(name).and_then(|v| v.as_str()).ok_or_else(|| {
        json!({ "code": -32602, "message": format!("Missing required argument: {name}") })
    })
}

fn verdict_json(verdict: &ValidationVerdict) -> Value {
    json!({
        "accepted": verdict.is_accepted(),
        "reason": verdict.violation().map(|v| v.code()),
    })
}

/// Generic message plus classification; details stay in the logs
fn error_json(err: &SandboxError) -> Value {
    let code = if err.is_service_fault() { -32001 } else { -32000 };
    json!({
        "code": code,
        "message": err.public_message(),
        "data": {
            "outcome": err.outcome(),
            "reason": err.reason_code(),
        }
    })
}

async fn run_call(sandbox: &PlotSandbox, params: &Value) -> Result<Value, Value> {
    let code = string_param(params, "code")?;
    let dataset = match params.get("dataset_base64").and_then(|v| v.as_str()) {
        Some(encoded) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| json!({ "code": -32602, "message": "dataset_base64 is not valid base64" }))?,
        ),
        None => None,
    };

    let (result, report) = sandbox.run_with_report(code, dataset).await;
    let job_id = report.as_ref().map(|r| r.job_id);
    match result {
        Ok(artifact) => Ok(json!({
            "content_type": artifact.content_type,
            "artifact_base64": base64::engine::general_purpose::STANDARD.encode(&artifact.bytes),
            "job_id": job_id,
        })),
        Err(e) => {
            let mut err = error_json(&e);
            err["data"]["job_id"] = json!(job_id);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plotbox::engine::{CapturedOutput, ContainerId, EngineCapabilities, LaunchSpec};
    use plotbox::ContainerEngine;
    use std::path::Path;

    struct Offline;

    #[async_trait]
    impl ContainerEngine for Offline {
        async fn image_exists(&self, _reference: &str) -> plotbox::Result<bool> {
            Err(SandboxError::EngineNotFound)
        }
        async fn build_image(&self, _reference: &str, _context: &Path) -> plotbox::Result<()> {
            Err(SandboxError::EngineNotFound)
        }
        async fn start(&self, _spec: &LaunchSpec) -> plotbox::Result<ContainerId> {
            Err(SandboxError::EngineNotFound)
        }
        async fn wait(&self, _id: &ContainerId) -> plotbox::Result<i64> {
            Err(SandboxError::EngineNotFound)
        }
        async fn logs(&self, _id: &ContainerId) -> plotbox::Result<CapturedOutput> {
            Err(SandboxError::EngineNotFound)
        }
        async fn remove(&self, _id: &ContainerId) -> plotbox::Result<()> {
            Ok(())
        }
        fn capabilities(&self) -> EngineCapabilities {
            EngineCapabilities {
                name: "offline".into(),
                version: None,
                network_isolation: false,
                resource_limits: false,
                read_only_rootfs: false,
            }
        }
    }

    fn sandbox() -> PlotSandbox {
        PlotSandbox::with_engine(SandboxConfig::default(), Arc::new(Offline)).unwrap()
    }

    #[test]
    fn test_parse_args() {
        let args: Vec<String> = ["plotbox-worker", "--docker", "/opt/docker", "--verbose"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = WorkerArgs::parse(&args);
        assert_eq!(parsed.docker_path, Some(PathBuf::from("/opt/docker")));
        assert_eq!(parsed.config_path, None);
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let resp = handle_message(&sandbox(), json!({ "method": "health" })).await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn test_validate_reports_reason_code() {
        let resp = handle_message(
            &sandbox(),
            json!({ "id": 7, "method": "validate", "params": { "code": "import socket" } }),
        )
        .await
        .unwrap();
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["result"]["accepted"], false);
        assert_eq!(resp["result"]["reason"], "disallowed_import");
    }

    #[tokio::test]
    async fn test_rejected_run_never_echoes_code() {
        let resp = handle_message(
            &sandbox(),
            json!({ "id": 1, "method": "run", "params": { "code": "os.system('rm -rf /')" } }),
        )
        .await
        .unwrap();
        let text = resp.to_string();
        assert!(!text.contains("rm -rf"));
        assert_eq!(resp["error"]["data"]["outcome"], "rejected");
        assert!(resp["error"]["data"]["job_id"].is_null());
    }

    #[tokio::test]
    async fn test_engine_outage_is_a_service_fault() {
        let resp = handle_message(
            &sandbox(),
            json!({ "id": 2, "method": "run", "params": { "code": "plt.plot([1, 2])" } }),
        )
        .await
        .unwrap();
        assert_eq!(resp["error"]["code"], -32001);
        assert_eq!(resp["error"]["data"]["reason"], "image_build_failure");
    }

    #[tokio::test]
    async fn test_bad_base64_is_invalid_params() {
        let resp = handle_message(
            &sandbox(),
            json!({ "id": 3, "method": "run", "params": { "code": "x = 1", "dataset_base64": "%%%" } }),
        )
        .await
        .unwrap();
        assert_eq!(resp["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let resp = handle_message(&sandbox(), json!({ "id": 4, "method": "tools/list" }))
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], -32601);
    }
}
