//! `cadenza run`: the JSON-lines job console.
//!
//! Each stdin line is one request:
//!
//! ```text
//! {"job_type": "context_request_add", "kwargs": {"content": "sing"}}
//! {"cancel": "<job id>", "reason": "changed my mind"}
//! ```
//!
//! Every request is answered with one JSON line, and every job event is
//! written to stdout in its wire form as it is broadcast.

use cadenza_config::AppConfig;
use cadenza_jobs::{JobId, Runtime};
use cadenza_operations::BackendTable;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Request {
    Create {
        job_type: String,
        #[serde(default)]
        kwargs: Value,
    },
    Cancel {
        cancel: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

fn emit(line: &Value) {
    println!("{line}");
}

fn rejection(kind: &str, reason: impl std::fmt::Display) -> Value {
    json!({ "error": kind, "reason": reason.to_string() })
}

/// Answer one console line.
fn handle_line(runtime: &Runtime, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return rejection("invalid_request", e),
    };
    match request {
        Request::Create { job_type, kwargs } => match runtime.create_job(&job_type, kwargs) {
            Ok(id) => json!({ "job_id": id }),
            Err(e) => rejection(e.kind(), e),
        },
        Request::Cancel { cancel, reason } => {
            let id = JobId::from(cancel.as_str());
            match runtime.cancel_job(&id, reason.as_deref()) {
                Ok(()) => json!({ "cancelled": id }),
                Err(e) => rejection(e.kind(), e),
            }
        }
    }
}

pub async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Runtime::start(config, BackendTable::with_builtins()).await?;

    let (_, mut events) = runtime.bus().subscribe_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            emit(&event.wire_payload());
        }
    });

    info!("Reading jobs from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => emit(&handle_line(&runtime, &line)),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let stopped = runtime.stop().await;
    if let Err(e) = printer.await {
        warn!(error = %e, "Event printer ended abnormally");
    }
    stopped?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_config::PrompterConfig;

    async fn runtime() -> (Runtime, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let config = AppConfig {
            config_dir: dir.path().join("configs"),
            prompter: PrompterConfig {
                prompt_dir: dir.path().to_path_buf(),
                ..PrompterConfig::default()
            },
            ..AppConfig::default()
        };
        let runtime = Runtime::start(config, BackendTable::with_builtins()).await.unwrap();
        (runtime, dir)
    }

    #[tokio::test]
    async fn create_line_returns_job_id() {
        let (runtime, _dir) = runtime().await;
        let reply = handle_line(
            &runtime,
            r#"{"job_type": "context_request_add", "kwargs": {"content": "sing"}}"#,
        );
        assert!(reply["job_id"].is_string());
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn bad_lines_are_rejected_with_a_kind() {
        let (runtime, _dir) = runtime().await;
        assert_eq!(handle_line(&runtime, "not json")["error"], "invalid_request");
        assert_eq!(
            handle_line(&runtime, r#"{"job_type": "dance"}"#)["error"],
            "job_unknown"
        );
        assert_eq!(
            handle_line(&runtime, r#"{"job_type": "context_request_add", "kwargs": {}}"#)["error"],
            "job_invalid_arguments"
        );
        assert_eq!(
            handle_line(&runtime, r#"{"cancel": "nope"}"#)["error"],
            "job_not_found"
        );
        runtime.stop().await.unwrap();
    }

    #[test]
    fn missing_kwargs_default_to_null() {
        let request: Request = serde_json::from_str(r#"{"job_type": "response"}"#).unwrap();
        assert!(matches!(request, Request::Create { kwargs: Value::Null, .. }));
    }
}
