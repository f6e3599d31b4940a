use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cadenza_core::{Chunk, Error, JobError, OpConfig, OperationError, Value};
use serde_json::json;
use tracing::{info, warn};

use super::{Services, publish_chunks};
use crate::job::{JobType, OpEntry, OperationUseArgs, OpsArgs};
use crate::prompter::Message;
use crate::scheduler::JobScope;

type Result = cadenza_core::Result<()>;

fn ops_payload(args: &OpsArgs) -> serde_json::Value {
    json!({ "ops": args.ops })
}

fn entry_payload(entry: &OpEntry) -> serde_json::Value {
    json!({ "role": entry.role, "id": entry.id })
}

pub(super) async fn load(services: &Services, scope: &JobScope, args: OpsArgs) -> Result {
    scope.start(ops_payload(&args));
    for entry in &args.ops {
        let id = entry.id.as_deref().ok_or_else(|| JobError::InvalidArguments {
            job_type: JobType::OperationLoad.to_string(),
            reason: format!("ops entry for role {} has no id", entry.role),
        })?;
        services.registry.load_operation(entry.role, id, &entry.config).await?;
        scope.progress(entry_payload(entry));
    }
    Ok(())
}

pub(super) async fn reload_from_config(services: &Services, scope: &JobScope) -> Result {
    scope.start(json!({}));
    let specs = services.config().operations.clone();
    services.registry.load_operations_from_config(&specs).await?;
    Ok(())
}

pub(super) async fn unload(services: &Services, scope: &JobScope, args: OpsArgs) -> Result {
    scope.start(ops_payload(&args));
    for entry in &args.ops {
        services
            .registry
            .close_operation(entry.role, entry.id.as_deref())
            .await?;
        scope.progress(entry_payload(entry));
    }
    Ok(())
}

pub(super) async fn configure(services: &Services, scope: &JobScope, args: OpsArgs) -> Result {
    scope.start(ops_payload(&args));
    for entry in &args.ops {
        let id = entry.id.as_deref();
        services.registry.configure(entry.role, &entry.config, id).await?;
        let applied = services.registry.get_configuration(entry.role, id).await?;
        scope.progress(json!({ "role": entry.role, "id": entry.id, "config": applied }));
    }
    Ok(())
}

/// Build an input chunk from a client payload.
///
/// `audio_bytes` arrives base64 encoded. `messages` may be history entries
/// in their dict form, which are converted to generation messages.
fn payload_chunk(
    services: &Services,
    payload: serde_json::Map<String, serde_json::Value>,
) -> std::result::Result<Chunk, String> {
    let mut chunk = Chunk::new();
    for (field, value) in payload {
        let value = match (field.as_str(), value) {
            ("audio_bytes", serde_json::Value::String(encoded)) => STANDARD
                .decode(encoded.as_bytes())
                .map(Value::Bytes)
                .map_err(|e| format!("audio_bytes is not valid base64: {e}"))?,
            ("messages", serde_json::Value::Array(items)) => {
                let prompter = services.prompter();
                let messages = items
                    .iter()
                    .map(|item| -> std::result::Result<serde_json::Value, String> {
                        if item.get("role").is_some() {
                            return Ok(item.clone());
                        }
                        let message =
                            Message::from_dict(item, |id| prompter.custom_context(id))?;
                        Ok(prompter.generation_message(&message))
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Value::Json(serde_json::Value::Array(messages))
            }
            (_, other) => Value::from_json(other),
        };
        chunk.insert(field, value);
    }
    Ok(chunk)
}

/// Run one operation directly on a client payload.
///
/// When the role or id is not loaded, a standalone instance is built,
/// started for this call only, and closed afterwards.
pub(super) async fn use_operation(
    services: &Services,
    scope: &JobScope,
    args: OperationUseArgs,
) -> Result {
    scope.start(json!({ "role": args.role, "id": args.id }));
    let chunk = payload_chunk(services, args.payload).map_err(|reason| JobError::InvalidArguments {
        job_type: JobType::OperationUse.to_string(),
        reason,
    })?;

    let role = args.role;
    let id = args.id.as_deref();
    let resolved = services
        .registry
        .use_operation_cancellable(role, chunk.clone(), id, scope.token());
    match (resolved, id) {
        (Ok(stream), _) => publish_chunks(scope, stream).await,
        (Err(OperationError::Unloaded { .. }), Some(id)) => {
            info!(job_id = %scope.id(), role = %role, id, "Using standalone operation");
            let op = services.registry.build_loose(role, id, &OpConfig::new()).await?;
            let outcome = publish_chunks(scope, op.invoke(chunk)).await;
            if let Err(e) = op.close().await {
                warn!(role = %role, id, error = %e, "Failed to close standalone operation");
            }
            outcome
        }
        (Err(e), _) => Err(Error::from(e)),
    }
}
