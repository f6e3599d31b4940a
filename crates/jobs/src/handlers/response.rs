use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cadenza_core::{Chunk, Error, OpRole};
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Services, collect_text};
use crate::job::ResponseArgs;
use crate::scheduler::JobScope;

/// Audio is sent to clients in base64 slices of this many characters.
const AUDIO_SLICE_CHARS: usize = 4096;

pub(super) async fn response(
    services: &Services,
    scope: &JobScope,
    args: ResponseArgs,
) -> cadenza_core::Result<()> {
    let registry = &services.registry;
    let include_audio = args.include_audio && registry.is_loaded(OpRole::Tts);
    scope.start(json!({ "include_audio": include_audio }));

    if registry.is_loaded(OpRole::Mcp) {
        use_tools(services, scope).await?;
    }

    let (instruction_prompt, messages, history) = {
        let prompter = services.prompter();
        (
            prompter.system_prompt()?,
            prompter.generation_messages(),
            prompter.history_dicts(),
        )
    };

    let generation = Chunk::new()
        .with("instruction_prompt", instruction_prompt.clone())
        .with("messages", messages);
    let stream =
        registry.use_operation_cancellable(OpRole::T2t, generation, None, scope.token())?;
    let raw_content = collect_text(stream, "content").await?;

    scope.progress(json!({ "instruction_prompt": instruction_prompt }));
    scope.progress(json!({ "history": history }));
    scope.progress(json!({ "raw_content": raw_content }));

    if raw_content.trim().is_empty() {
        warn!(job_id = %scope.id(), "Text generation produced no content");
        return Ok(());
    }

    let mut filtered = registry.use_operation_cancellable(
        OpRole::FilterText,
        Chunk::new().with("content", raw_content),
        None,
        scope.token(),
    )?;
    let mut lines = 0usize;
    while let Some(text_chunk) = filtered.next().await {
        let text_chunk = text_chunk?;
        let content = text_chunk.text("content").unwrap_or_default().to_string();
        if !content.is_empty() {
            {
                let mut prompter = services.prompter();
                let character = prompter.character_name().to_string();
                prompter.add_chat(&character, &content, None)?;
            }
            services.persist_history().await?;
            lines += 1;
        }
        scope.progress(text_chunk.to_json());

        if include_audio && !content.is_empty() {
            speak(services, scope, text_chunk).await?;
        }
    }
    info!(job_id = %scope.id(), lines, include_audio, "Response generated");
    Ok(())
}

/// Ask the tool-selection generator what to call, run the calls, and add
/// the results to history.
async fn use_tools(services: &Services, scope: &JobScope) -> Result<(), Error> {
    let tooling_prompt = services.mcp.get_tooling_prompt();
    let response_prompt = services.mcp.get_response_prompt();
    let (system_context, user_context) = {
        let mut prompter = services.prompter();
        prompter.set_mcp_prompts(tooling_prompt, response_prompt);
        (
            prompter.mcp_system_context().to_string(),
            prompter.mcp_user_context()?,
        )
    };

    let selection = Chunk::new()
        .with("instruction_prompt", system_context)
        .with("messages", json!([{ "role": "user", "content": user_context }]));
    let stream =
        services
            .registry
            .use_operation_cancellable(OpRole::Mcp, selection, None, scope.token())?;
    let tooling_response = collect_text(stream, "content").await?;
    debug!(job_id = %scope.id(), response = %tooling_response, "Tool selection");

    let records = services.mcp.use_tools(&tooling_response).await;
    services.prompter().add_mcp_results(&records)?;
    services.persist_history().await?;
    Ok(())
}

/// Synthesize one text chunk and publish the filtered audio.
async fn speak(services: &Services, scope: &JobScope, text_chunk: Chunk) -> Result<(), Error> {
    let registry = &services.registry;
    let mut spoken = registry.use_operation_cancellable(OpRole::Tts, text_chunk, None, scope.token())?;
    while let Some(audio) = spoken.next().await {
        let mut filtered =
            registry.use_operation_cancellable(OpRole::FilterAudio, audio?, None, scope.token())?;
        while let Some(audio) = filtered.next().await {
            publish_audio(scope, &audio?);
        }
    }
    Ok(())
}

fn publish_audio(scope: &JobScope, audio: &Chunk) {
    let encoded = STANDARD.encode(audio.bytes("audio_bytes").unwrap_or_default());
    let (sr, sw, ch) = (audio.int("sr"), audio.int("sw"), audio.int("ch"));
    // base64 is ASCII, so byte offsets are char boundaries
    for start in (0..encoded.len()).step_by(AUDIO_SLICE_CHARS) {
        let end = (start + AUDIO_SLICE_CHARS).min(encoded.len());
        scope.progress(json!({
            "audio_bytes": &encoded[start..end],
            "sr": sr,
            "sw": sw,
            "ch": ch,
        }));
    }
}
