use cadenza_core::{Chunk, OpRole};
use serde_json::{Value, json};
use tracing::debug;

use super::{Services, collect_text};
use crate::job::{
    ConversationAudioArgs, ConversationTextArgs, CustomAddArgs, CustomRegisterArgs,
    CustomRemoveArgs, RequestAddArgs,
};
use crate::prompter::{Message, Prompter, PrompterUpdate, time_from_timestamp};
use crate::scheduler::JobScope;

type Result = cadenza_core::Result<()>;

/// `{timestamp, content, line}` for the newest history entry, plus `user`
/// for chat lines.
fn last_line(prompter: &Prompter) -> Value {
    let Some(last) = prompter.last() else {
        return Value::Null;
    };
    let mut line = json!({
        "timestamp": last.time().map(|t| t.timestamp()),
        "content": last.message(),
        "line": last.to_line(),
    });
    if let (Message::Chat { user, .. }, Some(fields)) = (last, line.as_object_mut()) {
        fields.insert("user".into(), Value::from(user.as_str()));
    }
    line
}

pub(super) fn clear(services: &Services, scope: &JobScope) -> Result {
    scope.start(json!({}));
    services.prompter().clear_history();
    Ok(())
}

pub(super) fn configure(services: &Services, scope: &JobScope, update: PrompterUpdate) -> Result {
    scope.start(serde_json::to_value(&update)?);
    services.prompter().configure(update)
}

pub(super) async fn request_add(services: &Services, scope: &JobScope, args: RequestAddArgs) -> Result {
    scope.start(json!({ "content": args.content }));
    let line = {
        let mut prompter = services.prompter();
        prompter.add_request(&args.content, None)?;
        last_line(&prompter)
    };
    services.persist_history().await?;
    scope.progress(line);
    Ok(())
}

pub(super) async fn conversation_add_text(
    services: &Services,
    scope: &JobScope,
    args: ConversationTextArgs,
) -> Result {
    scope.start(json!({
        "user": args.user,
        "timestamp": args.timestamp,
        "content": args.content,
    }));
    let line = {
        let mut prompter = services.prompter();
        prompter.add_chat(&args.user, &args.content, args.timestamp.map(time_from_timestamp))?;
        last_line(&prompter)
    };
    services.persist_history().await?;
    scope.progress(line);
    Ok(())
}

/// Transcribe a clip and record it as the user's chat line.
pub(super) async fn conversation_add_audio(
    services: &Services,
    scope: &JobScope,
    args: ConversationAudioArgs,
) -> Result {
    scope.start(json!({
        "user": args.user,
        "timestamp": args.timestamp,
        "sr": args.sr,
        "sw": args.sw,
        "ch": args.ch,
        "audio_bytes": !args.audio_bytes.is_empty(),
    }));

    // Recent history primes the transcriber with names and topic.
    let prompt = {
        let prompter = services.prompter();
        let history = prompter.history_text();
        if history.is_empty() {
            format!("Your name is {}", prompter.character_name())
        } else {
            history
        }
    };
    let input = Chunk::new()
        .with("prompt", prompt)
        .with("audio_bytes", args.audio_bytes)
        .with("sr", args.sr)
        .with("sw", args.sw)
        .with("ch", args.ch);
    let stream = services
        .registry
        .use_operation_cancellable(OpRole::Stt, input, None, scope.token())?;
    let transcription = collect_text(stream, "transcription").await?;

    if transcription.trim().is_empty() {
        debug!(job_id = %scope.id(), user = %args.user, "Transcription was empty, nothing added");
        return Ok(());
    }

    let line = {
        let mut prompter = services.prompter();
        prompter.add_chat(&args.user, &transcription, args.timestamp.map(time_from_timestamp))?;
        last_line(&prompter)
    };
    services.persist_history().await?;
    scope.progress(line);
    Ok(())
}

pub(super) fn custom_register(
    services: &Services,
    scope: &JobScope,
    args: CustomRegisterArgs,
) -> Result {
    scope.start(json!({
        "context_id": args.context_id,
        "context_name": args.context_name,
        "context_description": args.context_description,
    }));
    services.prompter().register_custom_context(
        &args.context_id,
        &args.context_name,
        args.context_description.as_deref(),
    )?;
    Ok(())
}

pub(super) fn custom_remove(services: &Services, scope: &JobScope, args: CustomRemoveArgs) -> Result {
    scope.start(json!({ "context_id": args.context_id }));
    services.prompter().remove_custom_context(&args.context_id)?;
    Ok(())
}

pub(super) async fn custom_add(services: &Services, scope: &JobScope, args: CustomAddArgs) -> Result {
    scope.start(json!({
        "context_id": args.context_id,
        "context_contents": args.context_contents,
        "timestamp": args.timestamp,
    }));
    let line = {
        let mut prompter = services.prompter();
        prompter.add_custom_context(
            &args.context_id,
            &args.context_contents,
            args.timestamp.map(time_from_timestamp),
        )?;
        last_line(&prompter)
    };
    services.persist_history().await?;
    scope.progress(line);
    Ok(())
}
