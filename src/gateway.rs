//! OpenAI-compatible HTTP surface.
//!
//! Request shaping, conversation binding, engine invocation, markdown
//! post-processing, and SSE/buffered response framing — grounded in the
//! original's `main.py` `chat_completions` handler, re-expressed as axum
//! handlers over a shared [`AppState`] the way the teacher's `api/client.rs`
//! is a thin translation layer over `crate::router`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::ConfigUpdate;
use crate::conversation::StageArtifacts;
use crate::council::CouncilEngine;
use crate::error::AppError;
use crate::model_client::{ModelClient, Turn};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/chat/completions/{id}", delete(delete_conversation))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/config/reload", post(reload_config))
        .route("/api/config/validate", get(validate_config))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{id}", get(get_conversation))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_models() -> impl IntoResponse {
    Json(json!({
        "object": "list",
        "data": [{
            "id": "council",
            "object": "model",
            "created": chrono::Utc::now().timestamp(),
            "owned_by": "llm-council",
        }]
    }))
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionsRequest {
    #[serde(default)]
    model: String,
    messages: Vec<IncomingMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    #[allow(dead_code)]
    temperature: Option<f64>,
}

/// Splits the incoming message array into (system+history context, last user
/// query), then composes the two with a sentinel line (spec §4.F.1).
fn compose_query(messages: &[IncomingMessage]) -> Result<(String, Vec<Turn>), AppError> {
    if messages.is_empty() {
        return Err(AppError::MalformedRequest("messages must not be empty".to_string()));
    }

    let last_user_idx = messages
        .iter()
        .rposition(|m| m.role == "user")
        .ok_or_else(|| AppError::MalformedRequest("no user message present".to_string()))?;

    let last_user = &messages[last_user_idx];
    let context: Vec<&IncomingMessage> = messages[..last_user_idx]
        .iter()
        .filter(|m| m.role == "system" || m.role == "assistant")
        .collect();

    let composed = if context.is_empty() {
        last_user.content.clone()
    } else {
        let mut block = String::from("Context and file contents:\n");
        for m in &context {
            block.push_str(&format!("[{}] {}\n", m.role, m.content));
        }
        block.push_str("\nUser's question or request:\n");
        block.push_str(&last_user.content);
        block
    };

    let turns = messages
        .iter()
        .map(|m| Turn {
            role: m.role.clone(),
            content: m.content.clone(),
        })
        .collect();

    Ok((composed, turns))
}

fn strip_metadata_lines(content: &str) -> String {
    content
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            !t.starts_with("# Primary source:") && !t.starts_with("# Confidence:")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

fn estimate_usage(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatCompletionsRequest>,
) -> Result<impl IntoResponse, AppError> {
    let start = Instant::now();
    let config = state.config_store.get();
    let model_client = ModelClient::from_config(&config);

    let (composed_query, turns) = compose_query(&body.messages)?;

    let conversation_id = state
        .conversations
        .find_by_first_message(&turns)
        .unwrap_or_else(|| crate::conversation::id_for(&turns));

    let last_user_content = turns
        .iter()
        .rev()
        .find(|t| t.role == "user")
        .map(|t| t.content.clone())
        .unwrap_or_default();

    let is_new = state.conversations.get(&conversation_id).is_none();
    if is_new {
        state.conversations.create(&conversation_id, &last_user_content, None);
    } else {
        state.conversations.append(&conversation_id, "user", &last_user_content, None);
    }

    if is_new {
        let title = generate_title(&model_client, &config.chairman_model, &last_user_content).await;
        state.conversations.update_title(&conversation_id, &title);
    }

    if config.council_models.is_empty() {
        return Err(AppError::EmptyCouncilRoster);
    }

    let engine = CouncilEngine::new(model_client);
    let result = engine.run(&config, &composed_query).await;

    if result.stage1.is_empty() {
        // All members failed: the conversation keeps the user message, but
        // no assistant message is appended (spec §7 AllMembersFailed).
        return Err(AppError::AllMembersFailed { conversation_id });
    }

    let mut content = result.stage3.content.clone();
    if std::env::var("ENABLE_MARKDOWN_FORMATTING")
        .map(|v| v != "false")
        .unwrap_or(true)
    {
        content = crate::markdown::normalize(&content);
    }
    content = strip_metadata_lines(&content);

    let elapsed = start.elapsed();
    let footer = format!(
        "\n\n*Model: {}* | *Response time: {:.2}s* | *Confidence: {}%*",
        result.stage3.primary_source.clone().unwrap_or_else(|| result.stage3.chairman_id.clone()),
        elapsed.as_secs_f64(),
        result.stage3.confidence,
    );
    let final_content = format!("{content}{footer}");

    let stage_artifacts = StageArtifacts {
        stage1: result.stage1.clone(),
        stage2: result.stage2.clone(),
        stage3: result.stage3.clone(),
    };
    // Persist before any response byte is written (spec I6/P2).
    state.conversations.append(&conversation_id, "assistant", &final_content, Some(stage_artifacts));

    let (prompt_tokens, completion_tokens) = if result.stage3.prompt_tokens > 0 || result.stage3.completion_tokens > 0 {
        (result.stage3.prompt_tokens, result.stage3.completion_tokens)
    } else {
        (estimate_usage(&composed_query), estimate_usage(&final_content))
    };

    let force_streaming = std::env::var("FORCE_STREAMING")
        .map(|v| v == "true")
        .unwrap_or(false);

    if body.stream || force_streaming {
        Ok(stream_response(final_content, body.model).into_response())
    } else {
        let response = json!({
            "id": format!("chatcmpl-{conversation_id}"),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": body.model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": final_content },
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": prompt_tokens,
                "completion_tokens": completion_tokens,
                "total_tokens": prompt_tokens + completion_tokens,
            }
        });
        Ok((StatusCode::OK, Json(response)).into_response())
    }
}

/// Emits role → content chunks (≤50 chars) → terminal chunk → `[DONE]`
/// (spec §6). The ~10ms inter-chunk delay is a UX affordance, implemented
/// here via `tokio::time::sleep` between yields.
fn stream_response(content: String, model: String) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let chars: Vec<char> = content.chars().collect();
    let chunks: Vec<String> = chars.chunks(50).map(|c| c.iter().collect()).collect();

    let role_chunk = json!({
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{ "index": 0, "delta": { "role": "assistant" }, "finish_reason": Value::Null }],
    });

    let terminal_chunk = json!({
        "object": "chat.completion.chunk",
        "model": model.clone(),
        "choices": [{ "index": 0, "delta": {}, "finish_reason": "stop" }],
    });

    let mut events = vec![Event::default().data(role_chunk.to_string())];
    for chunk in chunks {
        let frame = json!({
            "object": "chat.completion.chunk",
            "model": model,
            "choices": [{ "index": 0, "delta": { "content": chunk }, "finish_reason": Value::Null }],
        });
        events.push(Event::default().data(frame.to_string()));
    }
    events.push(Event::default().data(terminal_chunk.to_string()));
    events.push(Event::default().data("[DONE]"));

    let stream = stream::iter(events.into_iter().map(Ok)).then(|event| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        event
    });

    Sse::new(stream)
}

async fn generate_title(client: &ModelClient, chairman_model: &str, user_query: &str) -> String {
    let prompt = format!(
        "Write a very short title (3-5 words maximum) for this request. \
         Do not use quotes or punctuation.\n\n{user_query}"
    );
    let messages = [Turn { role: "user".to_string(), content: prompt }];

    match client.query(chairman_model, &messages, Duration::from_secs(30)).await {
        Ok(reply) => {
            let trimmed = reply.content.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
            if trimmed.is_empty() {
                "New Conversation".to_string()
            } else {
                trimmed
            }
        }
        Err(_) => "New Conversation".to_string(),
    }
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.conversations.delete(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config_store.get();
    Json(json!({
        "council_models": config.council_models,
        "chairman_model": config.chairman_model,
        "backend_mode": config.backend_mode.to_string(),
        "backend_base_url": config.backend_base_url,
    }))
}

#[derive(Debug, Deserialize, Default)]
struct PutConfigRequest {
    council_models: Option<Vec<String>>,
    chairman_model: Option<String>,
}

async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PutConfigRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Some(models) = &body.council_models {
        let validation = state.config_store.validate(models).await;
        let unavailable: Vec<&String> = models.iter().filter(|m| !validation[*m]).collect();
        if !unavailable.is_empty() {
            return Err(AppError::ConfigValidation(format!(
                "models not available: {unavailable:?}"
            )));
        }
    }
    if let Some(chairman) = &body.chairman_model {
        let validation = state.config_store.validate(std::slice::from_ref(chairman)).await;
        if !validation.get(chairman).copied().unwrap_or(false) {
            return Err(AppError::ConfigValidation(format!(
                "chairman model not available: {chairman}"
            )));
        }
    }

    let updated = state
        .config_store
        .update(ConfigUpdate {
            council_models: body.council_models,
            chairman_model: body.chairman_model,
        })
        .await
        .map_err(AppError::Internal)?;

    Ok(Json(json!({
        "status": "success",
        "config": {
            "council_models": updated.council_models,
            "chairman_model": updated.chairman_model,
            "backend_mode": updated.backend_mode.to_string(),
        }
    })))
}

async fn reload_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config_store.reload().await;
    Json(json!({
        "status": "success",
        "config": {
            "council_models": config.council_models,
            "chairman_model": config.chairman_model,
            "backend_mode": config.backend_mode.to_string(),
        }
    }))
}

#[derive(Debug, Deserialize)]
struct ValidateQuery {
    models: String,
}

async fn validate_config(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ValidateQuery>,
) -> impl IntoResponse {
    let model_list: Vec<String> = query
        .models
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let validation = state.config_store.validate(&model_list).await;
    let all_available = validation.values().all(|v| *v);
    Json(json!({ "validation": validation, "all_available": all_available }))
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50);
    let offset = query.offset.unwrap_or(0);
    Json(state.conversations.list(limit, offset))
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state
        .conversations
        .get(&id)
        .map(Json)
        .ok_or(AppError::ConversationMissing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_metadata_lines_removes_both_sentinels() {
        let content = "Answer here.\n# Primary source: m1\n# Confidence: 80%";
        let stripped = strip_metadata_lines(content);
        assert!(!stripped.contains("Primary source"));
        assert!(!stripped.contains("Confidence"));
        assert!(stripped.contains("Answer here."));
    }

    #[test]
    fn compose_query_builds_context_block_when_history_present() {
        let messages = vec![
            IncomingMessage { role: "system".into(), content: "be terse".into() },
            IncomingMessage { role: "user".into(), content: "what is 2+2?".into() },
        ];
        let (composed, _) = compose_query(&messages).unwrap();
        assert!(composed.contains("Context and file contents"));
        assert!(composed.contains("User's question or request"));
        assert!(composed.contains("what is 2+2?"));
    }

    #[test]
    fn compose_query_is_bare_query_without_history() {
        let messages = vec![IncomingMessage { role: "user".into(), content: "hi".into() }];
        let (composed, _) = compose_query(&messages).unwrap();
        assert_eq!(composed, "hi");
    }

    #[test]
    fn compose_query_rejects_empty_message_array() {
        assert!(compose_query(&[]).is_err());
    }
}
