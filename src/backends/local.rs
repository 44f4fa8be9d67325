//! Local inference server adapter (Ollama-shaped `/api/chat`).
//!
//! Grounded in the original's `ollama_adapter.py`: one POST per call, a
//! non-streaming body, content pulled from `message.content`. Token usage is
//! not reported by this protocol, so [`ModelReply`] fields default to zero —
//! the gateway's word-count estimate picks up the slack.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use crate::error::Failure;
use crate::model_client::{ModelReply, Turn};

#[derive(Debug, Clone)]
pub struct LocalAdapter {
    client: Client,
    base_url: String,
}

impl LocalAdapter {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn query(
        &self,
        model_id: &str,
        messages: &[Turn],
        timeout: Duration,
    ) -> Result<ModelReply, Failure> {
        let url = format!("{}/api/chat", self.base_url);
        let body = json!({
            "model": model_id,
            "messages": messages,
            "stream": false,
        });

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Failure::MalformedResponse(e.to_string()))?;

        if !status.is_success() {
            return Err(Failure::HttpStatus {
                code: status.as_u16(),
            });
        }

        let value: Value =
            serde_json::from_str(&text).map_err(|e| Failure::MalformedResponse(e.to_string()))?;

        let content = value
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| Failure::MalformedResponse("missing message.content".to_string()))?
            .to_string();

        Ok(ModelReply {
            model_id: model_id.to_string(),
            content,
            prompt_tokens: 0,
            completion_tokens: 0,
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> Failure {
    if e.is_timeout() {
        Failure::Timeout
    } else {
        Failure::TransportError(e.to_string())
    }
}
