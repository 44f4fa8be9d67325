//! Hosted aggregator adapter (OpenAI-compatible `/v1/chat/completions` over
//! HTTPS with bearer auth).
//!
//! Mirrors the teacher's `OpenAIAdapter` — a single buffered request with a
//! status check before the JSON parse — but returns typed [`Failure`] values
//! per the spec's `ModelClient` contract instead of `anyhow::Result`.

use std::time::Duration;

use reqwest::{header, Client};
use serde_json::{json, Value};

use crate::error::Failure;
use crate::model_client::{ModelReply, Turn};

#[derive(Debug, Clone)]
pub struct RemoteAdapter {
    client: Client,
    base_url: String,
}

impl RemoteAdapter {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = api_key {
            let value = format!("Bearer {key}");
            if let Ok(header_value) = header::HeaderValue::from_str(&value) {
                headers.insert(header::AUTHORIZATION, header_value);
            } else {
                tracing::warn!("BACKEND_API_KEY contains invalid header characters; omitting");
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn query(
        &self,
        model_id: &str,
        messages: &[Turn],
        timeout: Duration,
    ) -> Result<ModelReply, Failure> {
        let url = format!("{}/v1/chat/completions", self.base_url);
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
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Failure::MalformedResponse("missing choices[0].message.content".to_string())
            })?
            .to_string();

        let prompt_tokens = value
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let completion_tokens = value
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(ModelReply {
            model_id: model_id.to_string(),
            content,
            prompt_tokens,
            completion_tokens,
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
