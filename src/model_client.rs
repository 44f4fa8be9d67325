//! Uniform async call to one backend for one prompt.
//!
//! [`ModelClient`] is a tagged union selected once at startup from
//! `backend_mode`, mirroring the teacher's `BackendClient` enum: downstream
//! code never matches on the backend kind itself, only on the result of
//! [`ModelClient::query`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backends::{local::LocalAdapter, remote::RemoteAdapter};
use crate::config::{BackendMode, Config};
use crate::error::Failure;

/// One (role, content) turn in a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

/// The successful result of a single model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelReply {
    pub model_id: String,
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone)]
pub enum ModelClient {
    Local(LocalAdapter),
    Remote(RemoteAdapter),
}

impl ModelClient {
    pub fn from_config(config: &Config) -> Self {
        match config.backend_mode {
            BackendMode::Local => ModelClient::Local(LocalAdapter::new(&config.backend_base_url)),
            BackendMode::Remote => ModelClient::Remote(RemoteAdapter::new(
                &config.backend_base_url,
                config.backend_api_key.clone(),
            )),
        }
    }

    /// Query `model_id` with an ordered prompt, bounded by `timeout`.
    ///
    /// Never raises on a non-2xx response or a malformed body — always
    /// returns a typed [`Failure`] instead, so a fan-out of these never
    /// needs to catch an unwind.
    pub async fn query(
        &self,
        model_id: &str,
        messages: &[Turn],
        timeout: Duration,
    ) -> Result<ModelReply, Failure> {
        match self {
            ModelClient::Local(a) => a.query(model_id, messages, timeout).await,
            ModelClient::Remote(a) => a.query(model_id, messages, timeout).await,
        }
    }

    /// Best-effort warm-up: issue a minimal prompt so the backend has the
    /// model's weights resident. Failures are logged, never propagated.
    pub async fn preload(&self, model_id: &str, short_timeout: Duration) {
        let probe = [Turn {
            role: "user".to_string(),
            content: "OK".to_string(),
        }];
        if let Err(e) = self.query(model_id, &probe, short_timeout).await {
            tracing::warn!(model_id, error = %e, "preload failed");
        }
    }
}
