//! Dynamic configuration: environment-vs-overlay resolution with hot update.
//!
//! Grounded in the original's `config_manager.py` for the resolution rule and
//! in the teacher's `config.rs`/`router.rs` for the Rust shape: an owned
//! snapshot behind `Arc<RwLock<Arc<Config>>>` so readers never block on a
//! writer and never observe a partially-updated value (spec invariant I7).

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

/// Which family of backend the configured `backend_base_url` speaks to.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// A local inference server addressed by model name (e.g. Ollama).
    #[default]
    Local,
    /// A hosted aggregator reached over HTTPS with bearer auth.
    Remote,
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
        })
    }
}

/// The council roster and backend addressing, as seen by one request.
///
/// Cloned by value on every read (spec §4.C "snapshot, cheap"); a
/// long-running request captures one [`Config`] at Stage 1 and uses it
/// through Stage 3, so a concurrent `update` never changes the roster
/// mid-flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub council_models: Vec<String>,
    pub chairman_model: String,
    pub backend_mode: BackendMode,
    pub backend_base_url: String,
    /// Not part of the overlay file; resolved only from the environment
    /// (`BACKEND_API_KEY`), since secrets never belong on disk.
    #[serde(skip, default)]
    pub backend_api_key: Option<String>,
    #[serde(skip, default = "defaults::model_timeout")]
    pub model_timeout: Duration,
}

/// The subset of [`Config`] that `update` may change.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigUpdate {
    pub council_models: Option<Vec<String>>,
    pub chairman_model: Option<String>,
}

mod defaults {
    use std::time::Duration;
    pub fn model_timeout() -> Duration {
        Duration::from_secs(60)
    }
}

/// The on-disk overlay shape (spec §6 "Overlay file format").
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Overlay {
    council_models: Vec<String>,
    chairman_model: String,
    backend_mode: BackendMode,
    backend_base_url: String,
}

impl From<&Config> for Overlay {
    fn from(c: &Config) -> Self {
        Overlay {
            council_models: c.council_models.clone(),
            chairman_model: c.chairman_model.clone(),
            backend_mode: c.backend_mode,
            backend_base_url: c.backend_base_url.clone(),
        }
    }
}

fn env_config() -> Config {
    let council_models = council_models_from_env();
    let chairman_model = std::env::var("CHAIRMAN_MODEL")
        .or_else(|_| std::env::var("CHAIRMAN"))
        .unwrap_or_default();
    let backend_mode = match std::env::var("BACKEND_MODE").as_deref() {
        Ok("remote") => BackendMode::Remote,
        _ => BackendMode::Local,
    };
    let backend_base_url = std::env::var("BACKEND_BASE_URL")
        .unwrap_or_else(|_| "http://localhost:11434".to_string());
    let backend_api_key = std::env::var("BACKEND_API_KEY").ok();
    let model_timeout = std::env::var("MODEL_TIMEOUT")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(defaults::model_timeout);

    Config {
        council_models,
        chairman_model,
        backend_mode,
        backend_base_url,
        backend_api_key,
        model_timeout,
    }
}

/// `COUNCIL_MODELS` (comma-separated) wins only when no `COUNCILLOR_0N`
/// variables are set — matches the original's fallback-to-legacy-format rule.
fn council_models_from_env() -> Vec<String> {
    let mut models = Vec::new();
    for i in 1..=4 {
        if let Ok(v) = std::env::var(format!("COUNCILLOR_{i:02}")) {
            let v = v.trim();
            if !v.is_empty() {
                models.push(v.to_string());
            }
        }
    }
    if models.is_empty() {
        if let Ok(raw) = std::env::var("COUNCIL_MODELS") {
            models = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    models
}

/// Resolve the startup config: environment is canonical; the overlay file is
/// authoritative only when its roster already matches the environment
/// (spec §4.C resolution rule). Mismatches rewrite the file to the
/// environment's view.
async fn resolve(overlay_path: &PathBuf) -> Config {
    let env = env_config();

    let file = tokio::fs::read_to_string(overlay_path)
        .await
        .ok()
        .and_then(|s| serde_json::from_str::<Overlay>(&s).ok());

    match file {
        Some(overlay) => {
            let same_roster = overlay.council_models.iter().collect::<std::collections::HashSet<_>>()
                == env.council_models.iter().collect::<std::collections::HashSet<_>>()
                && overlay.chairman_model == env.chairman_model;

            if same_roster {
                Config {
                    council_models: overlay.council_models,
                    chairman_model: overlay.chairman_model,
                    backend_mode: overlay.backend_mode,
                    backend_base_url: overlay.backend_base_url,
                    backend_api_key: env.backend_api_key,
                    model_timeout: env.model_timeout,
                }
            } else {
                if let Err(e) = write_overlay(overlay_path, &env).await {
                    tracing::warn!(error = %e, "failed to rewrite overlay after env/file mismatch");
                }
                env
            }
        }
        None => {
            if let Err(e) = write_overlay(overlay_path, &env).await {
                tracing::warn!(error = %e, "failed to write initial overlay file");
            }
            env
        }
    }
}

async fn write_overlay(path: &PathBuf, config: &Config) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let overlay = Overlay::from(config);
    let body = serde_json::to_string_pretty(&overlay).context("serializing overlay")?;

    // Write-to-temp + rename for atomicity, per spec §6.
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await.context("writing overlay temp file")?;
    tokio::fs::rename(&tmp, path).await.context("renaming overlay into place")?;
    Ok(())
}

/// Single-writer, many-reader store around [`Config`].
///
/// `snapshot` is read via a fast, short-lived `std::sync::RwLock` read guard
/// that is dropped immediately after cloning the inner `Arc` — readers never
/// block on a concurrent file write. `write_lock` is the single exclusive
/// section spec §4.C requires around load/update/reload.
pub struct ConfigStore {
    snapshot: RwLock<Arc<Config>>,
    write_lock: AsyncMutex<()>,
    overlay_path: PathBuf,
    http: reqwest::Client,
}

impl ConfigStore {
    pub async fn load(overlay_path: PathBuf) -> Self {
        let config = resolve(&overlay_path).await;
        Self {
            snapshot: RwLock::new(Arc::new(config)),
            write_lock: AsyncMutex::new(()),
            overlay_path,
            http: reqwest::Client::new(),
        }
    }

    /// Cheap snapshot read — returns the `Config` as it stood at the moment
    /// of the call, by value (spec I7).
    pub fn get(&self) -> Arc<Config> {
        self.snapshot.read().expect("config lock poisoned").clone()
    }

    /// Atomically apply `update`, persist the overlay, and return the new
    /// snapshot.
    pub async fn update(&self, update: ConfigUpdate) -> anyhow::Result<Arc<Config>> {
        let _guard = self.write_lock.lock().await;

        let mut next = (*self.get()).clone();
        if let Some(models) = update.council_models {
            next.council_models = models;
        }
        if let Some(chairman) = update.chairman_model {
            next.chairman_model = chairman;
        }

        write_overlay(&self.overlay_path, &next).await?;
        let next = Arc::new(next);
        *self.snapshot.write().expect("config lock poisoned") = next.clone();
        Ok(next)
    }

    /// Drop the cache, re-read the environment, and re-resolve against the
    /// overlay (rewriting it if it disagrees).
    pub async fn reload(&self) -> Arc<Config> {
        let _guard = self.write_lock.lock().await;
        let resolved = Arc::new(resolve(&self.overlay_path).await);
        *self.snapshot.write().expect("config lock poisoned") = resolved.clone();
        resolved
    }

    /// Check `model_ids` against the backend's membership list.
    ///
    /// Only meaningful for a local backend, which exposes a model listing;
    /// a remote aggregator's catalog is not queried here, and any backend
    /// error yields an optimistic true for every id (spec §4.C).
    pub async fn validate(&self, model_ids: &[String]) -> std::collections::HashMap<String, bool> {
        let config = self.get();
        if config.backend_mode != BackendMode::Local {
            return model_ids.iter().map(|m| (m.clone(), true)).collect();
        }

        let url = format!("{}/api/tags", config.backend_base_url.trim_end_matches('/'));
        let available = self
            .http
            .get(&url)
            .send()
            .await
            .ok()
            .filter(|r| r.status().is_success())
            .map(|r| r.json::<serde_json::Value>());

        let available = match available {
            Some(fut) => match fut.await {
                Ok(v) => v
                    .pointer("/models")
                    .and_then(|m| m.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    }),
                Err(_) => None,
            },
            None => None,
        };

        match available {
            Some(available) => model_ids
                .iter()
                .map(|m| {
                    let prefix = m.split(':').next().unwrap_or(m);
                    let ok = available
                        .iter()
                        .any(|a| a == m || a.starts_with(prefix));
                    (m.clone(), ok)
                })
                .collect(),
            None => model_ids.iter().map(|m| (m.clone(), true)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_GUARD: StdMutex<()> = StdMutex::new(());

    fn clear_env() {
        for var in [
            "COUNCILLOR_01",
            "COUNCILLOR_02",
            "COUNCILLOR_03",
            "COUNCILLOR_04",
            "COUNCIL_MODELS",
            "CHAIRMAN_MODEL",
            "CHAIRMAN",
            "BACKEND_MODE",
            "BACKEND_BASE_URL",
            "BACKEND_API_KEY",
            "MODEL_TIMEOUT",
        ] {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn council_models_prefers_indexed_vars_over_legacy_csv() {
        let _lock = ENV_GUARD.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("COUNCILLOR_01", "m1");
            std::env::set_var("COUNCILLOR_02", "m2");
            std::env::set_var("COUNCIL_MODELS", "legacy1,legacy2");
        }
        let models = council_models_from_env();
        assert_eq!(models, vec!["m1".to_string(), "m2".to_string()]);
        clear_env();
    }

    #[test]
    fn council_models_falls_back_to_legacy_csv() {
        let _lock = ENV_GUARD.lock().unwrap();
        clear_env();
        unsafe { std::env::set_var("COUNCIL_MODELS", "a, b ,c") };
        let models = council_models_from_env();
        assert_eq!(models, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        clear_env();
    }

    #[tokio::test]
    async fn update_then_get_observes_new_chairman() {
        let _lock = ENV_GUARD.lock().unwrap();
        clear_env();
        let dir = tempdir();
        let store = ConfigStore::load(dir.join("council_config.json")).await;

        let updated = store
            .update(ConfigUpdate {
                council_models: None,
                chairman_model: Some("new-chairman".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(updated.chairman_model, "new-chairman");
        assert_eq!(store.get().chairman_model, "new-chairman");
        clear_env();
    }

    #[tokio::test]
    async fn reload_rewrites_overlay_to_match_environment() {
        let _lock = ENV_GUARD.lock().unwrap();
        clear_env();
        let dir = tempdir();
        let path = dir.join("council_config.json");
        let store = ConfigStore::load(path.clone()).await;
        store
            .update(ConfigUpdate {
                council_models: None,
                chairman_model: Some("overlay-only".to_string()),
            })
            .await
            .unwrap();

        unsafe { std::env::set_var("CHAIRMAN_MODEL", "env-wins") };
        let reloaded = store.reload().await;
        assert_eq!(reloaded.chairman_model, "env-wins");
        clear_env();
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "lm-council-test-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
