//! Backend adapters behind [`crate::model_client::ModelClient`].
//!
//! Two adapters only — `local` (an HTTP/JSON inference server addressed by
//! model name, e.g. Ollama) and `remote` (a hosted aggregator reached over
//! HTTPS with bearer auth, e.g. OpenRouter). Selection happens once at
//! startup from `backend_mode`; neither adapter is aware of the other.

pub mod local;
pub mod remote;
