//! Execute N independent [`ModelClient`] calls concurrently.
//!
//! Grounded in the original's `query_models_parallel`: every call is spawned
//! up front and awaited together via `join_all`, and since
//! [`ModelClient::query`] never raises, one member's failure can never cancel
//! or poison its siblings.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;

use crate::error::Failure;
use crate::model_client::{ModelClient, ModelReply, Turn};

/// Query every id in `model_ids` with the same `messages`, concurrently.
///
/// The result map always has one entry per requested id (spec §4.B); a
/// missing entry would indicate a bug in this function, not a backend
/// failure. Dispatch order matches `model_ids`; result ordering within the
/// map carries no meaning.
pub async fn fanout(
    client: &ModelClient,
    model_ids: &[String],
    messages: &[Turn],
    timeout: Duration,
) -> HashMap<String, Result<ModelReply, Failure>> {
    let calls = model_ids
        .iter()
        .map(|id| client.query(id, messages, timeout));
    let results = join_all(calls).await;

    model_ids
        .iter()
        .cloned()
        .zip(results)
        .collect::<HashMap<_, _>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::local::LocalAdapter;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fanout_contains_entry_for_every_requested_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": { "content": "hi" }
            })))
            .mount(&server)
            .await;

        let client = ModelClient::Local(LocalAdapter::new(&server.uri()));
        let ids = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        let messages = [Turn {
            role: "user".into(),
            content: "hello".into(),
        }];

        let results = fanout(&client, &ids, &messages, Duration::from_secs(5)).await;

        assert_eq!(results.len(), 3);
        for id in &ids {
            assert!(results.get(id).unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_cancel_peers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": { "content": "ok" }
            })))
            .mount(&server)
            .await;

        let client = ModelClient::Local(LocalAdapter::new(&server.uri()));
        let ids = vec!["bad".to_string(), "good".to_string()];
        let messages = [Turn {
            role: "user".into(),
            content: "hello".into(),
        }];

        let results = fanout(&client, &ids, &messages, Duration::from_secs(5)).await;
        assert_eq!(results.len(), 2);
        assert!(results.values().any(|r| r.is_ok()));
    }
}
