//! Weights & Biases metrics sender
//!
//! Construction logs in (GraphQL `viewer` query authenticated with the API
//! key) and registers a run (`upsertBucket`). Each `send` appends one row to
//! the run's `wandb-history.jsonl` through the file-stream endpoint.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use common::Secret;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::{Message, Notifier};

/// History file every row is streamed into.
const HISTORY_FILE: &str = "wandb-history.jsonl";

const VIEWER_QUERY: &str = "query Viewer { viewer { id entity } }";

const UPSERT_RUN_MUTATION: &str = "mutation UpsertBucket($name: String, $project: String, $entity: String) { \
     upsertBucket(input: {name: $name, modelName: $project, entityName: $entity}) { bucket { id name } } }";

/// Where and under which project runs are registered.
#[derive(Debug, Clone)]
pub struct WandbOptions {
    pub base_url: String,
    pub project: String,
    /// Defaults to the API key owner's entity
    pub entity: Option<String>,
}

impl Default for WandbOptions {
    fn default() -> Self {
        Self {
            base_url: "https://api.wandb.ai".to_string(),
            project: "key-rotation".to_string(),
            entity: None,
        }
    }
}

#[derive(Deserialize)]
struct GraphqlReply<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct ViewerData {
    viewer: Option<Viewer>,
}

#[derive(Deserialize)]
struct Viewer {
    entity: String,
}

/// Sender bound to one registered run.
pub struct WandbSender {
    client: reqwest::Client,
    api_key: Secret<String>,
    base_url: String,
    entity: String,
    project: String,
    run: String,
    description: String,
    step: AtomicU64,
}

impl WandbSender {
    /// Log in with `api_key` and register a fresh run.
    pub async fn connect(
        client: reqwest::Client,
        api_key: Secret<String>,
        options: WandbOptions,
        description: String,
    ) -> Result<Self> {
        let base_url = options.base_url.trim_end_matches('/').to_string();

        let viewer: ViewerData =
            graphql(&client, &base_url, &api_key, VIEWER_QUERY, serde_json::json!({})).await?;
        let viewer = viewer
            .viewer
            .ok_or_else(|| Error::Auth("API key not associated with a user".into()))?;
        let entity = options.entity.unwrap_or(viewer.entity);

        let run = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let _: serde_json::Value = graphql(
            &client,
            &base_url,
            &api_key,
            UPSERT_RUN_MUTATION,
            serde_json::json!({ "name": run, "project": options.project, "entity": entity }),
        )
        .await?;

        info!(sender = "wandb", entity = %entity, project = %options.project, run = %run, "registered run");
        Ok(Self {
            client,
            api_key,
            base_url,
            entity,
            project: options.project,
            run,
            description,
            step: AtomicU64::new(0),
        })
    }

    /// Run id assigned at construction.
    pub fn run(&self) -> &str {
        &self.run
    }

    async fn log(&self, message: &Message) -> Result<()> {
        let step = self.step.fetch_add(1, Ordering::Relaxed);
        let row = history_row(message, step);
        let url = format!(
            "{}/files/{}/{}/{}/file_stream",
            self.base_url, self.entity, self.project, self.run
        );
        let mut files = serde_json::Map::new();
        files.insert(
            HISTORY_FILE.to_string(),
            serde_json::json!({ "offset": step, "content": [row.to_string()] }),
        );
        let body = serde_json::json!({ "files": files });

        let response = self
            .client
            .post(&url)
            .basic_auth("api", Some(self.api_key.expose()))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("wandb file stream request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::Response(format!("file stream returned {status}: {body}")));
        }
        debug!(sender = "wandb", step, "history row streamed");
        Ok(())
    }
}

/// One history row: the message's values plus the `_step` counter.
fn history_row(message: &Message, step: u64) -> serde_json::Value {
    let mut row = serde_json::Map::new();
    match message {
        Message::Metrics(values) => {
            for (name, value) in values {
                row.insert(name.clone(), serde_json::json!(value));
            }
        }
        Message::Text(text) => {
            row.insert("message".into(), serde_json::json!(text));
        }
    }
    row.insert("_step".into(), serde_json::json!(step));
    serde_json::Value::Object(row)
}

async fn graphql<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &Secret<String>,
    query: &str,
    variables: serde_json::Value,
) -> Result<T> {
    let response = client
        .post(format!("{base_url}/graphql"))
        .basic_auth("api", Some(api_key.expose()))
        .json(&serde_json::json!({ "query": query, "variables": variables }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("wandb graphql request failed: {e}")))?;

    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(Error::Auth(format!("wandb rejected API key ({status})")));
    }
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Response(format!("graphql returned {status}: {body}")));
    }

    let reply: GraphqlReply<T> = response
        .json()
        .await
        .map_err(|e| Error::Response(format!("invalid graphql reply: {e}")))?;
    if let Some(first) = reply.errors.first() {
        return Err(Error::Response(format!("graphql error: {first}")));
    }
    reply
        .data
        .ok_or_else(|| Error::Response("graphql reply without data".into()))
}

impl Notifier for WandbSender {
    fn name(&self) -> &str {
        "wandb"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn send<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.log(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Seen = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    /// Mock wandb API. Rejects requests whose basic auth is not `api:good-key`.
    async fn start_wandb() -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        tokio::spawn(async move {
            let app = axum::Router::new().fallback(
                move |uri: Uri, headers: HeaderMap, body: axum::Json<serde_json::Value>| {
                    let sink = sink.clone();
                    async move {
                        // base64("api:good-key")
                        let authorized = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            == Some("Basic YXBpOmdvb2Qta2V5");
                        if !authorized {
                            return (StatusCode::UNAUTHORIZED, axum::Json(serde_json::json!({})));
                        }
                        let path = uri.path().to_string();
                        sink.lock().unwrap().push((path.clone(), body.0.clone()));
                        let reply = if path == "/graphql" {
                            let query = body.0["query"].as_str().unwrap_or("");
                            if query.contains("viewer") {
                                serde_json::json!({"data": {"viewer": {"id": "u1", "entity": "team-a"}}})
                            } else {
                                serde_json::json!({"data": {"upsertBucket": {"bucket": {"id": "b1", "name": "run"}}}})
                            }
                        } else {
                            serde_json::json!({"exitcode": null})
                        };
                        (StatusCode::OK, axum::Json(reply))
                    }
                },
            );
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), seen)
    }

    fn options(base_url: &str) -> WandbOptions {
        WandbOptions {
            base_url: base_url.to_string(),
            project: "rotation-test".into(),
            entity: None,
        }
    }

    #[tokio::test]
    async fn connect_logs_in_and_registers_run() {
        let (url, seen) = start_wandb().await;
        let sender = WandbSender::connect(
            reqwest::Client::new(),
            Secret::new("good-key".into()),
            options(&url),
            "metrics".into(),
        )
        .await
        .unwrap();

        assert_eq!(sender.entity, "team-a");
        assert_eq!(sender.run().len(), 8);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].1["query"].as_str().unwrap().contains("viewer"));
        assert_eq!(seen[1].1["variables"]["project"], "rotation-test");
        assert_eq!(seen[1].1["variables"]["entity"], "team-a");
    }

    #[tokio::test]
    async fn connect_with_bad_key_is_auth_error() {
        let (url, _seen) = start_wandb().await;
        let err = WandbSender::connect(
            reqwest::Client::new(),
            Secret::new("bad-key".into()),
            options(&url),
            "metrics".into(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn send_streams_history_rows_with_increasing_step() {
        let (url, seen) = start_wandb().await;
        let sender = WandbSender::connect(
            reqwest::Client::new(),
            Secret::new("good-key".into()),
            options(&url),
            "metrics".into(),
        )
        .await
        .unwrap();

        let mut values = BTreeMap::new();
        values.insert("completed".to_string(), 3.0);
        sender.send(&Message::from(values)).await.unwrap();
        sender.send(&Message::from("pool exhausted")).await.unwrap();

        let seen = seen.lock().unwrap();
        let streams: Vec<_> = seen
            .iter()
            .filter(|(path, _)| path.ends_with("/file_stream"))
            .collect();
        assert_eq!(streams.len(), 2);
        assert!(streams[0].0.starts_with("/files/team-a/rotation-test/"));

        let first = &streams[0].1["files"][HISTORY_FILE];
        assert_eq!(first["offset"], 0);
        let row: serde_json::Value =
            serde_json::from_str(first["content"][0].as_str().unwrap()).unwrap();
        assert_eq!(row["completed"], 3.0);
        assert_eq!(row["_step"], 0);

        let second = &streams[1].1["files"][HISTORY_FILE];
        let row: serde_json::Value =
            serde_json::from_str(second["content"][0].as_str().unwrap()).unwrap();
        assert_eq!(row["message"], "pool exhausted");
        assert_eq!(row["_step"], 1);
    }

    #[test]
    fn history_row_for_text() {
        let row = history_row(&Message::from("hi"), 7);
        assert_eq!(row, serde_json::json!({"message": "hi", "_step": 7}));
    }
}
