//! Notification senders for unrecoverable dispatch errors
//!
//! The dispatcher reports errors it cannot handle through the `Notifier`
//! capability. Two backends are provided:
//! - `lark`: chat webhook, text messages
//! - `wandb`: experiment tracker, numeric metrics streamed as history rows
//!
//! Backends are selected by name with `from_name`. Each setting can be passed
//! explicitly or picked up from the environment (`WEBHOOK_ADDR`, `API_KEY`).

pub mod error;
pub mod lark;
pub mod wandb;

pub use error::{Error, Result};
pub use lark::LarkSender;
pub use wandb::{WandbOptions, WandbSender};

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use common::Secret;

/// Environment variable holding the Lark webhook URL.
pub const WEBHOOK_ADDR_ENV: &str = "WEBHOOK_ADDR";

/// Environment variable holding the wandb API key.
pub const API_KEY_ENV: &str = "API_KEY";

/// A notification payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Free-form text (errors, warnings)
    Text(String),
    /// Named numeric values
    Metrics(BTreeMap<String, f64>),
}

impl Message {
    /// Render as a single line of text.
    pub fn to_text(&self) -> String {
        match self {
            Message::Text(text) => text.clone(),
            Message::Metrics(values) => values
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<BTreeMap<String, f64>> for Message {
    fn from(values: BTreeMap<String, f64>) -> Self {
        Message::Metrics(values)
    }
}

/// A destination for error and progress reports.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Notifier>`).
pub trait Notifier: Send + Sync {
    /// Backend name ("lark", "wandb")
    fn name(&self) -> &str;

    /// Human-readable description supplied at construction
    fn description(&self) -> &str;

    /// Deliver one message.
    fn send<'a>(&'a self, message: &'a Message)
    -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Construction settings shared by all backends.
#[derive(Debug, Default)]
pub struct NotifierOptions {
    pub description: Option<String>,
    /// Lark webhook URL; falls back to `WEBHOOK_ADDR`
    pub webhook_addr: Option<String>,
    /// wandb API key; falls back to `API_KEY`
    pub api_key: Option<Secret<String>>,
    pub wandb: WandbOptions,
}

/// Build a notifier by backend name.
///
/// `wandb` logs in and registers a run before returning, so construction
/// performs network I/O. Unknown names fail with `Error::Unsupported`.
pub async fn from_name(
    name: &str,
    options: NotifierOptions,
    client: reqwest::Client,
) -> Result<Arc<dyn Notifier>> {
    let description = options
        .description
        .unwrap_or_else(|| format!("This is a MessageSender of {name}"));
    match name {
        "lark" => {
            let webhook = resolve_setting(options.webhook_addr, WEBHOOK_ADDR_ENV).ok_or_else(|| {
                Error::MissingSetting(format!(
                    "lark webhook address: pass webhook_addr or set {WEBHOOK_ADDR_ENV}"
                ))
            })?;
            Ok(Arc::new(LarkSender::new(client, webhook, description)))
        }
        "wandb" => {
            let api_key = match options.api_key {
                Some(key) => key,
                None => resolve_setting(None, API_KEY_ENV)
                    .map(Secret::new)
                    .ok_or_else(|| {
                        Error::MissingSetting(format!(
                            "wandb API key: pass api_key or set {API_KEY_ENV}"
                        ))
                    })?,
            };
            let sender = WandbSender::connect(client, api_key, options.wandb, description).await?;
            Ok(Arc::new(sender))
        }
        other => Err(Error::Unsupported(other.to_string())),
    }
}

/// Explicit value wins; otherwise a non-empty environment variable.
fn resolve_setting(explicit: Option<String>, env: &str) -> Option<String> {
    explicit
        .or_else(|| std::env::var(env).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// Serializes tests that mutate environment variables. An async mutex,
    /// since the guard is held while `from_name` reads the environment.
    static ENV_MUTEX: Mutex<()> = Mutex::const_new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    #[tokio::test]
    async fn unknown_name_is_unsupported() {
        let err = from_name("pager", NotifierOptions::default(), reqwest::Client::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Unsupported(ref n) if n == "pager"));
        assert_eq!(err.to_string(), "pager not supported");
    }

    #[tokio::test]
    async fn lark_uses_explicit_webhook() {
        let options = NotifierOptions {
            webhook_addr: Some("http://127.0.0.1:9/hook".into()),
            description: Some("batch alerts".into()),
            ..Default::default()
        };
        let notifier = from_name("lark", options, reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(notifier.name(), "lark");
        assert_eq!(notifier.description(), "batch alerts");
    }

    #[tokio::test]
    async fn lark_falls_back_to_env() {
        let _lock = ENV_MUTEX.lock().await;
        unsafe { set_env(WEBHOOK_ADDR_ENV, "http://127.0.0.1:9/from-env") };
        let result = from_name("lark", NotifierOptions::default(), reqwest::Client::new()).await;
        unsafe { remove_env(WEBHOOK_ADDR_ENV) };

        let notifier = result.unwrap();
        assert_eq!(notifier.name(), "lark");
        assert_eq!(notifier.description(), "This is a MessageSender of lark");
    }

    #[tokio::test]
    async fn lark_without_webhook_is_missing_setting() {
        let _lock = ENV_MUTEX.lock().await;
        unsafe { remove_env(WEBHOOK_ADDR_ENV) };
        let err = from_name("lark", NotifierOptions::default(), reqwest::Client::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::MissingSetting(_)));
        assert!(err.to_string().contains(WEBHOOK_ADDR_ENV));
    }

    #[tokio::test]
    async fn wandb_without_key_is_missing_setting() {
        let _lock = ENV_MUTEX.lock().await;
        unsafe { remove_env(API_KEY_ENV) };
        let err = from_name("wandb", NotifierOptions::default(), reqwest::Client::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::MissingSetting(_)));
        assert!(err.to_string().contains(API_KEY_ENV));
    }

    #[test]
    fn metrics_message_renders_as_text() {
        let mut values = BTreeMap::new();
        values.insert("failed".to_string(), 2.0);
        values.insert("done".to_string(), 18.0);
        assert_eq!(Message::from(values).to_text(), "done=18, failed=2");
        assert_eq!(Message::from("boom").to_text(), "boom");
    }
}
