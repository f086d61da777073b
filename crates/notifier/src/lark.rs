//! Lark (Feishu) chat webhook sender
//!
//! Posts `{"msg_type":"text","content":{"text":...}}` to a bot webhook. The
//! webhook answers with a JSON body carrying a `code`; a non-zero code or a
//! non-2xx status is logged and swallowed so that a broken alert channel
//! never masks the error being reported.

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::{Message, Notifier};

#[derive(Serialize)]
struct TextPayload<'a> {
    msg_type: &'static str,
    content: TextContent<'a>,
}

#[derive(Serialize)]
struct TextContent<'a> {
    text: &'a str,
}

/// Webhook-backed text sender.
pub struct LarkSender {
    client: reqwest::Client,
    webhook_addr: String,
    description: String,
}

impl LarkSender {
    pub fn new(client: reqwest::Client, webhook_addr: String, description: String) -> Self {
        Self {
            client,
            webhook_addr,
            description,
        }
    }

    async fn post(&self, text: &str) -> Result<()> {
        let payload = TextPayload {
            msg_type: "text",
            content: TextContent { text },
        };
        let response = self
            .client
            .post(&self.webhook_addr)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Http(format!("lark webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            warn!(sender = "lark", %status, body, "webhook rejected message");
            return Ok(());
        }

        match response.json::<serde_json::Value>().await {
            Ok(reply) => {
                let code = reply.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
                if code != 0 {
                    let msg = reply.get("msg").and_then(|m| m.as_str()).unwrap_or("");
                    warn!(sender = "lark", code, msg, "webhook returned error code");
                } else {
                    debug!(sender = "lark", "message delivered");
                }
            }
            Err(e) => {
                warn!(sender = "lark", error = %e, "webhook reply was not JSON");
            }
        }
        Ok(())
    }
}

impl Notifier for LarkSender {
    fn name(&self) -> &str {
        "lark"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn send<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.post(&message.to_text()).await })
    }
}
