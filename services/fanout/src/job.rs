//! Fan-out of prompts over the dispatcher, fan-in in input order
//!
//! Every prompt runs as its own session (fresh v4 UUID), so each one is
//! bound to a credential independently and rotates on its own. At most
//! `workers` prompts are in flight; results are sorted back into input
//! order before they are written.

use std::path::Path;
use std::time::Duration;

use credential_pool::{CallOptions, CancellationToken, Dispatcher};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::chat::ChatClient;

/// Run settings for one job.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub workers: usize,
    pub prompt_deadline: Option<Duration>,
}

/// Result of one prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub index: usize,
    pub session: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `ok` or the dispatcher error kind
    pub outcome: &'static str,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        self.response.is_some()
    }
}

/// Read prompts, one per line. Blank lines are skipped.
pub async fn load_prompts(path: &Path) -> std::io::Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Run every prompt and return the outcomes in input order.
///
/// A failed prompt does not stop the job; its error is kept in the outcome.
/// Cancelling `cancel` ends in-flight prompts with a `cancelled` outcome and
/// lets queued ones fail the same way.
pub async fn run(
    dispatcher: &Dispatcher,
    chat: &ChatClient,
    prompts: Vec<String>,
    settings: &JobSettings,
    cancel: &CancellationToken,
) -> Vec<Outcome> {
    let total = prompts.len();
    info!(prompts = total, workers = settings.workers, "starting fan-out");

    let mut outcomes: Vec<Outcome> = futures_util::stream::iter(prompts.into_iter().enumerate())
        .map(|(index, prompt)| run_one(dispatcher, chat, index, prompt, settings, cancel))
        .buffer_unordered(settings.workers.max(1))
        .collect()
        .await;
    outcomes.sort_by_key(|outcome| outcome.index);

    let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
    info!(prompts = total, failed, "fan-out finished");
    outcomes
}

async fn run_one(
    dispatcher: &Dispatcher,
    chat: &ChatClient,
    index: usize,
    prompt: String,
    settings: &JobSettings,
    cancel: &CancellationToken,
) -> Outcome {
    let session = uuid::Uuid::new_v4().to_string();
    let started = Instant::now();
    let mut options = CallOptions::default().with_cancel(cancel.clone());
    if let Some(deadline) = settings.prompt_deadline {
        options = options.with_timeout(deadline);
    }

    let text = prompt.as_str();
    let result = dispatcher
        .execute_with(&session, &options, move |credential| async move {
            chat.complete(&credential, text).await
        })
        .await;
    dispatcher.pool().end_session(&session).await;

    let (response, error, outcome) = match result {
        Ok(response) => (Some(response), None, "ok"),
        Err(e) => {
            warn!(index, session = %session, error = %e, "prompt failed");
            (None, Some(e.to_string()), e.kind())
        }
    };
    crate::metrics::record_prompt(outcome, started.elapsed().as_secs_f64());

    Outcome {
        index,
        session,
        prompt,
        response,
        error,
        outcome,
    }
}

/// Write outcomes as JSON lines.
pub async fn write_results(path: &Path, outcomes: &[Outcome]) -> anyhow::Result<()> {
    let mut out = String::new();
    for outcome in outcomes {
        out.push_str(&serde_json::to_string(outcome)?);
        out.push('\n');
    }
    tokio::fs::write(path, out).await?;
    Ok(())
}
