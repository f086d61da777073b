//! key-fanout
//!
//! Batch driver for the credential pool:
//! 1. Loads the pool once (process-wide cell) from the candidate and exhausted files
//! 2. Fans prompts out over a chat-completions endpoint, one session per prompt
//! 3. Retries and rotates credentials through the dispatcher
//! 4. Writes results in input order and a Prometheus textfile snapshot

mod chat;
mod config;
mod job;
mod metrics;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use credential_pool::{CancellationToken, Dispatcher};
use notifier::{Message, NotifierOptions, WandbOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::chat::ChatClient;
use crate::config::{Config, NotifierConfig};
use crate::job::JobSettings;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, LOG_LEVEL then RUST_LOG, default info
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting key-fanout");

    // Installed before the pool so its gauge is captured
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        candidate_file = %config.pool.candidate_file.display(),
        exhausted_file = %config.pool.exhausted_file.display(),
        base_url = %config.upstream.base_url,
        model = %config.upstream.model,
        workers = config.job.workers,
        "configuration loaded"
    );

    let pool = credential_pool::global()
        .get_or_load(config.pool.pool_config())
        .await
        .context("failed to load credential pool")?;

    let http = reqwest::Client::new();
    let mut dispatcher = Dispatcher::new(pool.clone()).with_policy(config.retry.policy());
    let notifier = match &config.notifier {
        Some(settings) => {
            let notifier = notifier::from_name(&settings.name, notifier_options(settings), http)
                .await
                .with_context(|| format!("failed to set up {} notifier", settings.name))?;
            info!(notifier = notifier.name(), "notifier ready");
            dispatcher = dispatcher.with_notifier(notifier.clone());
            Some(notifier)
        }
        None => None,
    };

    let chat = ChatClient::new(&config.upstream).context("failed to build HTTP client")?;
    let prompts = job::load_prompts(&config.job.prompts_file)
        .await
        .with_context(|| {
            format!(
                "failed to read prompts from {}",
                config.job.prompts_file.display()
            )
        })?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let settings = JobSettings {
        workers: config.job.workers,
        prompt_deadline: config.job.prompt_deadline_secs.map(Duration::from_secs),
    };
    let outcomes = job::run(&dispatcher, &chat, prompts, &settings, &cancel).await;

    job::write_results(&config.job.output_file, &outcomes)
        .await
        .with_context(|| {
            format!(
                "failed to write results to {}",
                config.job.output_file.display()
            )
        })?;

    let completed = outcomes.iter().filter(|o| o.is_ok()).count();
    let exhausted = pool.exhausted_this_run().await.len();
    let health = pool.health().await;
    info!(
        output = %config.job.output_file.display(),
        completed,
        failed = outcomes.len() - completed,
        exhausted_this_run = exhausted,
        health = %health,
        "job finished"
    );

    if let Some(notifier) = &notifier {
        let summary = BTreeMap::from([
            ("prompts".to_string(), outcomes.len() as f64),
            ("completed".to_string(), completed as f64),
            ("failed".to_string(), (outcomes.len() - completed) as f64),
            ("exhausted_this_run".to_string(), exhausted as f64),
            (
                "available_credentials".to_string(),
                pool.available_count() as f64,
            ),
        ]);
        if let Err(e) = notifier.send(&Message::from(summary)).await {
            warn!(error = %e, "failed to send job summary");
        }
    }

    if let Some(path) = &config.job.metrics_file {
        metrics::write_snapshot(&prometheus_handle, path)
            .await
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "metrics snapshot written");
    }

    Ok(())
}

fn notifier_options(settings: &NotifierConfig) -> NotifierOptions {
    let defaults = WandbOptions::default();
    NotifierOptions {
        description: settings.description.clone(),
        webhook_addr: settings.webhook_addr.clone(),
        api_key: None,
        wandb: WandbOptions {
            base_url: settings.base_url.clone().unwrap_or(defaults.base_url),
            project: settings.project.clone().unwrap_or(defaults.project),
            entity: settings.entity.clone(),
        },
    }
}

/// Cancel in-flight prompts on SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, cancelling in-flight prompts"),
        _ = terminate => info!("received SIGTERM, cancelling in-flight prompts"),
    }
    cancel.cancel();
}
