//! Configuration types and loading
//!
//! Config path precedence: `--config` > `CONFIG_PATH` env var > `key-fanout.toml`.
//! The wandb API key is never read from the TOML; it comes from `API_KEY`
//! (see `notifier::API_KEY_ENV`) so secrets stay out of config files.

use credential_pool::{PoolConfig, RetryPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub pool: PoolSection,
    #[serde(default)]
    pub retry: RetrySection,
    pub upstream: UpstreamConfig,
    pub job: JobConfig,
    #[serde(default)]
    pub notifier: Option<NotifierConfig>,
}

/// Credential files
#[derive(Debug, Deserialize)]
pub struct PoolSection {
    pub candidate_file: PathBuf,
    pub exhausted_file: PathBuf,
    /// Cap on usable credentials; absent means all of them
    #[serde(default)]
    pub limit: Option<usize>,
}

impl PoolSection {
    pub fn pool_config(&self) -> PoolConfig {
        let config = PoolConfig::new(&self.candidate_file, &self.exhausted_file);
        match self.limit {
            Some(limit) => config.with_limit(limit),
            None => config,
        }
    }
}

/// Backoff durations and retry cap
#[derive(Debug, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_connection_backoff")]
    pub connection_backoff_secs: u64,
    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limit_backoff_secs: u64,
    #[serde(default = "default_api_error_backoff")]
    pub api_error_backoff_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retry forever; `max_retries` is ignored
    #[serde(default)]
    pub unbounded: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            connection_backoff_secs: default_connection_backoff(),
            rate_limit_backoff_secs: default_rate_limit_backoff(),
            api_error_backoff_secs: default_api_error_backoff(),
            max_retries: default_max_retries(),
            unbounded: false,
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            connection_backoff: Duration::from_secs(self.connection_backoff_secs),
            rate_limit_backoff: Duration::from_secs(self.rate_limit_backoff_secs),
            api_error_backoff: Duration::from_secs(self.api_error_backoff_secs),
            max_retries: (!self.unbounded).then_some(self.max_retries),
        }
    }
}

/// Chat-completions endpoint and sampling parameters
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_sampling")]
    pub temperature: f64,
    #[serde(default = "default_sampling")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Fan-out job settings
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    /// One prompt per line; blank lines are skipped
    pub prompts_file: PathBuf,
    /// JSON lines, one per prompt, in input order
    pub output_file: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Give up on a single prompt after this long, retries included
    #[serde(default)]
    pub prompt_deadline_secs: Option<u64>,
    /// Prometheus textfile written when the job ends
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
}

/// Error notification backend
#[derive(Debug, Deserialize)]
pub struct NotifierConfig {
    /// "lark" or "wandb"
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Lark webhook; falls back to `WEBHOOK_ADDR`
    #[serde(default)]
    pub webhook_addr: Option<String>,
    /// wandb project
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub entity: Option<String>,
    /// wandb API base URL
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_connection_backoff() -> u64 {
    5
}

fn default_rate_limit_backoff() -> u64 {
    15
}

fn default_api_error_backoff() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    10
}

fn default_sampling() -> f64 {
    1.0
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout() -> u64 {
    60
}

fn default_workers() -> usize {
    10
}

fn require_http(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )))
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http("upstream.base_url", &self.upstream.base_url)?;

        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream.timeout_secs must be greater than 0".into(),
            ));
        }

        if self.job.workers == 0 {
            return Err(common::Error::Config(
                "job.workers must be greater than 0".into(),
            ));
        }

        if self.pool.limit == Some(0) {
            return Err(common::Error::Config(
                "pool.limit must be greater than 0 (omit it to use every credential)".into(),
            ));
        }

        if self.job.prompt_deadline_secs == Some(0) {
            return Err(common::Error::Config(
                "job.prompt_deadline_secs must be greater than 0".into(),
            ));
        }

        if let Some(notifier) = &self.notifier {
            if let Some(url) = &notifier.webhook_addr {
                require_http("notifier.webhook_addr", url)?;
            }
            if let Some(url) = &notifier.base_url {
                require_http("notifier.base_url", url)?;
            }
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("key-fanout.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    const MINIMAL: &str = r#"
[pool]
candidate_file = "accounts/available.txt"
exhausted_file = "accounts/used.txt"

[upstream]
base_url = "https://api.openai.com/v1"
model = "gpt-3.5-turbo"

[job]
prompts_file = "prompts.txt"
output_file = "results.jsonl"
"#;

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write_config(&dir, MINIMAL)).unwrap();

        assert_eq!(config.upstream.temperature, 1.0);
        assert_eq!(config.upstream.top_p, 1.0);
        assert_eq!(config.upstream.max_tokens, 4096);
        assert_eq!(config.upstream.timeout_secs, 60);
        assert_eq!(config.job.workers, 10);
        assert!(config.job.metrics_file.is_none());
        assert!(config.notifier.is_none());
        assert_eq!(config.retry.policy(), RetryPolicy::default());

        let pool = config.pool.pool_config();
        assert_eq!(pool.candidate_file, PathBuf::from("accounts/available.txt"));
        assert_eq!(pool.limit, None);
    }

    #[test]
    fn full_config() {
        let dir = tempfile::tempdir().unwrap();
        let contents = r#"
[pool]
candidate_file = "a.txt"
exhausted_file = "u.txt"
limit = 3

[retry]
connection_backoff_secs = 1
rate_limit_backoff_secs = 2
api_error_backoff_secs = 3
unbounded = true

[upstream]
base_url = "http://localhost:8000/v1"
model = "local"
temperature = 0.2
max_tokens = 256

[job]
prompts_file = "p.txt"
output_file = "o.jsonl"
workers = 4
prompt_deadline_secs = 300
metrics_file = "fanout.prom"

[notifier]
name = "wandb"
project = "rotation"
base_url = "http://localhost:9000"
"#;
        let config = Config::load(&write_config(&dir, contents)).unwrap();

        assert_eq!(config.pool.pool_config().limit, Some(3));
        let policy = config.retry.policy();
        assert_eq!(policy.connection_backoff, Duration::from_secs(1));
        assert_eq!(policy.rate_limit_backoff, Duration::from_secs(2));
        assert_eq!(policy.api_error_backoff, Duration::from_secs(3));
        assert_eq!(policy.max_retries, None);
        assert_eq!(config.upstream.temperature, 0.2);
        assert_eq!(config.job.workers, 4);
        assert_eq!(config.job.prompt_deadline_secs, Some(300));
        let notifier = config.notifier.unwrap();
        assert_eq!(notifier.name, "wandb");
        assert_eq!(notifier.project.as_deref(), Some("rotation"));
    }

    #[test]
    fn missing_file_is_error() {
        assert!(Config::load(Path::new("/nonexistent/path/config.toml")).is_err());
    }

    #[test]
    fn invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&write_config(&dir, "not valid {{{{ toml")).is_err());
    }

    #[test]
    fn missing_section_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let without_job = MINIMAL.split("[job]").next().unwrap();
        assert!(Config::load(&write_config(&dir, without_job)).is_err());
    }

    #[test]
    fn base_url_without_scheme_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = MINIMAL.replace("https://api.openai.com/v1", "api.openai.com/v1");
        let err = Config::load(&write_config(&dir, &contents))
            .unwrap_err()
            .to_string();
        assert!(
            err.contains("upstream.base_url must start with http"),
            "error message should explain the issue, got: {err}"
        );
    }

    #[test]
    fn zero_workers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = format!("{MINIMAL}workers = 0\n");
        assert!(Config::load(&write_config(&dir, &contents)).is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = MINIMAL.replace(
            "model = \"gpt-3.5-turbo\"",
            "model = \"gpt-3.5-turbo\"\ntimeout_secs = 0",
        );
        assert!(Config::load(&write_config(&dir, &contents)).is_err());
    }

    #[test]
    fn zero_limit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = MINIMAL.replace(
            "exhausted_file = \"accounts/used.txt\"",
            "exhausted_file = \"accounts/used.txt\"\nlimit = 0",
        );
        assert!(Config::load(&write_config(&dir, &contents)).is_err());
    }

    #[test]
    fn bad_webhook_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let contents = format!("{MINIMAL}\n[notifier]\nname = \"lark\"\nwebhook_addr = \"hook\"\n");
        assert!(Config::load(&write_config(&dir, &contents)).is_err());
    }

    #[test]
    fn resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("key-fanout.toml"));
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
