//! Harness configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::poll::PollConfig;
use crate::resources::ResourceLimits;

/// Environment for one scenario run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Re-check interval while a resource lock is contended.
    pub lock_poll_interval: Duration,
    /// Default resource lock acquisition timeout.
    pub lock_timeout: Duration,
    /// Convergence polling against the indexer.
    pub query_poll: PollConfig,
    pub output_path: PathBuf,
    /// First account-derivation index handed out by the key registry.
    pub start_key_id: u64,
    /// Continue from the previous snapshot's `next_key_id` instead of `start_key_id`.
    pub reuse_keys: bool,
    /// Keys reserved past `next_key_id` when a run is interrupted.
    pub interrupt_key_margin: u64,
    pub key_uri_prefix: String,
    /// Tip unit for decremental-tip ordering.
    pub tip_step: u64,
    pub resource_limits: ResourceLimits,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            lock_poll_interval: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(600),
            query_poll: PollConfig::default(),
            output_path: PathBuf::from("output.json"),
            start_key_id: 0,
            reuse_keys: false,
            interrupt_key_margin: 1000,
            key_uri_prefix: "//testing".to_string(),
            tip_step: 1,
            resource_limits: ResourceLimits::default(),
        }
    }
}

impl HarnessConfig {
    /// Read overrides from the process environment. Unset variables keep
    /// their defaults; malformed values are an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "LOCK_POLL_INTERVAL_MS")? {
            config.lock_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "LOCK_TIMEOUT_MS")? {
            config.lock_timeout = Duration::from_millis(ms);
        }
        let interval = parse_var::<u64, _>(&lookup, "QUERY_RETRY_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(config.query_poll.interval);
        let attempts = parse_var::<u32, _>(&lookup, "QUERY_MAX_ATTEMPTS")?
            .unwrap_or(config.query_poll.max_attempts);
        config.query_poll = PollConfig::new(interval, attempts);

        if let Some(path) = lookup("OUTPUT_PATH") {
            config.output_path = PathBuf::from(path);
        }
        if let Some(id) = parse_var::<u64, _>(&lookup, "START_KEY_ID")? {
            config.start_key_id = id;
        }
        if let Some(reuse) = parse_var::<bool, _>(&lookup, "REUSE_KEYS")? {
            config.reuse_keys = reuse;
        }
        if let Some(margin) = parse_var::<u64, _>(&lookup, "INTERRUPT_KEY_MARGIN")? {
            config.interrupt_key_margin = margin;
        }
        if let Some(prefix) = lookup("KEY_URI_PREFIX") {
            config.key_uri_prefix = prefix;
        }
        if let Some(step) = parse_var::<u64, _>(&lookup, "TIP_STEP")? {
            config.tip_step = step.max(1);
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {name}: '{raw}'"))
        })
        .transpose()
}
