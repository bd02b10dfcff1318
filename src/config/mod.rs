//! Engine settings.
//!
//! Sources, lowest precedence first: `config/default`, `reactive-query`, the
//! `--config-file` path, `REACTIVE_QUERY__*` environment variables, then CLI
//! overrides. Feature sections inherit every unset field from `[defaults]`.

use std::{collections::BTreeMap, str::FromStr};

use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;
use crate::query::{FeaturePolicy, QueryOptions};

mod cli;

pub use cli::{CheckArgs, CliArgs, Command, EngineOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "reactive-query";
const ENV_PREFIX: &str = "REACTIVE_QUERY";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Everything a `QueryClient` needs: cache sizing plus per-feature policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    /// Policy for features without their own section.
    pub defaults: FeaturePolicy,
    /// Fully merged policies keyed by feature name.
    pub features: BTreeMap<String, FeaturePolicy>,
}

impl EngineConfig {
    /// Policy for `feature`, falling back to the defaults.
    pub fn policy(&self, feature: &str) -> &FeaturePolicy {
        self.features.get(feature).unwrap_or(&self.defaults)
    }

    pub fn query_options(&self, feature: &str) -> QueryOptions {
        QueryOptions::from(self.policy(feature))
    }

    /// Register or replace a feature policy.
    pub fn with_feature(mut self, name: impl Into<String>, policy: FeaturePolicy) -> Self {
        self.features.insert(name.into(), policy);
        self
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Merge every source and validate the result.
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Check(args)) => raw.apply_overrides(&args.overrides),
        None => raw.apply_overrides(&EngineOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Parse process arguments, then load settings with them.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: CacheConfig,
    logging: RawLoggingSettings,
    defaults: FeaturePolicy,
    features: BTreeMap<String, RawFeaturePolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

/// A `[features.<name>]` section; unset fields inherit `[defaults]`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFeaturePolicy {
    stale_time_ms: Option<u64>,
    cache_time_ms: Option<u64>,
    retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

impl RawFeaturePolicy {
    fn merge_onto(self, defaults: &FeaturePolicy) -> FeaturePolicy {
        FeaturePolicy {
            stale_time_ms: self.stale_time_ms.unwrap_or(defaults.stale_time_ms),
            cache_time_ms: self.cache_time_ms.unwrap_or(defaults.cache_time_ms),
            retries: self.retries.unwrap_or(defaults.retries),
            backoff_base_ms: self.backoff_base_ms.unwrap_or(defaults.backoff_base_ms),
            max_backoff_ms: self.max_backoff_ms.or(defaults.max_backoff_ms),
            timeout_ms: self.timeout_ms.or(defaults.timeout_ms),
        }
    }
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max_entries) = overrides.cache_max_entries {
            self.cache.max_entries = max_entries;
        }
        if let Some(interval) = overrides.cache_sweep_interval_ms {
            self.cache.sweep_interval_ms = interval;
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            cache,
            logging,
            defaults,
            features,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let engine = build_engine_config(cache, defaults, features)?;

        Ok(Self { logging, engine })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_engine_config(
    cache: CacheConfig,
    defaults: FeaturePolicy,
    features: BTreeMap<String, RawFeaturePolicy>,
) -> Result<EngineConfig, LoadError> {
    if cache.default_cache_time_ms == 0 {
        return Err(LoadError::invalid(
            "cache.default_cache_time_ms",
            "must be greater than zero",
        ));
    }
    if cache.default_stale_time_ms > cache.default_cache_time_ms {
        return Err(LoadError::invalid(
            "cache.default_stale_time_ms",
            "must not exceed cache.default_cache_time_ms",
        ));
    }
    validate_policy("defaults", &defaults)?;

    let mut merged = BTreeMap::new();
    for (name, raw) in features {
        if name.trim().is_empty() {
            return Err(LoadError::invalid("features", "feature names must not be empty"));
        }
        let policy = raw.merge_onto(&defaults);
        validate_policy(&format!("features.{name}"), &policy)?;
        merged.insert(name, policy);
    }

    Ok(EngineConfig {
        cache,
        defaults,
        features: merged,
    })
}

fn validate_policy(key: &str, policy: &FeaturePolicy) -> Result<(), LoadError> {
    policy
        .validate()
        .map_err(|err| LoadError::invalid(key, err.to_string()))?;
    if policy.timeout_ms == Some(0) {
        return Err(LoadError::invalid(
            format!("{key}.timeout_ms"),
            "must be greater than zero when set",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
