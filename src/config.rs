//! Run configuration shared by every command.
//!
//! Each command parses its own clap arguments, then builds one immutable
//! config value before any network or database work starts. Nothing below
//! the command layer reads the process environment.
use anyhow::Result;
use clap::{Args, ValueEnum};
use serde::Serialize;
use std::fmt;

use crate::error::config_err;
use crate::util::env as env_util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Staging,
    Prod,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        })
    }
}

/// Flags every target-writing command accepts.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Target database URL (defaults to DATABASE_URL and friends)
    #[arg(long)]
    pub database_url: Option<String>,
    /// Environment label for the target
    #[arg(long = "env", value_enum, default_value_t = Environment::Dev)]
    pub env: Environment,
    /// Enable writes; without it the run is a dry-run
    #[arg(long, default_value_t = false)]
    pub confirm: bool,
    /// Second confirmation required for production-like targets
    #[arg(long, alias = "confirm-prod", default_value_t = false)]
    pub confirm_production: bool,
}

/// Resolved target settings.
#[derive(Clone)]
pub struct TargetConfig {
    pub database_url: String,
    pub env: Environment,
    pub confirm: bool,
    pub confirm_production: bool,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("database_url", &env_util::redact_dsn(&self.database_url))
            .field("env", &self.env)
            .field("confirm", &self.confirm)
            .field("confirm_production", &self.confirm_production)
            .finish()
    }
}

impl TargetArgs {
    pub fn resolve(self) -> Result<TargetConfig> {
        let database_url = match self.database_url {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => env_util::db_url().map_err(|e| {
                config_err(format!(
                    "no target database configured; pass --database-url or set DATABASE_URL ({e})"
                ))
            })?,
        };
        Ok(TargetConfig {
            database_url,
            env: self.env,
            confirm: self.confirm,
            confirm_production: self.confirm_production,
        })
    }
}

impl TargetConfig {
    /// Local dev target, used by tests.
    pub fn for_url(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            env: Environment::Dev,
            confirm: false,
            confirm_production: false,
        }
    }

    pub fn redacted_url(&self) -> String {
        env_util::redact_dsn(&self.database_url)
    }
}

/// Non-empty trimmed value or a config error naming the flag.
pub fn require_value(value: Option<String>, flag: &str) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| config_err(format!("{flag} is required")))
}
