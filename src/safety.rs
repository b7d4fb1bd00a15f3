//! Write gate for every command that touches a target database.
//!
//! Without `--confirm` a run is always a dry-run. With `--confirm`, a target
//! that looks like production (or `--env prod`) also needs
//! `--confirm-production`; otherwise the run stops before any connection
//! is opened.
use anyhow::Result;
use serde::Serialize;
use std::net::IpAddr;
use tracing::warn;

use crate::config::{Environment, TargetConfig};
use crate::error::MigrateError;

const PROD_KEYWORDS: [&str; 4] = ["prod", "production", "primary", "master"];

const MANAGED_DB_DOMAINS: [&str; 6] = [
    "rds.amazonaws.com",
    "neon.tech",
    "supabase.co",
    "render.com",
    "railway.app",
    "aliyuncs.com",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionSignal {
    pub keyword: Option<&'static str>,
    pub managed_domain: Option<&'static str>,
    pub local_host: bool,
}

impl ProductionSignal {
    pub fn looks_like_production(&self) -> bool {
        (self.keyword.is_some() || self.managed_domain.is_some()) && !self.local_host
    }
}

fn extract_host(descriptor: &str) -> Option<String> {
    if let Ok(u) = url::Url::parse(descriptor) {
        if let Some(h) = u.host_str().filter(|h| !h.is_empty()) {
            return Some(h.trim_matches(['[', ']']).to_ascii_lowercase());
        }
        if let Some((_, h)) = u.query_pairs().find(|(k, _)| k == "host") {
            return Some(h.to_ascii_lowercase());
        }
    }
    // key=value DSN form
    descriptor
        .split_whitespace()
        .find_map(|part| part.strip_prefix("host="))
        .map(|h| h.to_ascii_lowercase())
}

fn is_local_host(host: &str) -> bool {
    // unix socket directory
    if host.starts_with('/') {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }
    host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local")
}

/// Inspect a connection descriptor.
pub fn inspect_target(descriptor: &str) -> ProductionSignal {
    let lower = descriptor.to_ascii_lowercase();
    let host = extract_host(descriptor);
    let keyword = PROD_KEYWORDS.iter().copied().find(|k| lower.contains(k));
    let managed_domain = host
        .as_deref()
        .and_then(|h| MANAGED_DB_DOMAINS.iter().copied().find(|d| h.contains(d)));
    ProductionSignal {
        keyword,
        managed_domain,
        local_host: host.as_deref().is_some_and(is_local_host),
    }
}

pub fn looks_like_production(descriptor: &str) -> bool {
    inspect_target(descriptor).looks_like_production()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    DryRun,
    Write,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub mode: RunMode,
    pub production_like: bool,
    pub signal: ProductionSignal,
    /// Human-readable notes printed with the plan.
    pub notes: Vec<String>,
}

impl GateDecision {
    pub fn is_dry_run(&self) -> bool {
        self.mode == RunMode::DryRun
    }
}

/// Decide whether this run may write.
pub fn evaluate(target: &TargetConfig) -> Result<GateDecision> {
    let signal = inspect_target(&target.database_url);
    let production_like = signal.looks_like_production();
    let strict = production_like || target.env == Environment::Prod;
    let mut notes = Vec::new();

    if production_like {
        let why = signal
            .managed_domain
            .map(|d| format!("managed database domain `{d}`"))
            .or_else(|| signal.keyword.map(|k| format!("keyword `{k}`")))
            .unwrap_or_default();
        notes.push(format!("target {} looks like production ({why})", target.redacted_url()));
    }

    if !target.confirm {
        if target.confirm_production {
            warn!("--confirm-production given without --confirm; running dry-run only");
            notes.push("--confirm-production has no effect without --confirm".into());
        }
        notes.push("dry-run: no --confirm flag, nothing will be written".into());
        return Ok(GateDecision {
            mode: RunMode::DryRun,
            production_like,
            signal,
            notes,
        });
    }

    if strict && !target.confirm_production {
        let reason = if production_like {
            format!(
                "target {} looks like production; pass --confirm-production in addition to --confirm",
                target.redacted_url()
            )
        } else {
            "--env prod requires --confirm-production in addition to --confirm".to_string()
        };
        return Err(MigrateError::Safety(reason).into());
    }

    if production_like && target.env != Environment::Prod {
        warn!(env = %target.env, "production-like target confirmed while --env is not prod");
        notes.push(format!(
            "target looks like production but --env is {}; proceeding on explicit confirmation",
            target.env
        ));
    }

    Ok(GateDecision {
        mode: RunMode::Write,
        production_like,
        signal,
        notes,
    })
}
