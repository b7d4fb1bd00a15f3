//! `export-api` and `export-sqlite`.
//!
//! Both print the export summary. Only a confirmed run writes
//! `<output-root>/<run-id>/export.json` and `summary.json`.
use anyhow::Result;
use clap::Args;
use std::path::{Path, PathBuf};
use tracing::info;

use super::resolve_run_id;
use crate::config::require_value;
use crate::error::MigrateError;
use crate::extract::api::{export_from_api, ApiSource, MIN_TIMEOUT_MS};
use crate::extract::sqlite::export_from_sqlite;
use crate::extract::{write_export, ExportSummary};
use crate::payload::ExportPayload;
use crate::safety::looks_like_production;
use crate::util::env as env_util;

pub const DEFAULT_OUTPUT_ROOT: &str = "./out/migrate/legacy_export";
pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;

#[derive(Args, Debug, Clone, Default)]
pub struct ExportApiArgs {
    /// Legacy API base URL (env LEGACY_API_BASE_URL)
    #[arg(long)]
    pub api_base_url: Option<String>,
    /// Legacy admin username (env LEGACY_API_USERNAME)
    #[arg(long)]
    pub username: Option<String>,
    /// Legacy admin password (env LEGACY_API_PASSWORD)
    #[arg(long)]
    pub password: Option<String>,
    #[arg(long)]
    pub output_root: Option<PathBuf>,
    #[arg(long)]
    pub run_id: Option<String>,
    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,
    /// Write the export files; without it only the summary is printed
    #[arg(long, default_value_t = false)]
    pub confirm: bool,
}

#[derive(Debug, Clone)]
pub struct ExportApiConfig {
    pub source: ApiSource,
    pub output_root: PathBuf,
    pub run_id: String,
    pub confirm: bool,
}

impl ExportApiArgs {
    pub fn resolve(self) -> Result<ExportApiConfig> {
        let base_url = require_value(
            self.api_base_url.or_else(|| env_util::env_opt("LEGACY_API_BASE_URL")),
            "--api-base-url",
        )?;
        let username = require_value(
            self.username.or_else(|| env_util::env_opt("LEGACY_API_USERNAME")),
            "--username",
        )?;
        // Passwords keep their surrounding whitespace.
        let password = self
            .password
            .or_else(|| env_util::env_opt("LEGACY_API_PASSWORD"))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| crate::error::config_err("--password is required"))?;
        Ok(ExportApiConfig {
            source: ApiSource {
                base_url: base_url.trim_end_matches('/').to_string(),
                username,
                password,
                timeout_ms: self.timeout_ms.max(MIN_TIMEOUT_MS),
            },
            output_root: self.output_root.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_ROOT)),
            run_id: resolve_run_id(self.run_id),
            confirm: self.confirm,
        })
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ExportSqliteArgs {
    /// Path to the legacy SQLite database
    #[arg(long)]
    pub sqlite_path: Option<PathBuf>,
    /// Allow a source path that looks like production
    #[arg(long, default_value_t = false)]
    pub i_know_what_im_doing: bool,
    #[arg(long)]
    pub output_root: Option<PathBuf>,
    #[arg(long)]
    pub run_id: Option<String>,
    #[arg(long, default_value_t = false)]
    pub confirm: bool,
}

#[derive(Debug, Clone)]
pub struct ExportSqliteConfig {
    pub sqlite_path: PathBuf,
    pub output_root: PathBuf,
    pub run_id: String,
    pub confirm: bool,
}

impl ExportSqliteArgs {
    pub fn resolve(self) -> Result<ExportSqliteConfig> {
        let raw = self
            .sqlite_path
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| crate::error::config_err("--sqlite-path is required"))?;
        let shown = raw.display().to_string();
        if looks_like_production(&shown) && !self.i_know_what_im_doing {
            return Err(MigrateError::Safety(format!(
                "source {shown} looks like production; pass --i-know-what-im-doing to read it"
            ))
            .into());
        }
        Ok(ExportSqliteConfig {
            sqlite_path: raw,
            output_root: self.output_root.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_ROOT)),
            run_id: resolve_run_id(self.run_id),
            confirm: self.confirm,
        })
    }
}

fn finish(
    payload: &ExportPayload,
    summary: &ExportSummary,
    output_root: &Path,
    confirm: bool,
) -> Result<Option<PathBuf>> {
    println!("{}", summary.render());
    if !confirm {
        println!("dry-run: pass --confirm to write {}", output_root.join(&summary.run_id).display());
        return Ok(None);
    }
    let path = write_export(output_root, payload, summary)?;
    println!("export written to {}", path.display());
    Ok(Some(path))
}

/// Export from the legacy HTTP API. Returns the written path on a confirmed run.
pub async fn run_api(cfg: &ExportApiConfig) -> Result<Option<PathBuf>> {
    info!(run_id = %cfg.run_id, source = ?cfg.source, confirm = cfg.confirm, "starting api export");
    let payload = export_from_api(&cfg.source).await?;
    let mut summary = ExportSummary::for_payload(&cfg.run_id, &payload);
    summary.api_base_url = Some(cfg.source.base_url.clone());
    finish(&payload, &summary, &cfg.output_root, cfg.confirm)
}

/// Export from the legacy SQLite file. Returns the written path on a confirmed run.
pub async fn run_sqlite(cfg: &ExportSqliteConfig) -> Result<Option<PathBuf>> {
    let shown = cfg.sqlite_path.display().to_string();
    info!(run_id = %cfg.run_id, path = %shown, confirm = cfg.confirm, "starting sqlite export");
    let payload = export_from_sqlite(&shown).await?;
    let mut summary = ExportSummary::for_payload(&cfg.run_id, &payload);
    summary.source_path = Some(shown);
    finish(&payload, &summary, &cfg.output_root, cfg.confirm)
}
