//! Legacy extraction into the intermediate payload.
//!
//! Both sources end in [`finish_payload`], so share seeds, validation issues
//! and counts are derived the same way regardless of where records came from.
pub mod api;
pub mod records;
pub mod sqlite;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::payload::{ExportPayload, LegacyFeaturedProduct, LegacyShareSeed, LegacyUser};
use crate::report::write_json;
use crate::validate::collect_validation_issues;

pub const DEFAULT_TENANT_SLUG: &str = "turtle-album";
pub const DEFAULT_TENANT_NAME: &str = "Turtle Album";

/// One seed per active featured product, first occurrence wins.
pub fn derive_share_seeds(featured: &[LegacyFeaturedProduct]) -> Vec<LegacyShareSeed> {
    let mut seen = HashSet::new();
    featured
        .iter()
        .filter(|f| f.is_active)
        .filter(|f| seen.insert(f.legacy_product_id.trim().to_string()))
        .map(|f| LegacyShareSeed {
            legacy_product_id: f.legacy_product_id.trim().to_string(),
            strategy: Some("featured_product".to_string()),
        })
        .collect()
}

/// Users deduplicated by case-folded username, first occurrence wins.
pub fn dedupe_users(users: Vec<LegacyUser>) -> Vec<LegacyUser> {
    let mut seen = HashSet::new();
    users
        .into_iter()
        .filter(|u| !u.username.trim().is_empty())
        .filter(|u| seen.insert(u.username.trim().to_lowercase()))
        .collect()
}

/// Stamp, derive seeds and issues, refresh counts. `issues` are the
/// source-specific issues gathered while reading.
pub fn finish_payload(payload: &mut ExportPayload, issues: Vec<String>) {
    payload.exported_at = Some(Utc::now().to_rfc3339());
    payload.tenant.legacy_mode = Some("single_tenant".to_string());
    payload
        .tenant
        .suggested_slug
        .get_or_insert_with(|| DEFAULT_TENANT_SLUG.to_string());
    payload
        .tenant
        .suggested_name
        .get_or_insert_with(|| DEFAULT_TENANT_NAME.to_string());
    if payload.share_seeds.is_empty() {
        payload.share_seeds = derive_share_seeds(&payload.featured_products);
    }
    let mut all = issues;
    all.extend(collect_validation_issues(payload));
    payload.validation_issues = all;
    payload.refresh_counts();
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub run_id: String,
    pub exported_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub counts: BTreeMap<String, usize>,
    pub validation_issues: Vec<String>,
}

impl ExportSummary {
    pub fn for_payload(run_id: &str, payload: &ExportPayload) -> Self {
        Self {
            run_id: run_id.to_string(),
            exported_at: payload.exported_at.clone(),
            api_base_url: None,
            source_path: None,
            counts: payload.counts.clone(),
            validation_issues: payload.validation_issues.clone(),
        }
    }

    /// Console rendering used by both dry-run and confirmed exports.
    pub fn render(&self) -> String {
        let mut out = format!("export run {}\n", self.run_id);
        for (k, v) in &self.counts {
            out.push_str(&format!("  {k}: {v}\n"));
        }
        if !self.validation_issues.is_empty() {
            out.push_str(&format!("  first issues ({} total):\n", self.validation_issues.len()));
            for issue in self.validation_issues.iter().take(20) {
                out.push_str(&format!("    - {issue}\n"));
            }
        }
        out
    }
}

/// Write `<root>/<run_id>/export.json` and `summary.json`.
pub fn write_export(
    output_root: &Path,
    payload: &ExportPayload,
    summary: &ExportSummary,
) -> Result<PathBuf> {
    let dir = output_root.join(&summary.run_id);
    let export_path = dir.join("export.json");
    payload.save(&export_path)?;
    write_json(&dir.join("summary.json"), summary)?;
    info!(path = %export_path.display(), "export written");
    Ok(export_path)
}
