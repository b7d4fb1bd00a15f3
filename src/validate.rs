//! Read-only diagnostics over a payload and the current target.
//!
//! Nothing here fails on dirty data: problems become advisory strings or
//! counts that travel with the payload and the reports.
use anyhow::Result;
use itertools::Itertools;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write as _;

use crate::merge::{BreederMatch, ImportPlan, ProductOrigin};
use crate::normalization::{code_key, normalize_string};
use crate::payload::{ExportPayload, LegacyProduct};
use crate::store::{TargetStore, TargetTable};

fn code_issues(kind: &str, rows: &[LegacyProduct], issues: &mut Vec<String>) {
    for row in rows {
        if normalize_string(row.code.as_deref()).is_none() {
            issues.push(format!("{kind} {} has empty code", row.legacy_id));
        }
    }
    let duplicated = rows
        .iter()
        .filter_map(|r| normalize_string(r.code.as_deref()))
        .map(|c| code_key(&c))
        .duplicates()
        .sorted();
    for key in duplicated {
        issues.push(format!("duplicate {kind} code {key}"));
    }
}

/// Payload self-check, run by both exporters and again by the importer.
pub fn collect_validation_issues(payload: &ExportPayload) -> Vec<String> {
    let mut issues = Vec::new();

    for (kind, rows) in [("product", &payload.products), ("breeder", &payload.breeders)] {
        for row in rows.iter().filter(|r| r.legacy_id.trim().is_empty()) {
            issues.push(format!(
                "{kind} without legacy id (code {})",
                row.code.as_deref().unwrap_or("-")
            ));
        }
    }
    code_issues("product", &payload.products, &mut issues);
    code_issues("breeder", &payload.breeders, &mut issues);

    for b in &payload.breeders {
        if normalize_string(b.series_legacy_id.as_deref()).is_none() {
            issues.push(format!("breeder {} missing seriesLegacyId", b.legacy_id));
        }
    }

    let animal_ids: HashSet<&str> = payload
        .products
        .iter()
        .chain(payload.breeders.iter())
        .map(|p| p.legacy_id.trim())
        .collect();
    for img in &payload.product_images {
        if normalize_string(img.url.as_deref()).is_none() {
            issues.push(format!("image {} has empty url", img.legacy_id));
        }
        if !animal_ids.contains(img.legacy_product_id.trim()) {
            issues.push(format!(
                "image {} references missing product {}",
                img.legacy_id, img.legacy_product_id
            ));
        }
    }

    let breeder_ids: HashSet<&str> = payload.breeders.iter().map(|b| b.legacy_id.trim()).collect();
    for ev in &payload.breeder_events {
        if !breeder_ids.contains(ev.legacy_breeder_id.trim()) {
            issues.push(format!(
                "event {} references missing breeder {}",
                ev.legacy_id, ev.legacy_breeder_id
            ));
        }
        if normalize_string(ev.event_date.as_deref()).is_none() {
            issues.push(format!("event {} has empty eventDate", ev.legacy_id));
        }
    }
    issues
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflict {
    pub breeder_id: String,
    pub code: String,
    pub candidate_product_ids: Vec<String>,
    pub picked_product_id: Option<String>,
}

impl From<&BreederMatch> for MergeConflict {
    fn from(m: &BreederMatch) -> Self {
        Self {
            breeder_id: m.breeder_id.clone(),
            code: m.code.clone(),
            candidate_product_ids: m.candidate_product_ids.clone(),
            picked_product_id: m.picked_product_id.clone(),
        }
    }
}

/// Outcome of the breeder/product reconciliation, without writing anything.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeDiagnostics {
    pub legacy_products: usize,
    pub legacy_breeders: usize,
    pub planned_products: usize,
    pub merged: usize,
    pub breeder_only: usize,
    pub conflicts: Vec<MergeConflict>,
    pub unmatched_breeder_ids: Vec<String>,
    pub skipped_no_series: Vec<String>,
    pub skipped_no_code: Vec<String>,
}

impl MergeDiagnostics {
    pub fn from_plan(payload: &ExportPayload, plan: &ImportPlan) -> Self {
        Self {
            legacy_products: payload.products.len(),
            legacy_breeders: payload.breeders.len(),
            planned_products: plan.products.len(),
            merged: plan.count_origin(ProductOrigin::Merged),
            breeder_only: plan.count_origin(ProductOrigin::BreederOnly),
            conflicts: plan.conflicts().map(MergeConflict::from).collect(),
            unmatched_breeder_ids: plan.unmatched().map(|m| m.breeder_id.clone()).collect(),
            skipped_no_series: plan.skips.breeders_no_series.clone(),
            skipped_no_code: plan
                .skips
                .products_no_code
                .iter()
                .chain(plan.skips.breeders_no_code.iter())
                .cloned()
                .collect(),
        }
    }

    /// Issue lines carried into reports.
    pub fn issues(&self) -> Vec<String> {
        let mut out = Vec::new();
        for c in &self.conflicts {
            out.push(format!(
                "breeder {} code {} matches {} products [{}]; picked {}",
                c.breeder_id,
                c.code,
                c.candidate_product_ids.len(),
                c.candidate_product_ids.join(", "),
                c.picked_product_id.as_deref().unwrap_or("-")
            ));
        }
        for id in &self.skipped_no_series {
            out.push(format!("breeder {id} skipped: no series"));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntityPreview {
    pub planned: usize,
    pub likely_create: usize,
    pub likely_update: usize,
}

impl EntityPreview {
    fn from_existing(planned: usize, existing: i64) -> Self {
        let existing = usize::try_from(existing).unwrap_or(0).min(planned);
        Self {
            planned,
            likely_create: planned - existing,
            likely_update: existing,
        }
    }
}

/// What a confirmed import would do against the current target.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DryRunPreview {
    pub tenant_slug: String,
    pub tenant_exists: bool,
    pub admin_email: String,
    pub admin_exists: bool,
    pub series: EntityPreview,
    pub products: EntityPreview,
    pub events_planned: usize,
    pub images_planned: usize,
    pub featured_planned: usize,
    pub merge: MergeDiagnostics,
}

/// Inputs for [`preview_import`].
pub struct PreviewInput<'a> {
    pub payload: &'a ExportPayload,
    pub plan: &'a ImportPlan,
    pub series_codes: &'a [String],
    pub tenant_slug: &'a str,
    pub admin_email: &'a str,
}

pub async fn preview_import(store: &dyn TargetStore, input: PreviewInput<'_>) -> Result<DryRunPreview> {
    let tenant_id = store.find_tenant_id(input.tenant_slug).await?;
    let admin_exists = store.find_user_id(input.admin_email).await?.is_some();
    let product_codes: Vec<String> = input.plan.products.iter().map(|p| p.code.clone()).collect();

    let (series_existing, product_existing) = match &tenant_id {
        Some(tid) => (
            store
                .count_existing_codes(TargetTable::Series, tid, input.series_codes)
                .await?,
            store
                .count_existing_codes(TargetTable::Products, tid, &product_codes)
                .await?,
        ),
        None => (0, 0),
    };

    Ok(DryRunPreview {
        tenant_slug: input.tenant_slug.to_string(),
        tenant_exists: tenant_id.is_some(),
        admin_email: input.admin_email.to_string(),
        admin_exists,
        series: EntityPreview::from_existing(input.series_codes.len(), series_existing),
        products: EntityPreview::from_existing(product_codes.len(), product_existing),
        events_planned: input.payload.breeder_events.len(),
        images_planned: input.payload.product_images.len(),
        featured_planned: input.payload.featured_products.iter().filter(|f| f.is_active).count(),
        merge: MergeDiagnostics::from_plan(input.payload, input.plan),
    })
}

impl DryRunPreview {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let yes_no = |b: bool| if b { "exists" } else { "will be created" };
        let _ = writeln!(out, "tenant {}: {}", self.tenant_slug, yes_no(self.tenant_exists));
        let _ = writeln!(out, "admin {}: {}", self.admin_email, yes_no(self.admin_exists));
        for (label, p) in [("series", self.series), ("products", self.products)] {
            let _ = writeln!(
                out,
                "{label}: {} planned, ~{} create, ~{} update",
                p.planned, p.likely_create, p.likely_update
            );
        }
        let _ = writeln!(out, "events: {} in payload", self.events_planned);
        let _ = writeln!(out, "images: {} in payload", self.images_planned);
        let _ = writeln!(out, "featured: {} active", self.featured_planned);
        let m = &self.merge;
        let _ = writeln!(
            out,
            "merge: {} products + {} breeders -> {} rows ({} merged, {} breeder-only)",
            m.legacy_products, m.legacy_breeders, m.planned_products, m.merged, m.breeder_only
        );
        let _ = writeln!(
            out,
            "merge: {} conflicts, {} unmatched breeders, {} skipped without series",
            m.conflicts.len(),
            m.unmatched_breeder_ids.len(),
            m.skipped_no_series.len()
        );
        for line in m.issues() {
            let _ = writeln!(out, "  - {line}");
        }
        out
    }
}
