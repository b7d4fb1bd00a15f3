//! Post-write readback and report emission.
//!
//! Readback never trusts the writer's counters: it counts rows in the target
//! for the ids the run touched, then compares. A shortfall is reported as
//! `CHECK`, not as a failure.
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Environment;
use crate::store::{RowScope, TargetStore, TargetTable};
use crate::validate::MergeDiagnostics;
use crate::writer::{ImportCounters, ImportedIds};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadbackCounts {
    pub tenant_series: i64,
    pub tenant_products: i64,
    pub tenant_events: i64,
    pub tenant_images: i64,
    pub tenant_featured: i64,
    pub tenant_shares: i64,
    pub imported_series: i64,
    pub imported_products: i64,
    pub imported_breeder_products: i64,
    pub events_on_imported_products: i64,
    pub images_on_imported_products: i64,
    pub imported_featured: i64,
    pub imported_shares: i64,
    pub main_image_violations: i64,
}

fn as_vec(ids: &std::collections::BTreeSet<String>) -> Vec<String> {
    ids.iter().cloned().collect()
}

/// Count what actually landed in the target for this run.
pub async fn readback(store: &dyn TargetStore, ids: &ImportedIds) -> Result<ReadbackCounts> {
    let tenant = ids.tenant_id.as_str();
    let series = as_vec(&ids.series);
    let products = as_vec(&ids.products);
    let breeder_products = as_vec(&ids.breeder_products);
    let featured = as_vec(&ids.featured);
    let shares = as_vec(&ids.shares);

    let total = |table| store.count_rows(table, RowScope::Tenant(tenant));
    let counts = ReadbackCounts {
        tenant_series: total(TargetTable::Series).await?,
        tenant_products: total(TargetTable::Products).await?,
        tenant_events: total(TargetTable::ProductEvents).await?,
        tenant_images: total(TargetTable::ProductImages).await?,
        tenant_featured: total(TargetTable::FeaturedProducts).await?,
        tenant_shares: total(TargetTable::PublicShares).await?,
        imported_series: store
            .count_rows(TargetTable::Series, RowScope::Ids(tenant, &series))
            .await?,
        imported_products: store
            .count_rows(TargetTable::Products, RowScope::Ids(tenant, &products))
            .await?,
        imported_breeder_products: store
            .count_rows(TargetTable::Products, RowScope::Ids(tenant, &breeder_products))
            .await?,
        events_on_imported_products: store
            .count_rows(TargetTable::ProductEvents, RowScope::ProductIds(tenant, &products))
            .await?,
        images_on_imported_products: store
            .count_rows(TargetTable::ProductImages, RowScope::ProductIds(tenant, &products))
            .await?,
        imported_featured: store
            .count_rows(TargetTable::FeaturedProducts, RowScope::Ids(tenant, &featured))
            .await?,
        imported_shares: store
            .count_rows(TargetTable::PublicShares, RowScope::Ids(tenant, &shares))
            .await?,
        main_image_violations: store.count_main_image_violations(tenant, &products).await?,
    };
    info!(
        products = counts.imported_products,
        events = counts.events_on_imported_products,
        images = counts.images_on_imported_products,
        "readback done"
    );
    Ok(counts)
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub imported_series_present: bool,
    pub imported_products_present: bool,
    pub imported_breeders_present: bool,
    pub imported_events_present: bool,
    pub imported_images_present: bool,
    pub imported_featured_present: bool,
    pub imported_shares_present: bool,
    pub single_main_image_per_product: bool,
}

fn at_least(found: i64, expected: usize) -> bool {
    usize::try_from(found).is_ok_and(|f| f >= expected)
}

impl Verification {
    pub fn compute(counters: &ImportCounters, ids: &ImportedIds, rb: &ReadbackCounts) -> Self {
        Self {
            imported_series_present: at_least(rb.imported_series, ids.series.len()),
            imported_products_present: at_least(rb.imported_products, ids.products.len()),
            imported_breeders_present: at_least(rb.imported_breeder_products, ids.breeder_products.len()),
            imported_events_present: at_least(rb.events_on_imported_products, counters.events_created),
            imported_images_present: at_least(rb.images_on_imported_products, counters.images_created),
            imported_featured_present: at_least(rb.imported_featured, ids.featured.len()),
            imported_shares_present: at_least(rb.imported_shares, ids.shares.len()),
            single_main_image_per_product: rb.main_image_violations == 0,
        }
    }

    pub fn entries(&self) -> [(&'static str, bool); 8] {
        [
            ("importedSeriesPresent", self.imported_series_present),
            ("importedProductsPresent", self.imported_products_present),
            ("importedBreedersPresent", self.imported_breeders_present),
            ("importedEventsPresent", self.imported_events_present),
            ("importedImagesPresent", self.imported_images_present),
            ("importedFeaturedPresent", self.imported_featured_present),
            ("importedSharesPresent", self.imported_shares_present),
            ("singleMainImagePerProduct", self.single_main_image_per_product),
        ]
    }

    pub fn all_pass(&self) -> bool {
        self.entries().iter().all(|(_, ok)| *ok)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTenant {
    pub id: String,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub run_id: String,
    pub imported_at: String,
    pub env: Environment,
    pub input: String,
    pub tenant: ReportTenant,
    pub source: Value,
    pub payload_counts: BTreeMap<String, usize>,
    pub counters: ImportCounters,
    pub readback_counts: ReadbackCounts,
    pub verification: Verification,
    pub merge_diagnostics: MergeDiagnostics,
    pub payload_validation_issues: Vec<String>,
}

impl ImportReport {
    pub fn render_markdown(&self) -> Result<String> {
        let mut md = String::new();
        writeln!(md, "# Legacy import report {}", self.run_id)?;
        writeln!(md)?;
        writeln!(md, "- runId: `{}`", self.run_id)?;
        writeln!(md, "- importedAt: `{}`", self.imported_at)?;
        writeln!(md, "- env: `{}`", self.env)?;
        writeln!(md, "- input: `{}`", self.input)?;
        writeln!(md, "- tenant: `{}` ({}, id `{}`)", self.tenant.slug, self.tenant.name, self.tenant.id)?;
        if let Some(kind) = self.source.get("type").and_then(Value::as_str) {
            writeln!(md, "- source: `{kind}`")?;
        }
        writeln!(md)?;
        writeln!(md, "## Counters")?;
        writeln!(md)?;
        writeln!(md, "```json\n{}\n```", serde_json::to_string_pretty(&self.counters)?)?;
        writeln!(md)?;
        writeln!(md, "## Verification")?;
        writeln!(md)?;
        for (name, ok) in self.verification.entries() {
            writeln!(md, "- {}: {name}", if ok { "PASS" } else { "CHECK" })?;
        }
        writeln!(md)?;
        writeln!(md, "## Readback counts")?;
        writeln!(md)?;
        writeln!(md, "```json\n{}\n```", serde_json::to_string_pretty(&self.readback_counts)?)?;
        writeln!(md)?;
        writeln!(md, "## Merge diagnostics")?;
        writeln!(md)?;
        let m = &self.merge_diagnostics;
        writeln!(md, "- conflicts: {}", m.conflicts.len())?;
        writeln!(md, "- unmatched breeders: {}", m.unmatched_breeder_ids.len())?;
        writeln!(md, "- skipped without series: {}", m.skipped_no_series.len())?;
        writeln!(md)?;
        writeln!(md, "## Validation issues")?;
        writeln!(md)?;
        if self.payload_validation_issues.is_empty() {
            writeln!(md, "- none")?;
        }
        for issue in &self.payload_validation_issues {
            writeln!(md, "- {issue}")?;
        }
        Ok(md)
    }

    /// Writes `import-report-<runId>.json` and `.md` into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create report dir {}", dir.display()))?;
        let json_path = dir.join(format!("import-report-{}.json", self.run_id));
        let md_path = dir.join(format!("import-report-{}.md", self.run_id));
        std::fs::write(&json_path, serde_json::to_string_pretty(self)? + "\n")
            .with_context(|| format!("failed to write {}", json_path.display()))?;
        std::fs::write(&md_path, self.render_markdown()?)
            .with_context(|| format!("failed to write {}", md_path.display()))?;
        if !self.verification.all_pass() {
            warn!(run_id = %self.run_id, "readback verification has CHECK entries");
        }
        info!(json = %json_path.display(), markdown = %md_path.display(), "import report written");
        Ok((json_path, md_path))
    }
}

/// Write any serializable report as pretty JSON, creating parent dirs.
pub fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)? + "\n")
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{ImageRow, UnitOfWork};
    use std::collections::BTreeSet;

    async fn seeded() -> (MemoryStore, ImportedIds) {
        let store = MemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let tenant = uow.upsert_tenant("t", "T").await.unwrap();
        let product = uow
            .upsert_product(&crate::store::ProductRow {
                tenant_id: tenant.id.clone(),
                code: "A".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut image_ids = BTreeSet::new();
        for key in ["k1", "k2"] {
            let img = uow
                .upsert_image(&ImageRow {
                    tenant_id: tenant.id.clone(),
                    product_id: product.id.clone(),
                    key: key.into(),
                    url: format!("https://cdn/{key}.jpg"),
                    content_type: None,
                    sort_order: 0,
                })
                .await
                .unwrap();
            image_ids.insert(img.id);
        }
        uow.commit().await.unwrap();
        let ids = ImportedIds {
            tenant_id: tenant.id,
            products: BTreeSet::from([product.id]),
            images: image_ids,
            ..Default::default()
        };
        (store, ids)
    }

    #[tokio::test]
    async fn missing_main_image_is_a_check() {
        let (store, ids) = seeded().await;
        let rb = readback(&store, &ids).await.unwrap();
        assert_eq!(rb.imported_products, 1);
        assert_eq!(rb.images_on_imported_products, 2);
        assert_eq!(rb.main_image_violations, 1);

        let counters = ImportCounters { images_created: 2, ..Default::default() };
        let v = Verification::compute(&counters, &ids, &rb);
        assert!(v.imported_images_present);
        assert!(!v.single_main_image_per_product);
        assert!(!v.all_pass());
    }

    #[tokio::test]
    async fn shortfall_against_counters_is_flagged() {
        let (store, ids) = seeded().await;
        let rb = readback(&store, &ids).await.unwrap();
        let counters = ImportCounters { events_created: 3, ..Default::default() };
        let v = Verification::compute(&counters, &ids, &rb);
        assert!(!v.imported_events_present);
        assert!(v.imported_products_present);
    }

    #[test]
    fn report_files_are_written_with_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let report = ImportReport {
            run_id: "20240102-030405".into(),
            imported_at: "2024-01-02T03:04:05Z".into(),
            env: Environment::Staging,
            input: "export.json".into(),
            tenant: ReportTenant { id: "ten-1".into(), slug: "turtle-album".into(), name: "Turtle Album".into() },
            source: serde_json::json!({"type": "legacy_api"}),
            payload_counts: BTreeMap::from([("products".to_string(), 3)]),
            counters: ImportCounters::default(),
            readback_counts: ReadbackCounts::default(),
            verification: Verification { imported_series_present: true, ..Default::default() },
            merge_diagnostics: MergeDiagnostics::default(),
            payload_validation_issues: vec!["breeder b2 missing seriesLegacyId".into()],
        };
        let (json_path, md_path) = report.write_to(dir.path()).unwrap();
        assert!(json_path.ends_with("import-report-20240102-030405.json"));

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(doc["runId"], "20240102-030405");
        assert_eq!(doc["env"], "staging");
        assert_eq!(doc["verification"]["importedSeriesPresent"], true);
        assert_eq!(doc["payloadValidationIssues"][0], "breeder b2 missing seriesLegacyId");

        let md = std::fs::read_to_string(&md_path).unwrap();
        assert!(md.contains("- PASS: importedSeriesPresent"));
        assert!(md.contains("- CHECK: singleMainImagePerProduct"));
        assert!(md.contains("## Readback counts"));
        assert!(md.contains("- breeder b2 missing seriesLegacyId"));
    }
}
