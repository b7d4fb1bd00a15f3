//! `merge-breeders`: fold a target's legacy `breeders` / `breeder_events`
//! tables into `products` / `product_events`, in place.
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::{Environment, TargetArgs, TargetConfig};
use crate::merge::{plan_breeder_merge, BreederMergePlan};
use crate::normalization::format_run_id;
use crate::report::write_json;
use crate::safety;
use crate::store::{
    EventRow, LegacyBreederEventRow, LegacyBreederSource, LegacyTablesPresence, PgStore,
    TargetStore, UnitOfWork,
};
use crate::util::env as env_util;
use crate::validate::MergeConflict;

pub const DEFAULT_REPORT_DIR: &str = "out/migrate/breeder-product-merge";

#[derive(Args, Debug, Clone, Default)]
pub struct MergeBreedersArgs {
    /// Drop breeder_events and breeders after a successful merge
    #[arg(long, default_value_t = false)]
    pub drop_legacy: bool,
    #[arg(long)]
    pub report_dir: Option<PathBuf>,
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub drop_legacy: bool,
    pub report_dir: PathBuf,
    pub use_prepared: bool,
    pub target: TargetConfig,
}

impl MergeBreedersArgs {
    pub fn resolve(self) -> Result<MergeConfig> {
        Ok(MergeConfig {
            drop_legacy: self.drop_legacy,
            report_dir: self.report_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_DIR)),
            use_prepared: env_util::env_flag("USE_PREPARED", false),
            target: self.target.resolve()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStatus {
    Skipped,
    DryRun,
    Committed,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeBefore {
    pub products: usize,
    pub legacy_breeders: usize,
    pub legacy_breeder_events: usize,
    pub planned_updates: usize,
    pub planned_inserts: usize,
    pub conflicts: Vec<MergeConflict>,
    pub unmatched_breeder_ids: Vec<String>,
    pub skipped_no_series: Vec<String>,
    pub duplicate_breeders: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergeCounters {
    pub products_updated: usize,
    pub products_inserted: usize,
    pub events_copied: usize,
    pub events_skipped_existing: usize,
    pub events_skipped_no_product: usize,
    pub events_skipped_no_date: usize,
    pub legacy_tables_dropped: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergeAfter {
    pub products_with_legacy_breeder: i64,
    pub product_events: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub run_id: String,
    pub generated_at: String,
    pub env: Environment,
    pub status: MergeStatus,
    pub drop_legacy: bool,
    pub legacy_tables: LegacyTablesPresence,
    pub before: Option<MergeBefore>,
    pub counters: Option<MergeCounters>,
    pub after: Option<MergeAfter>,
}

#[derive(Debug)]
pub struct MergeRun {
    pub report: MergeReport,
    pub report_path: PathBuf,
}

pub async fn run(cfg: &MergeConfig) -> Result<MergeRun> {
    // reject before opening a connection
    safety::evaluate(&cfg.target)?;
    let store = PgStore::connect(&cfg.target.database_url, cfg.use_prepared).await?;
    execute(cfg, &store).await
}

fn before_from_plan(
    plan: &BreederMergePlan,
    products: usize,
    breeders: usize,
    events: usize,
) -> MergeBefore {
    MergeBefore {
        products,
        legacy_breeders: breeders,
        legacy_breeder_events: events,
        planned_updates: plan.updates.len(),
        planned_inserts: plan.inserts.len(),
        conflicts: plan.conflicts().map(MergeConflict::from).collect(),
        unmatched_breeder_ids: plan.unmatched().map(|m| m.breeder_id.clone()).collect(),
        skipped_no_series: plan.skipped_no_series.clone(),
        duplicate_breeders: plan.duplicate_breeders.clone(),
    }
}

/// Merge writes inside `uow`. The caller owns commit/rollback.
async fn apply_merge(
    uow: &mut (dyn UnitOfWork + '_),
    plan: &BreederMergePlan,
    events: &[LegacyBreederEventRow],
    drop_legacy: bool,
) -> Result<MergeCounters> {
    let mut c = MergeCounters::default();
    for row in plan.updates.iter().chain(plan.inserts.iter()) {
        let up = uow
            .upsert_product(row)
            .await
            .with_context(|| format!("merge breeder into product {}", row.code))?;
        if up.created {
            c.products_inserted += 1;
        } else {
            c.products_updated += 1;
        }
    }

    let mut ordered: Vec<&LegacyBreederEventRow> = events.iter().collect();
    ordered.sort_by(|a, b| a.event_date.cmp(&b.event_date).then_with(|| a.id.cmp(&b.id)));
    for ev in ordered {
        let Some(product_id) = plan.breeder_to_product.get(&ev.breeder_id) else {
            c.events_skipped_no_product += 1;
            continue;
        };
        let Some(event_date) = ev.event_date else {
            c.events_skipped_no_date += 1;
            continue;
        };
        let row = EventRow {
            id: Some(ev.id.clone()),
            tenant_id: ev.tenant_id.clone(),
            product_id: product_id.clone(),
            event_type: ev.event_type.clone(),
            event_date,
            note: ev.note.clone(),
        };
        if uow.find_event(&row).await?.is_some() {
            c.events_skipped_existing += 1;
            continue;
        }
        uow.insert_event(&row)
            .await
            .with_context(|| format!("copy breeder event {}", ev.id))?;
        c.events_copied += 1;
    }

    if drop_legacy {
        uow.drop_legacy_breeder_tables().await.context("drop legacy breeder tables")?;
        c.legacy_tables_dropped = true;
    }
    Ok(c)
}

pub async fn execute<S>(cfg: &MergeConfig, store: &S) -> Result<MergeRun>
where
    S: TargetStore + LegacyBreederSource,
{
    let gate = safety::evaluate(&cfg.target)?;
    for note in &gate.notes {
        println!("{note}");
    }
    let now = Utc::now();
    let mut report = MergeReport {
        run_id: format_run_id(now),
        generated_at: now.to_rfc3339(),
        env: cfg.target.env,
        status: MergeStatus::Skipped,
        drop_legacy: cfg.drop_legacy,
        legacy_tables: store.legacy_tables().await?,
        before: None,
        counters: None,
        after: None,
    };

    if !report.legacy_tables.all_present() {
        warn!(tables = ?report.legacy_tables, "legacy breeder tables missing; nothing to merge");
        println!("skipped: breeders/breeder_events not both present");
        return finish(cfg, report);
    }
    store.check_merge_columns().await?;

    let products = store.load_products().await?;
    let breeders = store.load_legacy_breeders().await?;
    let events = store.load_legacy_breeder_events().await?;
    let plan = plan_breeder_merge(&products, &breeders);
    let before = before_from_plan(&plan, products.len(), breeders.len(), events.len());
    println!(
        "before: {} products, {} breeders, {} breeder events; {} updates, {} inserts, {} conflicts, {} unmatched, {} without series, {} duplicate codes",
        before.products,
        before.legacy_breeders,
        before.legacy_breeder_events,
        before.planned_updates,
        before.planned_inserts,
        before.conflicts.len(),
        before.unmatched_breeder_ids.len(),
        before.skipped_no_series.len(),
        before.duplicate_breeders.len()
    );
    report.before = Some(before);

    if gate.is_dry_run() {
        report.status = MergeStatus::DryRun;
        return finish(cfg, report);
    }

    let mut uow = store.begin().await.context("begin merge transaction")?;
    let counters = match apply_merge(uow.as_mut(), &plan, &events, cfg.drop_legacy).await {
        Ok(c) => {
            uow.commit().await.context("commit merge transaction")?;
            c
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            return Err(err);
        }
    };
    info!(
        updated = counters.products_updated,
        inserted = counters.products_inserted,
        events = counters.events_copied,
        "breeder merge committed"
    );
    report.status = MergeStatus::Committed;
    report.counters = Some(counters);
    let after = MergeAfter {
        products_with_legacy_breeder: store.count_products_with_legacy_breeder().await?,
        product_events: store.count_product_events().await?,
    };
    println!(
        "after: {} products with legacy_breeder_id, {} product events",
        after.products_with_legacy_breeder, after.product_events
    );
    report.after = Some(after);
    finish(cfg, report)
}

fn finish(cfg: &MergeConfig, report: MergeReport) -> Result<MergeRun> {
    let report_path = cfg.report_dir.join(format!("{}.json", report.run_id));
    write_json(&report_path, &report)?;
    println!("report: {}", report_path.display());
    Ok(MergeRun { report, report_path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryState, MemoryStore, ProductRec};
    use crate::store::{ExistingProduct, LegacyBreederRow};
    use chrono::TimeZone;

    fn product(id: &str, code: &str) -> ProductRec {
        ProductRec {
            product: ExistingProduct {
                id: id.into(),
                tenant_id: "t1".into(),
                code: code.into(),
                name: Some("old name".into()),
                series_id: Some("ser-1".into()),
                updated_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                ..Default::default()
            },
            exclude_from_breeding: false,
        }
    }

    fn breeder(id: &str, code: &str, series: Option<&str>) -> LegacyBreederRow {
        LegacyBreederRow {
            id: id.into(),
            tenant_id: "t1".into(),
            series_id: series.map(Into::into),
            code: code.into(),
            name: Some(format!("breeder {id}")),
            sex: Some("female".into()),
            updated_at: Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        }
    }

    fn event(id: &str, breeder_id: &str, day: Option<u32>) -> LegacyBreederEventRow {
        LegacyBreederEventRow {
            id: id.into(),
            tenant_id: "t1".into(),
            breeder_id: breeder_id.into(),
            event_type: "egg".into(),
            event_date: day.map(|d| Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()),
            note: None,
        }
    }

    fn legacy_store() -> MemoryStore {
        MemoryStore::with_state(MemoryState {
            products: vec![product("p1", "GH-F01")],
            legacy_breeders: Some(vec![
                breeder("b1", "gh-f01", Some("ser-1")),
                breeder("b2", "GH-M09", Some("ser-1")),
                breeder("b3", "GH-X", None),
            ]),
            legacy_breeder_events: Some(vec![
                event("e1", "b1", Some(2)),
                event("e2", "b2", Some(3)),
                event("e3", "b3", Some(4)),
                event("e4", "b1", None),
            ]),
            ..Default::default()
        })
    }

    fn config(dir: &std::path::Path, confirm: bool, drop_legacy: bool) -> MergeConfig {
        let mut target = TargetConfig::for_url("postgres://localhost/dev");
        target.confirm = confirm;
        MergeConfig {
            drop_legacy,
            report_dir: dir.to_path_buf(),
            use_prepared: false,
            target,
        }
    }

    #[tokio::test]
    async fn dry_run_reports_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = legacy_store();
        let run = execute(&config(dir.path(), false, false), &store).await.unwrap();
        assert_eq!(run.report.status, MergeStatus::DryRun);
        let before = run.report.before.unwrap();
        assert_eq!(before.planned_updates, 1);
        assert_eq!(before.planned_inserts, 1);
        assert_eq!(before.unmatched_breeder_ids, vec!["b2".to_string(), "b3".to_string()]);
        assert_eq!(before.skipped_no_series, vec!["b3".to_string()]);
        assert!(run.report_path.exists());
        assert!(store.snapshot().events.is_empty());
        assert!(store.snapshot().products[0].product.legacy_breeder_id.is_none());
    }

    #[tokio::test]
    async fn confirmed_merge_is_idempotent_and_drops_legacy_last() {
        let dir = tempfile::tempdir().unwrap();
        let store = legacy_store();
        let first = execute(&config(dir.path(), true, false), &store).await.unwrap();
        let c = first.report.counters.unwrap();
        assert_eq!(c.products_updated, 1);
        assert_eq!(c.products_inserted, 1);
        assert_eq!(c.events_copied, 2);
        assert_eq!(c.events_skipped_no_product, 1);
        assert_eq!(c.events_skipped_no_date, 1);

        let state = store.snapshot();
        let merged = state.products.iter().find(|p| p.product.id == "p1").unwrap();
        assert_eq!(merged.product.legacy_breeder_id.as_deref(), Some("b1"));
        assert_eq!(merged.product.name.as_deref(), Some("breeder b1"));
        assert_eq!(merged.product.updated_at, Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        assert!(state.products.iter().any(|p| p.product.id == "prd_merge_b2"));
        assert!(state.events.iter().any(|e| e.id == "e1" && e.product_id == "p1"));

        let second = execute(&config(dir.path(), true, true), &store).await.unwrap();
        let c = second.report.counters.unwrap();
        assert_eq!(c.products_inserted, 0);
        assert_eq!(c.events_copied, 0);
        assert_eq!(c.events_skipped_existing, 2);
        assert!(c.legacy_tables_dropped);
        assert_eq!(second.report.after.unwrap().product_events, 2);
        assert!(store.snapshot().legacy_breeders.is_none());
    }

    #[tokio::test]
    async fn missing_legacy_tables_is_a_skip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let run = execute(&config(dir.path(), true, false), &store).await.unwrap();
        assert_eq!(run.report.status, MergeStatus::Skipped);
        assert!(run.report.before.is_none());
    }

    #[tokio::test]
    async fn failed_commit_keeps_legacy_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store = legacy_store();
        store.fail_on_commit.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(execute(&config(dir.path(), true, true), &store).await.is_err());
        let state = store.snapshot();
        assert!(state.legacy_breeders.is_some());
        assert!(state.events.is_empty());
    }

    fn shared_code_store(second_code: &str) -> MemoryStore {
        MemoryStore::with_state(MemoryState {
            legacy_breeders: Some(vec![
                breeder("b2", "GH-M09", Some("ser-1")),
                breeder("b4", second_code, Some("ser-1")),
            ]),
            legacy_breeder_events: Some(vec![
                event("e2", "b2", Some(3)),
                event("e5", "b4", Some(5)),
            ]),
            ..Default::default()
        })
    }

    fn assert_one_row_per_code_key(state: &MemoryState) {
        let mut keys: Vec<String> = state
            .products
            .iter()
            .map(|p| p.product.code.trim().to_uppercase())
            .collect();
        let total = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), total);
        for ev in &state.events {
            assert!(
                state.products.iter().any(|p| p.product.id == ev.product_id),
                "event {} points at missing product {}",
                ev.id,
                ev.product_id
            );
        }
    }

    #[tokio::test]
    async fn breeders_sharing_a_code_fold_into_one_product() {
        let dir = tempfile::tempdir().unwrap();
        let store = shared_code_store("GH-M09");
        let run = execute(&config(dir.path(), true, false), &store).await.unwrap();
        let before = run.report.before.unwrap();
        assert_eq!(before.planned_inserts, 1);
        assert_eq!(before.duplicate_breeders, vec!["b4".to_string()]);
        let c = run.report.counters.unwrap();
        assert_eq!(c.products_inserted, 1);
        assert_eq!(c.products_updated, 0);
        assert_eq!(c.events_copied, 2);

        let state = store.snapshot();
        assert_eq!(state.products.len(), 1);
        assert_eq!(state.products[0].product.id, "prd_merge_b2");
        assert!(state.events.iter().all(|e| e.product_id == "prd_merge_b2"));
        assert_one_row_per_code_key(&state);
    }

    #[tokio::test]
    async fn case_variant_codes_fold_into_one_product() {
        let dir = tempfile::tempdir().unwrap();
        let store = shared_code_store("gh-m09");
        let run = execute(&config(dir.path(), true, false), &store).await.unwrap();
        assert_eq!(run.report.counters.unwrap().products_inserted, 1);

        let state = store.snapshot();
        let codes: Vec<&str> = state.products.iter().map(|p| p.product.code.as_str()).collect();
        assert_eq!(codes, vec!["GH-M09"]);
        assert_eq!(state.events.len(), 2);
        assert_one_row_per_code_key(&state);
    }
}
