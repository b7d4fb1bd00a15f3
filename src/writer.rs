//! Applies a resolved import plan through one unit of work.
//!
//! Step order: owner user, tenant, membership, series, products,
//! breeder-only products, events, images, featured entries, shares. Each
//! step only needs ids produced by the steps before it.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::merge::{ImportPlan, PlannedProduct, ProductOrigin};
use crate::normalization::keys::{content_type_from_url, image_key, share_token};
use crate::normalization::text::normalize_event_type;
use crate::normalization::{normalize_code, normalize_string, parse_legacy_date, parse_opt_date};
use crate::payload::{ExportPayload, LegacyBreederEvent, LegacyProductImage};
use crate::store::{
    EventRow, ImageRow, MemberRole, ProductRow, SeriesRow, ShareRow, TargetStore, UnitOfWork,
};

/// Who and where the import writes as.
#[derive(Debug, Clone)]
pub struct ImportContext {
    pub tenant_slug: String,
    pub tenant_name: String,
    pub admin_email: String,
    pub admin_name: String,
    pub skip_shares: bool,
}

/// Per-operation outcome counts. Serialized into the report.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportCounters {
    pub user_created: usize,
    pub user_updated: usize,
    pub tenant_created: usize,
    pub tenant_updated: usize,
    pub membership_created: usize,
    pub membership_updated: usize,
    pub series_created: usize,
    pub series_updated: usize,
    pub series_skipped_no_code: usize,
    pub products_created: usize,
    pub products_updated: usize,
    pub products_skipped_no_code: usize,
    pub breeders_merged: usize,
    pub breeder_products_created: usize,
    pub breeder_products_updated: usize,
    pub breeders_skipped_no_code: usize,
    pub breeders_skipped_no_series: usize,
    pub breeders_duplicate_code: usize,
    pub breeder_conflicts: usize,
    pub events_created: usize,
    pub events_skipped_existing: usize,
    pub events_skipped_invalid_date: usize,
    pub events_skipped_no_breeder: usize,
    pub images_created: usize,
    pub images_updated: usize,
    pub images_skipped_no_product: usize,
    pub images_skipped_empty_url: usize,
    pub main_images_set: usize,
    pub featured_created: usize,
    pub featured_updated: usize,
    pub featured_skipped_no_product: usize,
    pub featured_skipped_inactive: usize,
    pub shares_created: usize,
    pub shares_updated: usize,
    pub shares_skipped_no_product: usize,
}

impl ImportCounters {
    /// Rows created by the run, all entities together.
    pub fn total_created(&self) -> usize {
        self.series_created
            + self.products_created
            + self.breeder_products_created
            + self.events_created
            + self.images_created
            + self.featured_created
            + self.shares_created
    }
}

fn tally(created: bool, on_create: &mut usize, on_update: &mut usize) {
    if created {
        *on_create += 1;
    } else {
        *on_update += 1;
    }
}

/// Target ids touched by the run, used for readback.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedIds {
    pub tenant_id: String,
    pub user_id: String,
    pub series: BTreeSet<String>,
    pub products: BTreeSet<String>,
    /// Products that carry a legacy breeder.
    pub breeder_products: BTreeSet<String>,
    pub events: BTreeSet<String>,
    pub images: BTreeSet<String>,
    pub featured: BTreeSet<String>,
    pub shares: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportOutcome {
    pub counters: ImportCounters,
    pub ids: ImportedIds,
}

/// Legacy series id to target code, in payload order. Rows without a
/// legacy id are left out and counted by the writer.
pub fn series_codes(payload: &ExportPayload) -> Vec<(String, String)> {
    let input: Vec<crate::normalization::keys::SeriesCodeInput<'_>> = payload
        .series
        .iter()
        .map(|s| (s.legacy_id.as_str(), s.code.as_deref(), s.name.as_deref()))
        .collect();
    crate::normalization::keys::assign_series_codes(&input)
}

/// Note with the legacy-only fields appended, so nothing is lost.
pub fn compose_event_note(ev: &LegacyBreederEvent) -> Option<String> {
    let mut meta = Vec::new();
    if let Some(code) = normalize_code(ev.male_code.as_deref()) {
        meta.push(format!("maleCode={code}"));
    }
    if let Some(n) = ev.egg_count {
        meta.push(format!("eggCount={n}"));
    }
    if let Some(code) = normalize_code(ev.old_mate_code.as_deref()) {
        meta.push(format!("oldMateCode={code}"));
    }
    if let Some(code) = normalize_code(ev.new_mate_code.as_deref()) {
        meta.push(format!("newMateCode={code}"));
    }
    if let Some(id) = normalize_string(Some(&ev.legacy_id)) {
        meta.push(format!("legacyEventId={id}"));
    }
    let block = (!meta.is_empty()).then(|| format!("[legacy {}]", meta.join(", ")));
    match (normalize_string(ev.note.as_deref()), block) {
        (Some(note), Some(block)) => Some(format!("{note}\n{block}")),
        (note, block) => note.or(block),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    a.max(b)
}

fn is_main_tag(img: &LegacyProductImage) -> bool {
    img.kind
        .as_deref()
        .is_some_and(|k| k.trim().eq_ignore_ascii_case("main"))
}

struct Writer<'u, 'd, 'p> {
    uow: &'u mut (dyn UnitOfWork + 'd),
    payload: &'p ExportPayload,
    plan: &'p ImportPlan,
    ctx: &'p ImportContext,
    out: ImportOutcome,
    series_ids: HashMap<String, String>,
    /// Plan index to target product id.
    product_ids: HashMap<usize, String>,
}

impl Writer<'_, '_, '_> {
    async fn bootstrap(&mut self) -> Result<()> {
        let c = &mut self.out.counters;
        let user = self
            .uow
            .upsert_user(&self.ctx.admin_email, &self.ctx.admin_name)
            .await
            .context("upsert owner user")?;
        tally(user.created, &mut c.user_created, &mut c.user_updated);
        let tenant = self
            .uow
            .upsert_tenant(&self.ctx.tenant_slug, &self.ctx.tenant_name)
            .await
            .context("upsert tenant")?;
        tally(tenant.created, &mut c.tenant_created, &mut c.tenant_updated);
        let member = self
            .uow
            .upsert_member(&tenant.id, &user.id, MemberRole::Owner)
            .await
            .context("upsert tenant membership")?;
        tally(member.created, &mut c.membership_created, &mut c.membership_updated);
        info!(tenant = %self.ctx.tenant_slug, tenant_id = %tenant.id, user_id = %user.id, "tenant bootstrap done");
        self.out.ids.tenant_id = tenant.id;
        self.out.ids.user_id = user.id;
        Ok(())
    }

    async fn series(&mut self, codes: &[(String, String)]) -> Result<()> {
        let by_id: HashMap<&str, _> = self
            .payload
            .series
            .iter()
            .map(|s| (s.legacy_id.trim(), s))
            .collect();
        self.out.counters.series_skipped_no_code = self.payload.series.len() - codes.len();
        for (legacy_id, code) in codes {
            let Some(src) = by_id.get(legacy_id.as_str()) else {
                continue;
            };
            let row = SeriesRow {
                tenant_id: self.out.ids.tenant_id.clone(),
                code: code.clone(),
                name: normalize_string(src.name.as_deref()).unwrap_or_else(|| code.clone()),
                description: normalize_string(src.description.as_deref()),
                sort_order: src.sort_order.max(0),
                is_active: src.is_active,
            };
            let up = self
                .uow
                .upsert_series(&row)
                .await
                .with_context(|| format!("upsert series {code}"))?;
            let c = &mut self.out.counters;
            tally(up.created, &mut c.series_created, &mut c.series_updated);
            self.series_ids.insert(legacy_id.clone(), up.id.clone());
            self.out.ids.series.insert(up.id);
        }
        info!(
            created = self.out.counters.series_created,
            updated = self.out.counters.series_updated,
            "series upserted"
        );
        Ok(())
    }

    fn product_row(&self, p: &PlannedProduct) -> ProductRow {
        let base = p.base_product_id.as_deref().and_then(|id| {
            self.payload
                .products
                .iter()
                .find(|x| x.legacy_id.trim() == id)
        });
        let breeder = p.legacy_breeder_id.as_deref().and_then(|id| {
            self.payload
                .breeders
                .iter()
                .find(|x| x.legacy_id.trim() == id)
        });
        let created_at = latest(
            base.and_then(|b| parse_opt_date(b.created_at.as_deref())),
            breeder.and_then(|b| parse_opt_date(b.created_at.as_deref())),
        );
        let updated_at = latest(
            base.and_then(|b| parse_opt_date(b.updated_at.as_deref())),
            breeder.and_then(|b| parse_opt_date(b.updated_at.as_deref())),
        );
        let f = &p.fields;
        ProductRow {
            id: Some(Uuid::new_v4().to_string()),
            tenant_id: self.out.ids.tenant_id.clone(),
            code: p.code.clone(),
            series_id: f
                .series_ref
                .as_deref()
                .and_then(|s| self.series_ids.get(s).cloned()),
            name: f.name.clone().or_else(|| Some(p.code.clone())),
            description: f.description.clone(),
            sex: f.sex.clone(),
            sire_code: f.sire_code.clone(),
            dam_code: f.dam_code.clone(),
            mate_code: f.mate_code.clone(),
            in_stock: f.in_stock,
            exclude_from_breeding: f.exclude_from_breeding,
            legacy_breeder_id: p.legacy_breeder_id.clone(),
            created_at,
            updated_at,
        }
    }

    /// `breeder_only` selects which half of the plan is written.
    async fn products(&mut self, breeder_only: bool) -> Result<()> {
        let plan = self.plan;
        for (idx, p) in plan.products.iter().enumerate() {
            if (p.origin == ProductOrigin::BreederOnly) != breeder_only {
                continue;
            }
            let row = self.product_row(p);
            let up = self
                .uow
                .upsert_product(&row)
                .await
                .with_context(|| format!("upsert product {}", p.code))?;
            let c = &mut self.out.counters;
            match p.origin {
                ProductOrigin::BreederOnly => {
                    tally(up.created, &mut c.breeder_products_created, &mut c.breeder_products_updated)
                }
                ProductOrigin::Merged => {
                    c.breeders_merged += 1;
                    tally(up.created, &mut c.products_created, &mut c.products_updated)
                }
                ProductOrigin::Product => {
                    tally(up.created, &mut c.products_created, &mut c.products_updated)
                }
            }
            if p.legacy_breeder_id.is_some() {
                self.out.ids.breeder_products.insert(up.id.clone());
            }
            self.out.ids.products.insert(up.id.clone());
            self.product_ids.insert(idx, up.id);
        }
        Ok(())
    }

    fn target_product(&self, legacy_id: &str) -> Option<String> {
        self.plan
            .resolve(legacy_id)
            .and_then(|idx| self.product_ids.get(&idx).cloned())
    }

    async fn events(&mut self) -> Result<()> {
        let payload = self.payload;
        let mut ready: Vec<(DateTime<Utc>, &LegacyBreederEvent, String)> = Vec::new();
        for ev in &payload.breeder_events {
            let product = self
                .plan
                .index_of_breeder(&ev.legacy_breeder_id)
                .and_then(|idx| self.product_ids.get(&idx).cloned());
            let Some(product_id) = product else {
                self.out.counters.events_skipped_no_breeder += 1;
                continue;
            };
            let Some(date) = ev.event_date.as_deref().and_then(parse_legacy_date) else {
                debug!(event = %ev.legacy_id, "event date missing or unparseable");
                self.out.counters.events_skipped_invalid_date += 1;
                continue;
            };
            ready.push((date, ev, product_id));
        }
        ready.sort_by_key(|(date, _, _)| *date);

        for (date, ev, product_id) in ready {
            let row = EventRow {
                id: None,
                tenant_id: self.out.ids.tenant_id.clone(),
                product_id,
                event_type: normalize_event_type(ev.event_type.as_deref()),
                event_date: date,
                note: compose_event_note(ev),
            };
            if let Some(existing) = self.uow.find_event(&row).await? {
                self.out.counters.events_skipped_existing += 1;
                self.out.ids.events.insert(existing);
                continue;
            }
            let id = self
                .uow
                .insert_event(&row)
                .await
                .with_context(|| format!("insert event {}", ev.legacy_id))?;
            self.out.counters.events_created += 1;
            self.out.ids.events.insert(id);
        }
        info!(
            created = self.out.counters.events_created,
            existing = self.out.counters.events_skipped_existing,
            invalid_date = self.out.counters.events_skipped_invalid_date,
            "events migrated"
        );
        Ok(())
    }

    async fn images(&mut self) -> Result<()> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&LegacyProductImage>> = HashMap::new();
        let payload = self.payload;
        for img in &payload.product_images {
            let Some(product_id) = self.target_product(&img.legacy_product_id) else {
                self.out.counters.images_skipped_no_product += 1;
                continue;
            };
            if !groups.contains_key(&product_id) {
                order.push(product_id.clone());
            }
            groups.entry(product_id).or_default().push(img);
        }

        for product_id in order {
            let mut imgs = groups.remove(&product_id).unwrap_or_default();
            imgs.sort_by_key(|i| i.sort_order);
            let mut written: Vec<(String, bool)> = Vec::new();
            for (position, img) in imgs.iter().enumerate() {
                let Some(url) = normalize_string(img.url.as_deref()) else {
                    self.out.counters.images_skipped_empty_url += 1;
                    continue;
                };
                let legacy_id = normalize_string(Some(&img.legacy_id)).unwrap_or_else(|| {
                    format!("{}-{}", img.legacy_product_id.trim(), position + 1)
                });
                let row = ImageRow {
                    tenant_id: self.out.ids.tenant_id.clone(),
                    product_id: product_id.clone(),
                    key: image_key(&legacy_id, &url),
                    content_type: content_type_from_url(&url).map(str::to_string),
                    url,
                    sort_order: img.sort_order.max(0),
                };
                let up = self
                    .uow
                    .upsert_image(&row)
                    .await
                    .with_context(|| format!("upsert image {legacy_id}"))?;
                let c = &mut self.out.counters;
                tally(up.created, &mut c.images_created, &mut c.images_updated);
                self.out.ids.images.insert(up.id.clone());
                written.push((up.id, is_main_tag(img)));
            }
            let main = written
                .iter()
                .find(|(_, tagged)| *tagged)
                .or_else(|| written.first())
                .map(|(id, _)| id.clone());
            if let Some(main) = main {
                self.uow.clear_main_images(&self.out.ids.tenant_id, &product_id).await?;
                self.uow.mark_main_image(&main).await?;
                self.out.counters.main_images_set += 1;
            }
        }
        Ok(())
    }

    async fn featured(&mut self) -> Result<()> {
        let payload = self.payload;
        for f in &payload.featured_products {
            if !f.is_active {
                self.out.counters.featured_skipped_inactive += 1;
                continue;
            }
            let Some(product_id) = self.target_product(&f.legacy_product_id) else {
                self.out.counters.featured_skipped_no_product += 1;
                continue;
            };
            let up = self
                .uow
                .upsert_featured(&self.out.ids.tenant_id, &product_id, f.sort_order.max(0))
                .await
                .context("upsert featured product")?;
            let c = &mut self.out.counters;
            tally(up.created, &mut c.featured_created, &mut c.featured_updated);
            self.out.ids.featured.insert(up.id);
        }
        Ok(())
    }

    async fn shares(&mut self) -> Result<()> {
        if self.ctx.skip_shares {
            info!("share creation skipped");
            return Ok(());
        }
        let payload = self.payload;
        let seeds: Vec<&str> = if payload.share_seeds.is_empty() {
            payload
                .featured_products
                .iter()
                .filter(|f| f.is_active)
                .map(|f| f.legacy_product_id.as_str())
                .collect()
        } else {
            payload
                .share_seeds
                .iter()
                .map(|s| s.legacy_product_id.as_str())
                .collect()
        };
        let mut seen: HashSet<String> = HashSet::new();
        for legacy_id in seeds {
            let Some(product_id) = self.target_product(legacy_id) else {
                self.out.counters.shares_skipped_no_product += 1;
                continue;
            };
            if !seen.insert(product_id.clone()) {
                continue;
            }
            let row = ShareRow {
                tenant_id: self.out.ids.tenant_id.clone(),
                share_token: share_token(&self.ctx.tenant_slug, &product_id),
                product_id,
                created_by_user_id: self.out.ids.user_id.clone(),
            };
            let up = self.uow.upsert_share(&row).await.context("upsert public share")?;
            let c = &mut self.out.counters;
            tally(up.created, &mut c.shares_created, &mut c.shares_updated);
            self.out.ids.shares.insert(up.id);
        }
        Ok(())
    }
}

/// Run every write step against `uow`. The caller owns commit/rollback.
pub async fn write_import(
    uow: &mut (dyn UnitOfWork + '_),
    payload: &ExportPayload,
    plan: &ImportPlan,
    codes: &[(String, String)],
    ctx: &ImportContext,
) -> Result<ImportOutcome> {
    let mut w = Writer {
        uow,
        payload,
        plan,
        ctx,
        out: ImportOutcome::default(),
        series_ids: HashMap::new(),
        product_ids: HashMap::new(),
    };
    {
        let c = &mut w.out.counters;
        c.products_skipped_no_code = plan.skips.products_no_code.len();
        c.breeders_skipped_no_code = plan.skips.breeders_no_code.len();
        c.breeders_skipped_no_series = plan.skips.breeders_no_series.len();
        c.breeders_duplicate_code = plan.skips.duplicate_breeders.len();
        c.breeder_conflicts = plan.conflicts().count();
    }
    w.bootstrap().await?;
    w.series(codes).await?;
    w.products(false).await?;
    w.products(true).await?;
    w.events().await?;
    w.images().await?;
    w.featured().await?;
    w.shares().await?;
    Ok(w.out)
}

/// One transaction around [`write_import`]: commit on success, roll back on
/// any error.
pub async fn run_import(
    store: &dyn TargetStore,
    payload: &ExportPayload,
    plan: &ImportPlan,
    codes: &[(String, String)],
    ctx: &ImportContext,
) -> Result<ImportOutcome> {
    let mut uow = store.begin().await.context("begin import transaction")?;
    match write_import(uow.as_mut(), payload, plan, codes, ctx).await {
        Ok(outcome) => {
            uow.commit().await.context("commit import transaction")?;
            info!(created = outcome.counters.total_created(), "import committed");
            Ok(outcome)
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::plan_import;
    use crate::store::memory::MemoryStore;
    use crate::store::{RowScope, TargetTable};
    use serde_json::{json, Value};
    use std::sync::atomic::Ordering;

    fn ctx() -> ImportContext {
        ImportContext {
            tenant_slug: "turtle-album".into(),
            tenant_name: "Turtle Album".into(),
            admin_email: "admin@turtlealbum.local".into(),
            admin_name: "Turtle Album Admin".into(),
            skip_shares: false,
        }
    }

    fn load(doc: Value) -> ExportPayload {
        ExportPayload::from_json_str(&doc.to_string(), "test").unwrap()
    }

    async fn import(store: &MemoryStore, payload: &ExportPayload) -> Result<ImportOutcome> {
        let codes = series_codes(payload);
        let known: HashSet<String> = codes.iter().map(|(id, _)| id.clone()).collect();
        let plan = plan_import(payload, &known);
        run_import(store, payload, &plan, &codes, &ctx()).await
    }

    fn gh_f01() -> ExportPayload {
        load(json!({
            "series": [{"legacyId": "s1", "code": "GH", "name": "Golden Head"}],
            "products": [],
            "productImages": [
                {"legacyId": "i1", "legacyProductId": "b1", "url": "https://cdn/a.jpg", "type": "gallery", "sortOrder": 0},
                {"legacyId": "i2", "legacyProductId": "b1", "url": "https://cdn/b.png", "type": "main", "sortOrder": 1}
            ],
            "breeders": [{"legacyId": "b1", "code": "GH-F01", "seriesLegacyId": "s1", "sex": "female"}],
            "breederEvents": [],
            "featuredProducts": []
        }))
    }

    #[tokio::test]
    async fn fresh_breeder_scenario_then_rerun_creates_nothing() {
        let store = MemoryStore::new();
        let payload = gh_f01();

        let first = import(&store, &payload).await.unwrap();
        let c = &first.counters;
        assert_eq!(c.series_created, 1);
        assert_eq!(c.breeder_products_created, 1);
        assert_eq!(c.products_created, 0);
        assert_eq!(c.images_created, 2);
        assert_eq!(c.events_created, 0);

        let state = store.snapshot();
        assert_eq!(state.products.len(), 1);
        assert_eq!(state.products[0].product.code, "GH-F01");
        assert_eq!(state.products[0].product.name.as_deref(), Some("GH-F01"));
        assert_eq!(state.products[0].product.legacy_breeder_id.as_deref(), Some("b1"));
        let mains: Vec<_> = state.images.iter().filter(|i| i.is_main).collect();
        assert_eq!(mains.len(), 1);
        assert_eq!(mains[0].row.url, "https://cdn/b.png");

        let before = state.row_counts();
        let second = import(&store, &payload).await.unwrap();
        assert_eq!(second.counters.total_created(), 0);
        assert_eq!(second.counters.tenant_created, 0);
        assert_eq!(second.counters.images_updated, 2);
        assert_eq!(second.counters.breeder_products_updated, 1);
        assert_eq!(store.snapshot().row_counts(), before);
    }

    #[tokio::test]
    async fn collided_codes_become_one_layered_row() {
        let store = MemoryStore::new();
        let payload = load(json!({
            "series": [{"legacyId": "s1", "code": "GH"}],
            "products": [{"legacyId": "p1", "code": "gh-f02", "name": "Lucky", "description": "base", "inStock": true}],
            "productImages": [],
            "breeders": [{"legacyId": "b1", "code": "GH-F02", "seriesLegacyId": "s1", "sex": "female", "sireCode": "gh-s"}],
            "breederEvents": [],
            "featuredProducts": []
        }));
        let out = import(&store, &payload).await.unwrap();
        assert_eq!(out.counters.products_created, 1);
        assert_eq!(out.counters.breeders_merged, 1);
        assert_eq!(out.counters.breeder_products_created, 0);
        let state = store.snapshot();
        assert_eq!(state.products.len(), 1);
        let p = &state.products[0].product;
        assert_eq!(p.code, "GH-F02");
        assert_eq!(p.name.as_deref(), Some("Lucky"));
        assert_eq!(p.description.as_deref(), Some("base"));
        assert_eq!(p.sex.as_deref(), Some("female"));
        assert_eq!(p.sire_code.as_deref(), Some("GH-S"));
        assert_eq!(p.series_id.as_deref(), Some(state.series[0].id.as_str()));
    }

    fn with_events() -> ExportPayload {
        load(json!({
            "series": [{"legacyId": "s1", "code": "GH"}],
            "products": [],
            "productImages": [],
            "breeders": [{"legacyId": "b1", "code": "GH-1", "seriesLegacyId": "s1"}],
            "breederEvents": [
                {"legacyId": "e2", "legacyBreederId": "b1", "eventType": "EGG", "eventDate": "2024-05-02", "eggCount": 4},
                {"legacyId": "e1", "legacyBreederId": "b1", "eventType": "mating", "eventDate": "2024-05-01T08:00:00Z",
                 "maleCode": "gh-m1", "note": " first pairing "},
                {"legacyId": "e3", "legacyBreederId": "b1", "eventDate": "not a date"},
                {"legacyId": "e4", "legacyBreederId": "ghost", "eventDate": "2024-05-03"}
            ],
            "featuredProducts": []
        }))
    }

    #[tokio::test]
    async fn events_dedup_across_runs_and_count_skips() {
        let store = MemoryStore::new();
        let payload = with_events();
        let first = import(&store, &payload).await.unwrap();
        assert_eq!(first.counters.events_created, 2);
        assert_eq!(first.counters.events_skipped_invalid_date, 1);
        assert_eq!(first.counters.events_skipped_no_breeder, 1);

        let state = store.snapshot();
        assert_eq!(state.events[0].event_type, "mating");
        assert_eq!(
            state.events[0].note.as_deref(),
            Some("first pairing\n[legacy maleCode=GH-M1, legacyEventId=e1]")
        );
        assert_eq!(state.events[1].event_type, "egg");

        let second = import(&store, &payload).await.unwrap();
        assert_eq!(second.counters.events_created, 0);
        assert_eq!(second.counters.events_skipped_existing, 2);
        assert_eq!(store.snapshot().events.len(), 2);
    }

    #[tokio::test]
    async fn main_image_moves_without_leaving_two() {
        let store = MemoryStore::new();
        let mut payload = gh_f01();
        import(&store, &payload).await.unwrap();

        payload.product_images[1].kind = Some("gallery".into());
        payload.product_images[0].kind = Some("main".into());
        import(&store, &payload).await.unwrap();
        let state = store.snapshot();
        let mains: Vec<_> = state.images.iter().filter(|i| i.is_main).collect();
        assert_eq!(mains.len(), 1);
        assert_eq!(mains[0].row.url, "https://cdn/a.jpg");
        let tenant = &state.tenants[0].id;
        let pids: Vec<String> = state.products.iter().map(|p| p.product.id.clone()).collect();
        assert_eq!(store.count_main_image_violations(tenant, &pids).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn featured_and_shares_resolve_through_breeder_ids() {
        let store = MemoryStore::new();
        let mut payload = gh_f01();
        payload.featured_products = vec![
            crate::payload::LegacyFeaturedProduct {
                legacy_id: "f1".into(),
                legacy_product_id: "b1".into(),
                sort_order: 2,
                is_active: true,
            },
            crate::payload::LegacyFeaturedProduct {
                legacy_id: "f2".into(),
                legacy_product_id: "b1".into(),
                sort_order: 0,
                is_active: false,
            },
            crate::payload::LegacyFeaturedProduct {
                legacy_id: "f3".into(),
                legacy_product_id: "gone".into(),
                sort_order: 0,
                is_active: true,
            },
        ];
        let out = import(&store, &payload).await.unwrap();
        let c = &out.counters;
        assert_eq!(c.featured_created, 1);
        assert_eq!(c.featured_skipped_inactive, 1);
        assert_eq!(c.featured_skipped_no_product, 1);
        assert_eq!(c.shares_created, 1);
        assert_eq!(c.shares_skipped_no_product, 1);

        let state = store.snapshot();
        let product_id = &state.products[0].product.id;
        assert_eq!(state.shares[0].row.share_token, share_token("turtle-album", product_id));
        let tenant = state.tenants[0].id.clone();
        let n = store
            .count_rows(TargetTable::PublicShares, RowScope::Tenant(&tenant))
            .await
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn skip_shares_writes_none() {
        let store = MemoryStore::new();
        let mut payload = gh_f01();
        payload.share_seeds.push(crate::payload::LegacyShareSeed {
            legacy_product_id: "b1".into(),
            strategy: None,
        });
        let codes = series_codes(&payload);
        let known: HashSet<String> = codes.iter().map(|(id, _)| id.clone()).collect();
        let plan = plan_import(&payload, &known);
        let ctx = ImportContext { skip_shares: true, ..ctx() };
        let out = run_import(&store, &payload, &plan, &codes, &ctx).await.unwrap();
        assert_eq!(out.counters.shares_created, 0);
        assert!(store.snapshot().shares.is_empty());
    }

    #[tokio::test]
    async fn failed_commit_leaves_target_untouched() {
        let store = MemoryStore::new();
        store.fail_on_commit.store(true, Ordering::SeqCst);
        let err = import(&store, &gh_f01()).await.unwrap_err();
        assert!(format!("{err:#}").contains("simulated commit failure"));
        assert_eq!(store.snapshot().row_counts(), [0; 9]);
    }

    #[tokio::test]
    async fn failing_step_rolls_back_everything() {
        let store = MemoryStore::new();
        // Two breeder-only products with the same fixed id cannot both insert.
        let mut uow = store.begin().await.unwrap();
        let tenant = uow.upsert_tenant("turtle-album", "Turtle Album").await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let row = ProductRow {
            id: Some("dup".into()),
            tenant_id: tenant.id.clone(),
            code: "A".into(),
            ..Default::default()
        };
        uow.upsert_product(&row).await.unwrap();
        let clash = ProductRow { code: "B".into(), ..row };
        assert!(uow.upsert_product(&clash).await.is_err());
        uow.rollback().await.unwrap();
        assert!(store.snapshot().products.is_empty());
    }

    #[test]
    fn note_composition() {
        let ev = LegacyBreederEvent {
            legacy_id: "e9".into(),
            egg_count: Some(0),
            old_mate_code: Some("a".into()),
            new_mate_code: Some("b".into()),
            ..Default::default()
        };
        assert_eq!(
            compose_event_note(&ev).as_deref(),
            Some("[legacy eggCount=0, oldMateCode=A, newMateCode=B, legacyEventId=e9]")
        );
    }
}
