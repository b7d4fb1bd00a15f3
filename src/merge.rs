//! Breeder/product reconciliation.
//!
//! Legacy breeders and legacy products can describe the same animal. A
//! breeder matches every product in the same scope whose trimmed,
//! upper-cased code equals its own. When several products match, the pick
//! is, in order: exact code spelling, latest `updated_at`, latest
//! `created_at`, then the greatest id. Missing timestamps rank after present
//! ones. The same inputs always produce the same pick.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::normalization::{
    code_key, normalize_code, normalize_sex, normalize_string, parse_opt_date,
};
use crate::payload::{ExportPayload, LegacyProduct};
use crate::store::{ExistingProduct, LegacyBreederRow, ProductRow};

/// What the matcher needs to know about a product row.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub id: String,
    pub scope: String,
    pub code: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

fn desc_nulls_last(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Best candidate first.
fn rank(breeder_code: &str, a: &MatchCandidate, b: &MatchCandidate) -> Ordering {
    let exact_a = a.code == breeder_code;
    let exact_b = b.code == breeder_code;
    exact_b
        .cmp(&exact_a)
        .then_with(|| desc_nulls_last(a.updated_at, b.updated_at))
        .then_with(|| desc_nulls_last(a.created_at, b.created_at))
        .then_with(|| b.id.cmp(&a.id))
}

/// Pick one product for a breeder code out of its candidates.
pub fn pick_candidate<'a>(
    breeder_code: &str,
    candidates: &[&'a MatchCandidate],
) -> Option<&'a MatchCandidate> {
    candidates
        .iter()
        .copied()
        .min_by(|a, b| rank(breeder_code, a, b))
}

/// Products grouped by (scope, code key), in first-seen order.
pub struct CodeIndex<'a> {
    groups: HashMap<(String, String), Vec<&'a MatchCandidate>>,
}

impl<'a> CodeIndex<'a> {
    pub fn build(products: &'a [MatchCandidate]) -> Self {
        let mut groups: HashMap<(String, String), Vec<&'a MatchCandidate>> = HashMap::new();
        for p in products {
            let key = code_key(&p.code);
            if key.is_empty() {
                continue;
            }
            groups.entry((p.scope.clone(), key)).or_default().push(p);
        }
        Self { groups }
    }

    pub fn candidates(&self, scope: &str, code: &str) -> &[&'a MatchCandidate] {
        self.groups
            .get(&(scope.to_string(), code_key(code)))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreederMatch {
    pub breeder_id: String,
    pub scope: String,
    pub code: String,
    /// Every matching product id, ascending.
    pub candidate_product_ids: Vec<String>,
    pub picked_product_id: Option<String>,
}

impl BreederMatch {
    pub fn is_conflict(&self) -> bool {
        self.candidate_product_ids.len() > 1
    }

    pub fn is_unmatched(&self) -> bool {
        self.candidate_product_ids.is_empty()
    }
}

pub fn match_breeder(index: &CodeIndex<'_>, breeder: &MatchCandidate) -> BreederMatch {
    let candidates = index.candidates(&breeder.scope, &breeder.code);
    let picked = pick_candidate(&breeder.code, candidates).map(|c| c.id.clone());
    let mut ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
    ids.sort();
    BreederMatch {
        breeder_id: breeder.id.clone(),
        scope: breeder.scope.clone(),
        code: breeder.code.clone(),
        candidate_product_ids: ids,
        picked_product_id: picked,
    }
}

/// Mergeable attributes of an animal. `series_ref` is whatever id space the
/// caller works in (legacy series ids or target series ids).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnimalFields {
    pub name: Option<String>,
    pub description: Option<String>,
    pub series_ref: Option<String>,
    pub sex: Option<String>,
    pub sire_code: Option<String>,
    pub dam_code: Option<String>,
    pub mate_code: Option<String>,
    pub in_stock: Option<bool>,
    pub exclude_from_breeding: Option<bool>,
}

fn prefer(primary: &Option<String>, fallback: &Option<String>) -> Option<String> {
    normalize_string(primary.as_deref()).or_else(|| normalize_string(fallback.as_deref()))
}

/// Breeder values over product values, except where the breeder value is
/// blank.
pub fn layer_breeder(base: &AnimalFields, breeder: &AnimalFields) -> AnimalFields {
    AnimalFields {
        name: prefer(&breeder.name, &base.name),
        description: prefer(&breeder.description, &base.description),
        series_ref: prefer(&breeder.series_ref, &base.series_ref),
        sex: prefer(&breeder.sex, &base.sex),
        sire_code: prefer(&breeder.sire_code, &base.sire_code),
        dam_code: prefer(&breeder.dam_code, &base.dam_code),
        mate_code: prefer(&breeder.mate_code, &base.mate_code),
        in_stock: breeder.in_stock.or(base.in_stock),
        exclude_from_breeding: breeder.exclude_from_breeding.or(base.exclude_from_breeding),
    }
}

impl AnimalFields {
    /// Payload record with codes upper-cased and sex normalized.
    pub fn from_legacy(p: &LegacyProduct) -> Self {
        Self {
            name: normalize_string(p.name.as_deref()),
            description: normalize_string(p.description.as_deref()),
            series_ref: normalize_string(p.series_legacy_id.as_deref()),
            sex: normalize_sex(p.sex.as_deref()),
            sire_code: normalize_code(p.sire_code.as_deref()),
            dam_code: normalize_code(p.dam_code.as_deref()),
            mate_code: normalize_code(p.mate_code.as_deref()),
            in_stock: p.in_stock,
            exclude_from_breeding: p.exclude_from_breeding,
        }
    }
}

/// Candidate keeps the raw code so the exact-spelling rule sees it.
fn legacy_candidate(p: &LegacyProduct) -> MatchCandidate {
    MatchCandidate {
        id: p.legacy_id.trim().to_string(),
        scope: String::new(),
        code: p.code.clone().unwrap_or_default(),
        updated_at: parse_opt_date(p.updated_at.as_deref()),
        created_at: parse_opt_date(p.created_at.as_deref()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductOrigin {
    Product,
    Merged,
    BreederOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedProduct {
    /// Stored code (upper-cased key).
    pub code: String,
    pub fields: AnimalFields,
    pub origin: ProductOrigin,
    pub legacy_product_ids: Vec<String>,
    pub legacy_breeder_id: Option<String>,
    /// Legacy product whose fields form the base row.
    pub base_product_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeSkips {
    pub products_no_code: Vec<String>,
    pub breeders_no_code: Vec<String>,
    pub breeders_no_series: Vec<String>,
    /// Breeders sharing a code with an earlier breeder; layered onto the same row.
    pub duplicate_breeders: Vec<String>,
}

/// Resolved product graph for one payload.
#[derive(Debug, Clone, Default)]
pub struct ImportPlan {
    pub products: Vec<PlannedProduct>,
    pub matches: Vec<BreederMatch>,
    pub skips: MergeSkips,
    product_index: HashMap<String, usize>,
    breeder_index: HashMap<String, usize>,
}

impl ImportPlan {
    pub fn index_of_product(&self, legacy_product_id: &str) -> Option<usize> {
        self.product_index.get(legacy_product_id.trim()).copied()
    }

    pub fn index_of_breeder(&self, legacy_breeder_id: &str) -> Option<usize> {
        self.breeder_index.get(legacy_breeder_id.trim()).copied()
    }

    /// Images, featured entries and shares point at legacy product ids; a
    /// breeder-only animal is reachable through its breeder id.
    pub fn resolve(&self, legacy_id: &str) -> Option<usize> {
        self.index_of_product(legacy_id)
            .or_else(|| self.index_of_breeder(legacy_id))
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &BreederMatch> {
        self.matches.iter().filter(|m| m.is_conflict())
    }

    pub fn unmatched(&self) -> impl Iterator<Item = &BreederMatch> {
        self.matches.iter().filter(|m| m.is_unmatched())
    }

    pub fn count_origin(&self, origin: ProductOrigin) -> usize {
        self.products.iter().filter(|p| p.origin == origin).count()
    }
}

/// Build the product graph for a payload. `known_series` holds the legacy
/// series ids that will exist in the target.
pub fn plan_import(payload: &ExportPayload, known_series: &HashSet<String>) -> ImportPlan {
    let mut plan = ImportPlan::default();

    // Product groups by code key, first-seen order.
    let mut group_keys: Vec<String> = Vec::new();
    let mut group_members: HashMap<String, Vec<&LegacyProduct>> = HashMap::new();
    let mut candidates: Vec<MatchCandidate> = Vec::new();
    let mut by_id: HashMap<String, &LegacyProduct> = HashMap::new();
    for p in &payload.products {
        let Some(legacy_id) = normalize_string(Some(&p.legacy_id)) else {
            continue;
        };
        let Some(code) = normalize_string(p.code.as_deref()) else {
            plan.skips.products_no_code.push(legacy_id);
            continue;
        };
        let key = code_key(&code);
        if !group_members.contains_key(&key) {
            group_keys.push(key.clone());
        }
        group_members.entry(key).or_default().push(p);
        candidates.push(legacy_candidate(p));
        by_id.insert(legacy_id, p);
    }
    let index = CodeIndex::build(&candidates);

    let series_ok = |s: Option<String>| s.filter(|id| known_series.contains(id));

    // Decide every breeder before materializing rows.
    let mut breeder_for_group: HashMap<String, Vec<(&LegacyProduct, String, Option<String>)>> =
        HashMap::new();
    let mut breeder_only_keys: Vec<String> = Vec::new();
    let mut breeder_only: HashMap<String, Vec<(&LegacyProduct, Option<String>)>> = HashMap::new();
    for b in &payload.breeders {
        let Some(legacy_id) = normalize_string(Some(&b.legacy_id)) else {
            continue;
        };
        let Some(code) = normalize_string(b.code.as_deref()) else {
            plan.skips.breeders_no_code.push(legacy_id);
            continue;
        };
        let m = match_breeder(&index, &legacy_candidate(b));
        let picked = m
            .picked_product_id
            .as_deref()
            .and_then(|id| by_id.get(id).copied());
        plan.matches.push(m);

        let series = series_ok(
            normalize_string(b.series_legacy_id.as_deref())
                .or_else(|| picked.and_then(|p| normalize_string(p.series_legacy_id.as_deref()))),
        );
        let Some(series) = series else {
            plan.skips.breeders_no_series.push(legacy_id);
            continue;
        };
        let key = code_key(&code);
        match picked {
            Some(p) => breeder_for_group
                .entry(key)
                .or_default()
                .push((b, series, Some(p.legacy_id.trim().to_string()))),
            None => {
                if !breeder_only.contains_key(&key) {
                    breeder_only_keys.push(key.clone());
                }
                breeder_only.entry(key).or_default().push((b, Some(series)));
            }
        }
    }

    for key in group_keys {
        let members = &group_members[&key];
        let breeders = breeder_for_group.remove(&key).unwrap_or_default();
        let member_candidates: Vec<&MatchCandidate> = index.candidates("", &key).to_vec();
        let base_id = match breeders.first() {
            Some((_, _, picked)) => picked.clone(),
            None => pick_candidate("", &member_candidates).map(|c| c.id.clone()),
        };
        let base = base_id
            .as_deref()
            .and_then(|id| by_id.get(id).copied())
            .unwrap_or(members[0]);

        let mut fields = AnimalFields::from_legacy(base);
        fields.series_ref = series_ok(fields.series_ref);
        let mut origin = ProductOrigin::Product;
        let mut legacy_breeder_id = None;
        for (i, (b, series, _)) in breeders.iter().enumerate() {
            let mut layer = AnimalFields::from_legacy(b);
            layer.series_ref = Some(series.clone());
            fields = layer_breeder(&fields, &layer);
            if i == 0 {
                origin = ProductOrigin::Merged;
                legacy_breeder_id = Some(b.legacy_id.trim().to_string());
            } else {
                plan.skips.duplicate_breeders.push(b.legacy_id.trim().to_string());
            }
        }

        let idx = plan.products.len();
        let legacy_product_ids: Vec<String> =
            members.iter().map(|p| p.legacy_id.trim().to_string()).collect();
        for id in &legacy_product_ids {
            plan.product_index.insert(id.clone(), idx);
        }
        for (b, _, _) in &breeders {
            plan.breeder_index.insert(b.legacy_id.trim().to_string(), idx);
        }
        plan.products.push(PlannedProduct {
            code: key,
            fields,
            origin,
            legacy_product_ids,
            legacy_breeder_id,
            base_product_id: Some(base.legacy_id.trim().to_string()),
        });
    }

    for key in breeder_only_keys {
        let rows = &breeder_only[&key];
        let mut fields = AnimalFields::default();
        for (i, (b, series)) in rows.iter().enumerate() {
            let mut layer = AnimalFields::from_legacy(b);
            layer.series_ref = series.clone();
            fields = layer_breeder(&fields, &layer);
            if i > 0 {
                plan.skips.duplicate_breeders.push(b.legacy_id.trim().to_string());
            }
        }
        let idx = plan.products.len();
        for (b, _) in rows {
            plan.breeder_index.insert(b.legacy_id.trim().to_string(), idx);
        }
        plan.products.push(PlannedProduct {
            code: key,
            fields,
            origin: ProductOrigin::BreederOnly,
            legacy_product_ids: Vec::new(),
            legacy_breeder_id: Some(rows[0].0.legacy_id.trim().to_string()),
            base_product_id: None,
        });
    }

    plan
}

/// Deterministic id for a product created from an unmatched breeder.
pub fn merged_product_id(breeder_id: &str) -> String {
    format!("prd_merge_{breeder_id}")
}

/// Write set for folding legacy `breeders` rows into `products` inside one
/// target database.
#[derive(Debug, Clone, Default)]
pub struct BreederMergePlan {
    pub matches: Vec<BreederMatch>,
    /// Existing products receiving breeder values.
    pub updates: Vec<ProductRow>,
    /// New products for unmatched breeders.
    pub inserts: Vec<ProductRow>,
    pub skipped_no_series: Vec<String>,
    /// Breeders sharing a tenant and code key with an earlier breeder;
    /// layered onto that breeder's row.
    pub duplicate_breeders: Vec<String>,
    /// Legacy breeder id to the product id its events move to.
    pub breeder_to_product: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
enum MergeSlot {
    Update(usize),
    Insert(usize),
}

impl BreederMergePlan {
    pub fn conflicts(&self) -> impl Iterator<Item = &BreederMatch> {
        self.matches.iter().filter(|m| m.is_conflict())
    }

    pub fn unmatched(&self) -> impl Iterator<Item = &BreederMatch> {
        self.matches.iter().filter(|m| m.is_unmatched())
    }
}

fn product_fields(p: &ExistingProduct) -> AnimalFields {
    AnimalFields {
        name: p.name.clone(),
        description: p.description.clone(),
        series_ref: p.series_id.clone(),
        sex: p.sex.clone(),
        sire_code: p.sire_code.clone(),
        dam_code: p.dam_code.clone(),
        mate_code: p.mate_code.clone(),
        in_stock: p.in_stock,
        exclude_from_breeding: None,
    }
}

fn breeder_fields(b: &LegacyBreederRow) -> AnimalFields {
    AnimalFields {
        name: b.name.clone(),
        description: b.description.clone(),
        series_ref: b.series_id.clone(),
        sex: b.sex.clone(),
        sire_code: b.sire_code.clone(),
        dam_code: b.dam_code.clone(),
        mate_code: b.mate_code.clone(),
        in_stock: b.is_active,
        exclude_from_breeding: None,
    }
}

fn fields_of_row(r: &ProductRow) -> AnimalFields {
    AnimalFields {
        name: r.name.clone(),
        description: r.description.clone(),
        series_ref: r.series_id.clone(),
        sex: r.sex.clone(),
        sire_code: r.sire_code.clone(),
        dam_code: r.dam_code.clone(),
        mate_code: r.mate_code.clone(),
        in_stock: r.in_stock,
        exclude_from_breeding: r.exclude_from_breeding,
    }
}

fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn row_from_fields(
    id: String,
    tenant_id: &str,
    code: &str,
    fields: AnimalFields,
    legacy_breeder_id: &str,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
) -> ProductRow {
    ProductRow {
        id: Some(id),
        tenant_id: tenant_id.to_string(),
        code: code.to_string(),
        series_id: fields.series_ref,
        name: fields.name,
        description: fields.description,
        sex: fields.sex,
        sire_code: fields.sire_code,
        dam_code: fields.dam_code,
        mate_code: fields.mate_code,
        in_stock: fields.in_stock,
        exclude_from_breeding: fields.exclude_from_breeding,
        legacy_breeder_id: Some(legacy_breeder_id.to_string()),
        created_at,
        updated_at,
    }
}

/// Plan the in-database breeder fold. Matching is scoped per tenant.
pub fn plan_breeder_merge(
    products: &[ExistingProduct],
    breeders: &[LegacyBreederRow],
) -> BreederMergePlan {
    let candidates: Vec<MatchCandidate> = products
        .iter()
        .map(|p| MatchCandidate {
            id: p.id.clone(),
            scope: p.tenant_id.clone(),
            code: p.code.clone(),
            updated_at: p.updated_at,
            created_at: p.created_at,
        })
        .collect();
    let index = CodeIndex::build(&candidates);
    let by_id: HashMap<&str, &ExistingProduct> =
        products.iter().map(|p| (p.id.as_str(), p)).collect();

    let mut plan = BreederMergePlan::default();
    let mut slots: HashMap<(String, String), MergeSlot> = HashMap::new();
    let mut sorted: Vec<&LegacyBreederRow> = breeders.iter().collect();
    sorted.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id).then_with(|| a.id.cmp(&b.id)));

    for b in sorted {
        let me = MatchCandidate {
            id: b.id.clone(),
            scope: b.tenant_id.clone(),
            code: b.code.clone(),
            updated_at: b.updated_at,
            created_at: b.created_at,
        };
        let m = match_breeder(&index, &me);
        let picked = m
            .picked_product_id
            .as_deref()
            .and_then(|id| by_id.get(id).copied());
        plan.matches.push(m);

        let layer = breeder_fields(b);
        let slot_key = (b.tenant_id.clone(), code_key(&b.code));
        if let Some(slot) = slots.get(&slot_key).copied() {
            let row = match slot {
                MergeSlot::Update(i) => &mut plan.updates[i],
                MergeSlot::Insert(i) => &mut plan.inserts[i],
            };
            let fields = layer_breeder(&fields_of_row(row), &layer);
            let (id, created_at, updated_at) = (
                row.id.clone().unwrap_or_default(),
                row.created_at,
                later(row.updated_at, b.updated_at),
            );
            let legacy_breeder_id = row.legacy_breeder_id.clone().unwrap_or_default();
            let code = row.code.clone();
            *row = row_from_fields(
                id.clone(),
                &b.tenant_id,
                &code,
                fields,
                &legacy_breeder_id,
                created_at,
                updated_at,
            );
            plan.breeder_to_product.insert(b.id.clone(), id);
            plan.duplicate_breeders.push(b.id.clone());
            continue;
        }

        match picked {
            Some(p) => {
                let fields = layer_breeder(&product_fields(p), &layer);
                if fields.series_ref.is_none() {
                    plan.skipped_no_series.push(b.id.clone());
                    continue;
                }
                plan.breeder_to_product.insert(b.id.clone(), p.id.clone());
                slots.insert(slot_key, MergeSlot::Update(plan.updates.len()));
                plan.updates.push(row_from_fields(
                    p.id.clone(),
                    &p.tenant_id,
                    &p.code,
                    fields,
                    &b.id,
                    p.created_at,
                    later(p.updated_at, b.updated_at),
                ));
            }
            None => {
                let mut fields = layer_breeder(&AnimalFields::default(), &layer);
                if fields.series_ref.is_none() {
                    plan.skipped_no_series.push(b.id.clone());
                    continue;
                }
                if fields.name.is_none() {
                    fields.name = normalize_string(Some(&b.code));
                }
                let id = merged_product_id(&b.id);
                plan.breeder_to_product.insert(b.id.clone(), id.clone());
                slots.insert(slot_key, MergeSlot::Insert(plan.inserts.len()));
                plan.inserts.push(row_from_fields(
                    id,
                    &b.tenant_id,
                    b.code.trim(),
                    fields,
                    &b.id,
                    b.created_at,
                    b.updated_at,
                ));
            }
        }
    }
    plan
}
