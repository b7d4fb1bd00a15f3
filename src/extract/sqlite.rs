//! Legacy single-tenant SQLite source, read-only.
//!
//! The legacy app has no breeders table: a breeder is a `products` row
//! with both `series_id` and `sex` set. Those rows are exported twice, once
//! as a product and once as a breeder with the same legacy id.
use anyhow::{Context, Result};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::{dedupe_users, finish_payload};
use crate::normalization::normalize_string;
use crate::payload::{
    ExportPayload, LegacyBreederEvent, LegacyFeaturedProduct, LegacyProduct, LegacyProductImage,
    LegacySeries, LegacyUser,
};
use crate::util::db::{open_sqlite_read_only, sqlite_table_exists};

const REQUIRED_TABLES: [&str; 3] = ["series", "products", "product_images"];
const OPTIONAL_TABLES: [&str; 3] = ["users", "featured_products", "breeder_events"];

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Option<String>,
    username: Option<String>,
    role: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct SeriesRow {
    id: String,
    code: Option<String>,
    name: Option<String>,
    description: Option<String>,
    sort_order: Option<i64>,
    is_active: Option<i64>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: String,
    code: Option<String>,
    name: Option<String>,
    description: Option<String>,
    series_id: Option<String>,
    sex: Option<String>,
    sire_code: Option<String>,
    dam_code: Option<String>,
    mate_code: Option<String>,
    in_stock: Option<i64>,
    is_featured: Option<i64>,
    exclude_from_breeding: Option<i64>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

impl ProductRow {
    fn is_breeder(&self) -> bool {
        normalize_string(self.series_id.as_deref()).is_some() && normalize_string(self.sex.as_deref()).is_some()
    }

    fn into_legacy(self) -> LegacyProduct {
        LegacyProduct {
            legacy_id: self.id,
            code: self.code,
            name: self.name,
            description: self.description,
            series_legacy_id: normalize_string(self.series_id.as_deref()),
            sex: self.sex,
            sire_code: self.sire_code,
            dam_code: self.dam_code,
            mate_code: self.mate_code,
            exclude_from_breeding: Some(self.exclude_from_breeding.unwrap_or(0) != 0),
            in_stock: Some(self.in_stock.unwrap_or(1) != 0),
            is_featured: Some(self.is_featured.unwrap_or(0) != 0),
            created_at: self.created_at,
            updated_at: self.updated_at,
            images: Vec::new(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ImageRow {
    id: String,
    product_id: Option<String>,
    url: Option<String>,
    kind: Option<String>,
    sort_order: Option<i64>,
    created_at: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct FeaturedRow {
    id: String,
    product_id: Option<String>,
    is_active: Option<i64>,
    sort_order: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: String,
    product_id: Option<String>,
    event_type: Option<String>,
    event_date: Option<String>,
    male_code: Option<String>,
    egg_count: Option<i64>,
    note: Option<String>,
    old_mate_code: Option<String>,
    new_mate_code: Option<String>,
    created_at: Option<String>,
}

/// Read every legacy table from an open pool into a finished payload.
pub async fn export_from_pool(pool: &SqlitePool, source_path: &str) -> Result<ExportPayload> {
    let mut issues = Vec::new();
    let mut present = Vec::new();
    for table in REQUIRED_TABLES {
        if !sqlite_table_exists(pool, table).await? {
            anyhow::bail!("legacy sqlite database {source_path} has no `{table}` table");
        }
        present.push(table);
    }
    for table in OPTIONAL_TABLES {
        if sqlite_table_exists(pool, table).await? {
            present.push(table);
        } else {
            warn!(table, "optional legacy table missing");
            let what = match table {
                "breeder_events" => "events",
                "featured_products" => "featured products",
                _ => "users",
            };
            issues.push(format!("table {table} missing; no {what} exported"));
        }
    }

    let mut payload = ExportPayload::empty(json!({}));

    if present.contains(&"users") {
        let rows: Vec<UserRow> =
            sqlx::query_as("SELECT CAST(id AS TEXT) AS id, username, role FROM users ORDER BY id")
                .fetch_all(pool)
                .await
                .context("read legacy users")?;
        payload.users = dedupe_users(
            rows.into_iter()
                .filter_map(|r| {
                    Some(LegacyUser {
                        legacy_id: r.id,
                        username: normalize_string(r.username.as_deref())?,
                        role: r.role,
                        is_active: true,
                    })
                })
                .collect(),
        );
    }

    let series: Vec<SeriesRow> = sqlx::query_as(
        "SELECT CAST(id AS TEXT) AS id, code, name, description, \
         CAST(sort_order AS INTEGER) AS sort_order, CAST(is_active AS INTEGER) AS is_active, \
         CAST(created_at AS TEXT) AS created_at, CAST(updated_at AS TEXT) AS updated_at \
         FROM series ORDER BY sort_order, id",
    )
    .fetch_all(pool)
    .await
    .context("read legacy series")?;
    payload.series = series
        .into_iter()
        .map(|s| LegacySeries {
            legacy_id: s.id,
            code: s.code,
            name: s.name,
            description: s.description,
            sort_order: s.sort_order.unwrap_or(0).max(0),
            is_active: s.is_active.unwrap_or(1) != 0,
            created_at: s.created_at,
            updated_at: s.updated_at,
        })
        .collect();

    let products: Vec<ProductRow> = sqlx::query_as(
        "SELECT CAST(id AS TEXT) AS id, code, name, description, CAST(series_id AS TEXT) AS series_id, \
         sex, sire_code, dam_code, mate_code, \
         CAST(in_stock AS INTEGER) AS in_stock, CAST(is_featured AS INTEGER) AS is_featured, \
         CAST(exclude_from_breeding AS INTEGER) AS exclude_from_breeding, \
         CAST(created_at AS TEXT) AS created_at, CAST(updated_at AS TEXT) AS updated_at \
         FROM products ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .context("read legacy products")?;
    for row in products {
        let breeder = row.is_breeder();
        let legacy = row.into_legacy();
        if breeder {
            payload.breeders.push(legacy.clone());
        }
        payload.products.push(legacy);
    }

    let images: Vec<ImageRow> = sqlx::query_as(
        "SELECT CAST(id AS TEXT) AS id, CAST(product_id AS TEXT) AS product_id, url, type AS kind, \
         CAST(sort_order AS INTEGER) AS sort_order, CAST(created_at AS TEXT) AS created_at \
         FROM product_images ORDER BY product_id, sort_order, id",
    )
    .fetch_all(pool)
    .await
    .context("read legacy product_images")?;
    payload.product_images = images
        .into_iter()
        .map(|r| LegacyProductImage {
            legacy_id: r.id,
            legacy_product_id: r.product_id.unwrap_or_default(),
            url: r.url,
            kind: r.kind,
            sort_order: r.sort_order.unwrap_or(0).max(0),
            created_at: r.created_at,
        })
        .collect();

    if present.contains(&"featured_products") {
        let rows: Vec<FeaturedRow> = sqlx::query_as(
            "SELECT CAST(id AS TEXT) AS id, CAST(product_id AS TEXT) AS product_id, \
             CAST(is_active AS INTEGER) AS is_active, CAST(sort_order AS INTEGER) AS sort_order \
             FROM featured_products ORDER BY sort_order, id",
        )
        .fetch_all(pool)
        .await
        .context("read legacy featured_products")?;
        payload.featured_products = rows
            .into_iter()
            .filter_map(|r| {
                Some(LegacyFeaturedProduct {
                    legacy_id: r.id,
                    legacy_product_id: normalize_string(r.product_id.as_deref())?,
                    sort_order: r.sort_order.unwrap_or(0).max(0),
                    is_active: r.is_active.unwrap_or(1) != 0,
                })
            })
            .collect();
    }

    if present.contains(&"breeder_events") {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT CAST(id AS TEXT) AS id, CAST(product_id AS TEXT) AS product_id, event_type, \
             CAST(event_date AS TEXT) AS event_date, male_code, CAST(egg_count AS INTEGER) AS egg_count, \
             note, old_mate_code, new_mate_code, CAST(created_at AS TEXT) AS created_at \
             FROM breeder_events ORDER BY event_date, id",
        )
        .fetch_all(pool)
        .await
        .context("read legacy breeder_events")?;
        payload.breeder_events = rows
            .into_iter()
            .map(|r| LegacyBreederEvent {
                legacy_id: r.id,
                legacy_breeder_id: r.product_id.unwrap_or_default(),
                event_type: r.event_type,
                event_date: r.event_date,
                male_code: r.male_code,
                egg_count: r.egg_count.map(|n| n.max(0)),
                note: r.note,
                old_mate_code: r.old_mate_code,
                new_mate_code: r.new_mate_code,
                created_at: r.created_at,
            })
            .collect();
    }

    payload.source = json!({
        "type": "legacy_sqlite",
        "mode": "file",
        "path": source_path,
        "tables": present,
    });
    finish_payload(&mut payload, issues);
    info!(
        products = payload.products.len(),
        breeders = payload.breeders.len(),
        events = payload.breeder_events.len(),
        "legacy sqlite export assembled"
    );
    Ok(payload)
}

/// Open `path` read-only and export it.
pub async fn export_from_sqlite(path: &str) -> Result<ExportPayload> {
    let pool = open_sqlite_read_only(path).await?;
    let payload = export_from_pool(&pool, path).await;
    pool.close().await;
    payload
}
