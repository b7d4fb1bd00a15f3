//! Target store seam.
//!
//! The writer only sees [`UnitOfWork`]: every mutation of one run goes
//! through a single unit that is either committed or rolled back. Reads used
//! for previews, readback and the in-database breeder fold live on
//! [`TargetStore`] and [`LegacyBreederSource`] and never mutate.
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use postgres::PgStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub id: String,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemberRole {
    Owner,
    Editor,
    Viewer,
    Admin,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "OWNER",
            MemberRole::Editor => "EDITOR",
            MemberRole::Viewer => "VIEWER",
            MemberRole::Admin => "ADMIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    pub tenant_id: String,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub sort_order: i64,
    pub is_active: bool,
}

/// Product write. Keyed by (tenant, code); `id` is only used on insert.
/// `None` fields keep whatever the row already holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductRow {
    pub id: Option<String>,
    pub tenant_id: String,
    pub code: String,
    pub series_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub sex: Option<String>,
    pub sire_code: Option<String>,
    pub dam_code: Option<String>,
    pub mate_code: Option<String>,
    pub in_stock: Option<bool>,
    pub exclude_from_breeding: Option<bool>,
    pub legacy_breeder_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Product as read back from the target.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct ExistingProduct {
    pub id: String,
    pub tenant_id: String,
    pub code: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub series_id: Option<String>,
    pub sex: Option<String>,
    pub sire_code: Option<String>,
    pub dam_code: Option<String>,
    pub mate_code: Option<String>,
    pub in_stock: Option<bool>,
    pub legacy_breeder_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Row of the pre-unification `breeders` table.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct LegacyBreederRow {
    pub id: String,
    pub tenant_id: String,
    pub series_id: Option<String>,
    pub code: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub sex: Option<String>,
    pub sire_code: Option<String>,
    pub dam_code: Option<String>,
    pub mate_code: Option<String>,
    pub is_active: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Row of the pre-unification `breeder_events` table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct LegacyBreederEventRow {
    pub id: String,
    pub tenant_id: String,
    pub breeder_id: String,
    pub event_type: String,
    pub event_date: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

/// Event insert. (tenant, product, type, date, note) identifies an event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub id: Option<String>,
    pub tenant_id: String,
    pub product_id: String,
    pub event_type: String,
    pub event_date: DateTime<Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRow {
    pub tenant_id: String,
    pub product_id: String,
    pub key: String,
    pub url: String,
    pub content_type: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShareRow {
    pub tenant_id: String,
    pub product_id: String,
    pub share_token: String,
    pub created_by_user_id: String,
}

/// Tenant-scoped tables the reporter counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetTable {
    Series,
    Products,
    ProductEvents,
    ProductImages,
    FeaturedProducts,
    PublicShares,
}

impl TargetTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            TargetTable::Series => "series",
            TargetTable::Products => "products",
            TargetTable::ProductEvents => "product_events",
            TargetTable::ProductImages => "product_images",
            TargetTable::FeaturedProducts => "featured_products",
            TargetTable::PublicShares => "public_shares",
        }
    }

    /// Whether the table carries a `product_id` column.
    pub fn has_product_id(&self) -> bool {
        !matches!(self, TargetTable::Series | TargetTable::Products)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RowScope<'a> {
    Tenant(&'a str),
    Ids(&'a str, &'a [String]),
    ProductIds(&'a str, &'a [String]),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTablesPresence {
    pub breeders: bool,
    pub breeder_events: bool,
}

impl LegacyTablesPresence {
    pub fn all_present(&self) -> bool {
        self.breeders && self.breeder_events
    }
}

#[async_trait::async_trait]
pub trait UnitOfWork: Send {
    async fn upsert_user(&mut self, email: &str, name: &str) -> Result<Upserted>;
    async fn upsert_tenant(&mut self, slug: &str, name: &str) -> Result<Upserted>;
    async fn upsert_member(&mut self, tenant_id: &str, user_id: &str, role: MemberRole) -> Result<Upserted>;
    async fn upsert_series(&mut self, row: &SeriesRow) -> Result<Upserted>;
    async fn upsert_product(&mut self, row: &ProductRow) -> Result<Upserted>;
    /// Existing event with the same identifying tuple.
    async fn find_event(&mut self, row: &EventRow) -> Result<Option<String>>;
    async fn insert_event(&mut self, row: &EventRow) -> Result<String>;
    async fn upsert_image(&mut self, row: &ImageRow) -> Result<Upserted>;
    /// Returns the number of rows that lost the flag.
    async fn clear_main_images(&mut self, tenant_id: &str, product_id: &str) -> Result<u64>;
    async fn mark_main_image(&mut self, image_id: &str) -> Result<()>;
    async fn upsert_featured(&mut self, tenant_id: &str, product_id: &str, sort_order: i64) -> Result<Upserted>;
    async fn upsert_share(&mut self, row: &ShareRow) -> Result<Upserted>;
    async fn drop_legacy_breeder_tables(&mut self) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait::async_trait]
pub trait TargetStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>>;
    async fn find_tenant_id(&self, slug: &str) -> Result<Option<String>>;
    async fn find_user_id(&self, email: &str) -> Result<Option<String>>;
    /// How many of `codes` already exist for the tenant (series or products).
    async fn count_existing_codes(&self, table: TargetTable, tenant_id: &str, codes: &[String]) -> Result<i64>;
    async fn count_rows(&self, table: TargetTable, scope: RowScope<'_>) -> Result<i64>;
    /// Products among `product_ids` that have images but not exactly one main image.
    async fn count_main_image_violations(&self, tenant_id: &str, product_ids: &[String]) -> Result<i64>;
}

/// Read access to the pre-unification tables still present in a target.
#[async_trait::async_trait]
pub trait LegacyBreederSource: Send + Sync {
    async fn legacy_tables(&self) -> Result<LegacyTablesPresence>;
    /// Columns the fold writes to; `Err` names what is missing.
    async fn check_merge_columns(&self) -> Result<()>;
    async fn load_products(&self) -> Result<Vec<ExistingProduct>>;
    async fn load_legacy_breeders(&self) -> Result<Vec<LegacyBreederRow>>;
    async fn load_legacy_breeder_events(&self) -> Result<Vec<LegacyBreederEventRow>>;
    async fn count_products_with_legacy_breeder(&self) -> Result<i64>;
    async fn count_product_events(&self) -> Result<i64>;
}
