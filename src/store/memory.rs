//! In-memory target used by tests. A unit stages a full copy of the state
//! and swaps it in on commit, so rollback and dropped units leave the store
//! untouched.
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{
    EventRow, ExistingProduct, ImageRow, LegacyBreederEventRow, LegacyBreederRow,
    LegacyBreederSource, LegacyTablesPresence, MemberRole, ProductRow, RowScope, SeriesRow,
    ShareRow, TargetStore, TargetTable, UnitOfWork, Upserted,
};

#[derive(Debug, Clone)]
pub struct UserRec {
    pub id: String,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct TenantRec {
    pub id: String,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct MemberRec {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub role: MemberRole,
}

#[derive(Debug, Clone)]
pub struct SeriesRec {
    pub id: String,
    pub row: SeriesRow,
}

#[derive(Debug, Clone)]
pub struct ProductRec {
    pub product: ExistingProduct,
    pub exclude_from_breeding: bool,
}

#[derive(Debug, Clone)]
pub struct ImageRec {
    pub id: String,
    pub row: ImageRow,
    pub is_main: bool,
}

#[derive(Debug, Clone)]
pub struct EventRec {
    pub id: String,
    pub tenant_id: String,
    pub product_id: String,
    pub event_type: String,
    pub event_date: DateTime<Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FeaturedRec {
    pub id: String,
    pub tenant_id: String,
    pub product_id: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone)]
pub struct ShareRec {
    pub id: String,
    pub row: ShareRow,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub users: Vec<UserRec>,
    pub tenants: Vec<TenantRec>,
    pub members: Vec<MemberRec>,
    pub series: Vec<SeriesRec>,
    pub products: Vec<ProductRec>,
    pub images: Vec<ImageRec>,
    pub events: Vec<EventRec>,
    pub featured: Vec<FeaturedRec>,
    pub shares: Vec<ShareRec>,
    pub legacy_breeders: Option<Vec<LegacyBreederRow>>,
    pub legacy_breeder_events: Option<Vec<LegacyBreederEventRow>>,
    pub(crate) next_id: u64,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Row count per table, for before/after comparisons.
    pub fn row_counts(&self) -> [usize; 9] {
        [
            self.users.len(),
            self.tenants.len(),
            self.members.len(),
            self.series.len(),
            self.products.len(),
            self.images.len(),
            self.events.len(),
            self.featured.len(),
            self.shares.len(),
        ]
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    reads: AtomicUsize,
    units: AtomicUsize,
    /// Fail the next unit's commit, to exercise rollback paths.
    pub fail_on_commit: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MemoryState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of read queries plus opened units.
    pub fn touches(&self) -> usize {
        self.reads.load(Ordering::SeqCst) + self.units.load(Ordering::SeqCst)
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> Result<T> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let guard = self.state.lock().map_err(|_| anyhow!("memory store poisoned"))?;
        Ok(f(&guard))
    }
}

pub struct MemoryUnit<'a> {
    store: &'a MemoryStore,
    staged: MemoryState,
}

fn or_keep<T: Clone>(new: &Option<T>, old: &Option<T>) -> Option<T> {
    new.clone().or_else(|| old.clone())
}

#[async_trait::async_trait]
impl UnitOfWork for MemoryUnit<'_> {
    async fn upsert_user(&mut self, email: &str, name: &str) -> Result<Upserted> {
        if let Some(u) = self.staged.users.iter().find(|u| u.email == email) {
            return Ok(Upserted { id: u.id.clone(), created: false });
        }
        let id = self.staged.next_id("usr");
        self.staged.users.push(UserRec {
            id: id.clone(),
            email: email.to_string(),
            name: name.to_string(),
        });
        Ok(Upserted { id, created: true })
    }

    async fn upsert_tenant(&mut self, slug: &str, name: &str) -> Result<Upserted> {
        if let Some(t) = self.staged.tenants.iter_mut().find(|t| t.slug == slug) {
            t.name = name.to_string();
            return Ok(Upserted { id: t.id.clone(), created: false });
        }
        let id = self.staged.next_id("ten");
        self.staged.tenants.push(TenantRec {
            id: id.clone(),
            slug: slug.to_string(),
            name: name.to_string(),
        });
        Ok(Upserted { id, created: true })
    }

    async fn upsert_member(&mut self, tenant_id: &str, user_id: &str, role: MemberRole) -> Result<Upserted> {
        if let Some(m) = self
            .staged
            .members
            .iter_mut()
            .find(|m| m.tenant_id == tenant_id && m.user_id == user_id)
        {
            m.role = role;
            return Ok(Upserted { id: m.id.clone(), created: false });
        }
        let id = self.staged.next_id("mem");
        self.staged.members.push(MemberRec {
            id: id.clone(),
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            role,
        });
        Ok(Upserted { id, created: true })
    }

    async fn upsert_series(&mut self, row: &SeriesRow) -> Result<Upserted> {
        if let Some(s) = self
            .staged
            .series
            .iter_mut()
            .find(|s| s.row.tenant_id == row.tenant_id && s.row.code == row.code)
        {
            let description = or_keep(&row.description, &s.row.description);
            s.row = SeriesRow { description, ..row.clone() };
            return Ok(Upserted { id: s.id.clone(), created: false });
        }
        let id = self.staged.next_id("ser");
        self.staged.series.push(SeriesRec { id: id.clone(), row: row.clone() });
        Ok(Upserted { id, created: true })
    }

    async fn upsert_product(&mut self, row: &ProductRow) -> Result<Upserted> {
        let now = Utc::now();
        if let Some(rec) = self
            .staged
            .products
            .iter_mut()
            .find(|p| p.product.tenant_id == row.tenant_id && p.product.code == row.code)
        {
            let p = &mut rec.product;
            p.series_id = or_keep(&row.series_id, &p.series_id);
            p.name = or_keep(&row.name, &p.name);
            p.description = or_keep(&row.description, &p.description);
            p.sex = or_keep(&row.sex, &p.sex);
            p.sire_code = or_keep(&row.sire_code, &p.sire_code);
            p.dam_code = or_keep(&row.dam_code, &p.dam_code);
            p.mate_code = or_keep(&row.mate_code, &p.mate_code);
            p.in_stock = or_keep(&row.in_stock, &p.in_stock);
            p.legacy_breeder_id = or_keep(&row.legacy_breeder_id, &p.legacy_breeder_id);
            p.updated_at = Some(row.updated_at.unwrap_or(now));
            if let Some(flag) = row.exclude_from_breeding {
                rec.exclude_from_breeding = flag;
            }
            return Ok(Upserted { id: p.id.clone(), created: false });
        }
        let id = match &row.id {
            Some(id) => id.clone(),
            None => self.staged.next_id("prd"),
        };
        if self.staged.products.iter().any(|p| p.product.id == id) {
            bail!("duplicate key products.id = {id}");
        }
        self.staged.products.push(ProductRec {
            product: ExistingProduct {
                id: id.clone(),
                tenant_id: row.tenant_id.clone(),
                code: row.code.clone(),
                name: row.name.clone(),
                description: row.description.clone(),
                series_id: row.series_id.clone(),
                sex: row.sex.clone(),
                sire_code: row.sire_code.clone(),
                dam_code: row.dam_code.clone(),
                mate_code: row.mate_code.clone(),
                in_stock: Some(row.in_stock.unwrap_or(true)),
                legacy_breeder_id: row.legacy_breeder_id.clone(),
                created_at: Some(row.created_at.unwrap_or(now)),
                updated_at: Some(row.updated_at.unwrap_or(now)),
            },
            exclude_from_breeding: row.exclude_from_breeding.unwrap_or(false),
        });
        Ok(Upserted { id, created: true })
    }

    async fn find_event(&mut self, row: &EventRow) -> Result<Option<String>> {
        Ok(self
            .staged
            .events
            .iter()
            .find(|e| {
                e.tenant_id == row.tenant_id
                    && e.product_id == row.product_id
                    && e.event_type == row.event_type
                    && e.event_date == row.event_date
                    && e.note == row.note
            })
            .map(|e| e.id.clone()))
    }

    async fn insert_event(&mut self, row: &EventRow) -> Result<String> {
        let id = match &row.id {
            Some(id) => id.clone(),
            None => self.staged.next_id("evt"),
        };
        if self.staged.events.iter().any(|e| e.id == id) {
            return Ok(id);
        }
        self.staged.events.push(EventRec {
            id: id.clone(),
            tenant_id: row.tenant_id.clone(),
            product_id: row.product_id.clone(),
            event_type: row.event_type.clone(),
            event_date: row.event_date,
            note: row.note.clone(),
        });
        Ok(id)
    }

    async fn upsert_image(&mut self, row: &ImageRow) -> Result<Upserted> {
        if let Some(img) = self.staged.images.iter_mut().find(|i| {
            i.row.tenant_id == row.tenant_id && i.row.product_id == row.product_id && i.row.key == row.key
        }) {
            let content_type = or_keep(&row.content_type, &img.row.content_type);
            img.row = ImageRow { content_type, ..row.clone() };
            return Ok(Upserted { id: img.id.clone(), created: false });
        }
        let id = self.staged.next_id("img");
        self.staged.images.push(ImageRec {
            id: id.clone(),
            row: row.clone(),
            is_main: false,
        });
        Ok(Upserted { id, created: true })
    }

    async fn clear_main_images(&mut self, tenant_id: &str, product_id: &str) -> Result<u64> {
        let mut n = 0;
        for img in self
            .staged
            .images
            .iter_mut()
            .filter(|i| i.row.tenant_id == tenant_id && i.row.product_id == product_id && i.is_main)
        {
            img.is_main = false;
            n += 1;
        }
        Ok(n)
    }

    async fn mark_main_image(&mut self, image_id: &str) -> Result<()> {
        let img = self
            .staged
            .images
            .iter_mut()
            .find(|i| i.id == image_id)
            .ok_or_else(|| anyhow!("image {image_id} not found"))?;
        img.is_main = true;
        Ok(())
    }

    async fn upsert_featured(&mut self, tenant_id: &str, product_id: &str, sort_order: i64) -> Result<Upserted> {
        if let Some(f) = self
            .staged
            .featured
            .iter_mut()
            .find(|f| f.tenant_id == tenant_id && f.product_id == product_id)
        {
            f.sort_order = sort_order;
            return Ok(Upserted { id: f.id.clone(), created: false });
        }
        let id = self.staged.next_id("fea");
        self.staged.featured.push(FeaturedRec {
            id: id.clone(),
            tenant_id: tenant_id.to_string(),
            product_id: product_id.to_string(),
            sort_order,
        });
        Ok(Upserted { id, created: true })
    }

    async fn upsert_share(&mut self, row: &ShareRow) -> Result<Upserted> {
        if let Some(s) = self
            .staged
            .shares
            .iter_mut()
            .find(|s| s.row.tenant_id == row.tenant_id && s.row.product_id == row.product_id)
        {
            s.row.created_by_user_id = row.created_by_user_id.clone();
            return Ok(Upserted { id: s.id.clone(), created: false });
        }
        if self.staged.shares.iter().any(|s| s.row.share_token == row.share_token) {
            bail!("duplicate key public_shares.share_token");
        }
        let id = self.staged.next_id("shr");
        self.staged.shares.push(ShareRec { id: id.clone(), row: row.clone() });
        Ok(Upserted { id, created: true })
    }

    async fn drop_legacy_breeder_tables(&mut self) -> Result<()> {
        self.staged.legacy_breeder_events = None;
        self.staged.legacy_breeders = None;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let unit = *self;
        if unit.store.fail_on_commit.load(Ordering::SeqCst) {
            bail!("simulated commit failure");
        }
        let mut guard = unit
            .store
            .state
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))?;
        *guard = unit.staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn table_len(state: &MemoryState, table: TargetTable, tenant_id: &str, keep: impl Fn(&str, Option<&str>) -> bool) -> i64 {
    let rows: Vec<(&str, &str, Option<&str>)> = match table {
        TargetTable::Series => state
            .series
            .iter()
            .map(|s| (s.row.tenant_id.as_str(), s.id.as_str(), None))
            .collect(),
        TargetTable::Products => state
            .products
            .iter()
            .map(|p| (p.product.tenant_id.as_str(), p.product.id.as_str(), None))
            .collect(),
        TargetTable::ProductEvents => state
            .events
            .iter()
            .map(|e| (e.tenant_id.as_str(), e.id.as_str(), Some(e.product_id.as_str())))
            .collect(),
        TargetTable::ProductImages => state
            .images
            .iter()
            .map(|i| (i.row.tenant_id.as_str(), i.id.as_str(), Some(i.row.product_id.as_str())))
            .collect(),
        TargetTable::FeaturedProducts => state
            .featured
            .iter()
            .map(|f| (f.tenant_id.as_str(), f.id.as_str(), Some(f.product_id.as_str())))
            .collect(),
        TargetTable::PublicShares => state
            .shares
            .iter()
            .map(|s| (s.row.tenant_id.as_str(), s.id.as_str(), Some(s.row.product_id.as_str())))
            .collect(),
    };
    rows.into_iter()
        .filter(|(t, id, pid)| *t == tenant_id && keep(id, *pid))
        .count() as i64
}

#[async_trait::async_trait]
impl TargetStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>> {
        self.units.fetch_add(1, Ordering::SeqCst);
        let staged = self.snapshot();
        Ok(Box::new(MemoryUnit { store: self, staged }))
    }

    async fn find_tenant_id(&self, slug: &str) -> Result<Option<String>> {
        self.read(|s| s.tenants.iter().find(|t| t.slug == slug).map(|t| t.id.clone()))
    }

    async fn find_user_id(&self, email: &str) -> Result<Option<String>> {
        self.read(|s| s.users.iter().find(|u| u.email == email).map(|u| u.id.clone()))
    }

    async fn count_existing_codes(&self, table: TargetTable, tenant_id: &str, codes: &[String]) -> Result<i64> {
        self.read(|s| match table {
            TargetTable::Series => Ok(s
                .series
                .iter()
                .filter(|r| r.row.tenant_id == tenant_id && codes.contains(&r.row.code))
                .count() as i64),
            TargetTable::Products => Ok(s
                .products
                .iter()
                .filter(|r| r.product.tenant_id == tenant_id && codes.contains(&r.product.code))
                .count() as i64),
            other => Err(anyhow!("{} has no code column", other.table_name())),
        })?
    }

    async fn count_rows(&self, table: TargetTable, scope: RowScope<'_>) -> Result<i64> {
        self.read(|s| match scope {
            RowScope::Tenant(t) => Ok(table_len(s, table, t, |_, _| true)),
            RowScope::Ids(t, ids) => Ok(table_len(s, table, t, |id, _| ids.iter().any(|x| x == id))),
            RowScope::ProductIds(t, pids) => {
                if !table.has_product_id() {
                    return Err(anyhow!("{} has no product_id column", table.table_name()));
                }
                Ok(table_len(s, table, t, |_, pid| {
                    pid.is_some_and(|p| pids.iter().any(|x| x == p))
                }))
            }
        })?
    }

    async fn count_main_image_violations(&self, tenant_id: &str, product_ids: &[String]) -> Result<i64> {
        self.read(|s| {
            product_ids
                .iter()
                .filter(|pid| {
                    let imgs: Vec<&ImageRec> = s
                        .images
                        .iter()
                        .filter(|i| i.row.tenant_id == tenant_id && &i.row.product_id == *pid)
                        .collect();
                    !imgs.is_empty() && imgs.iter().filter(|i| i.is_main).count() != 1
                })
                .count() as i64
        })
    }
}

#[async_trait::async_trait]
impl LegacyBreederSource for MemoryStore {
    async fn legacy_tables(&self) -> Result<LegacyTablesPresence> {
        self.read(|s| LegacyTablesPresence {
            breeders: s.legacy_breeders.is_some(),
            breeder_events: s.legacy_breeder_events.is_some(),
        })
    }

    async fn check_merge_columns(&self) -> Result<()> {
        Ok(())
    }

    async fn load_products(&self) -> Result<Vec<ExistingProduct>> {
        self.read(|s| s.products.iter().map(|p| p.product.clone()).collect())
    }

    async fn load_legacy_breeders(&self) -> Result<Vec<LegacyBreederRow>> {
        self.read(|s| s.legacy_breeders.clone().unwrap_or_default())
    }

    async fn load_legacy_breeder_events(&self) -> Result<Vec<LegacyBreederEventRow>> {
        self.read(|s| s.legacy_breeder_events.clone().unwrap_or_default())
    }

    async fn count_products_with_legacy_breeder(&self) -> Result<i64> {
        self.read(|s| s.products.iter().filter(|p| p.product.legacy_breeder_id.is_some()).count() as i64)
    }

    async fn count_product_events(&self) -> Result<i64> {
        self.read(|s| s.events.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uncommitted_unit_leaves_store_untouched() {
        let store = MemoryStore::new();
        {
            let mut uow = store.begin().await.unwrap();
            uow.upsert_tenant("t", "T").await.unwrap();
            uow.rollback().await.unwrap();
        }
        assert!(store.snapshot().tenants.is_empty());

        let mut uow = store.begin().await.unwrap();
        let first = uow.upsert_tenant("t", "T").await.unwrap();
        let again = uow.upsert_tenant("t", "T2").await.unwrap();
        uow.commit().await.unwrap();
        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.id, again.id);
        assert_eq!(store.snapshot().tenants[0].name, "T2");
    }
}
