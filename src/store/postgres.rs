use anyhow::{bail, Context, Result};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    EventRow, ExistingProduct, ImageRow, LegacyBreederEventRow, LegacyBreederRow,
    LegacyBreederSource, LegacyTablesPresence, MemberRole, ProductRow, RowScope, SeriesRow,
    ShareRow, TargetStore, TargetTable, UnitOfWork, Upserted,
};
use crate::error::config_err;
use crate::util::db::{column_exists, table_exists, Db};

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Postgres-backed target store.
#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, use_prepared: bool) -> Result<Self> {
        Ok(Self::new(Db::connect(database_url, 2, use_prepared).await?))
    }
}

/// One run's transaction.
pub struct PgUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl UnitOfWork for PgUnit {
    async fn upsert_user(&mut self, email: &str, name: &str) -> Result<Upserted> {
        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE email = $1")
            .persistent(false)
            .bind(email)
            .fetch_optional(&mut *self.tx)
            .await?;
        if let Some(id) = existing {
            sqlx::query("UPDATE users SET name = COALESCE(name, $2), updated_at = now() WHERE id = $1")
                .persistent(false)
                .bind(&id)
                .bind(name)
                .execute(&mut *self.tx)
                .await?;
            return Ok(Upserted { id, created: false });
        }
        let id = new_id();
        sqlx::query(
            "INSERT INTO users (id, email, name, created_at, updated_at) VALUES ($1, $2, $3, now(), now())",
        )
        .persistent(false)
        .bind(&id)
        .bind(email)
        .bind(name)
        .execute(&mut *self.tx)
        .await
        .context("insert users")?;
        Ok(Upserted { id, created: true })
    }

    async fn upsert_tenant(&mut self, slug: &str, name: &str) -> Result<Upserted> {
        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM tenants WHERE slug = $1")
            .persistent(false)
            .bind(slug)
            .fetch_optional(&mut *self.tx)
            .await?;
        if let Some(id) = existing {
            sqlx::query("UPDATE tenants SET name = $2, updated_at = now() WHERE id = $1")
                .persistent(false)
                .bind(&id)
                .bind(name)
                .execute(&mut *self.tx)
                .await?;
            return Ok(Upserted { id, created: false });
        }
        let id = new_id();
        sqlx::query(
            "INSERT INTO tenants (id, slug, name, created_at, updated_at) VALUES ($1, $2, $3, now(), now())",
        )
        .persistent(false)
        .bind(&id)
        .bind(slug)
        .bind(name)
        .execute(&mut *self.tx)
        .await
        .context("insert tenants")?;
        Ok(Upserted { id, created: true })
    }

    async fn upsert_member(&mut self, tenant_id: &str, user_id: &str, role: MemberRole) -> Result<Upserted> {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM tenant_members WHERE tenant_id = $1 AND user_id = $2",
        )
        .persistent(false)
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        if let Some(id) = existing {
            sqlx::query("UPDATE tenant_members SET role = $2, updated_at = now() WHERE id = $1")
                .persistent(false)
                .bind(&id)
                .bind(role.as_str())
                .execute(&mut *self.tx)
                .await?;
            return Ok(Upserted { id, created: false });
        }
        let id = new_id();
        sqlx::query(
            "INSERT INTO tenant_members (id, tenant_id, user_id, role, created_at, updated_at) VALUES ($1, $2, $3, $4, now(), now())",
        )
        .persistent(false)
        .bind(&id)
        .bind(tenant_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&mut *self.tx)
        .await
        .context("insert tenant_members")?;
        Ok(Upserted { id, created: true })
    }

    async fn upsert_series(&mut self, row: &SeriesRow) -> Result<Upserted> {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM series WHERE tenant_id = $1 AND code = $2")
                .persistent(false)
                .bind(&row.tenant_id)
                .bind(&row.code)
                .fetch_optional(&mut *self.tx)
                .await?;
        if let Some(id) = existing {
            sqlx::query(
                "UPDATE series SET name = $2, description = COALESCE($3, description), sort_order = $4, is_active = $5, updated_at = now() WHERE id = $1",
            )
            .persistent(false)
            .bind(&id)
            .bind(&row.name)
            .bind(&row.description)
            .bind(row.sort_order)
            .bind(row.is_active)
            .execute(&mut *self.tx)
            .await?;
            return Ok(Upserted { id, created: false });
        }
        let id = new_id();
        sqlx::query(
            "INSERT INTO series (id, tenant_id, code, name, description, sort_order, is_active, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, now(), now())",
        )
        .persistent(false)
        .bind(&id)
        .bind(&row.tenant_id)
        .bind(&row.code)
        .bind(&row.name)
        .bind(&row.description)
        .bind(row.sort_order)
        .bind(row.is_active)
        .execute(&mut *self.tx)
        .await
        .context("insert series")?;
        Ok(Upserted { id, created: true })
    }

    async fn upsert_product(&mut self, row: &ProductRow) -> Result<Upserted> {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM products WHERE tenant_id = $1 AND code = $2")
                .persistent(false)
                .bind(&row.tenant_id)
                .bind(&row.code)
                .fetch_optional(&mut *self.tx)
                .await?;
        if let Some(id) = existing {
            sqlx::query(
                "UPDATE products SET
                    series_id = COALESCE($2, series_id),
                    name = COALESCE($3, name),
                    description = COALESCE($4, description),
                    sex = COALESCE($5, sex),
                    sire_code = COALESCE($6, sire_code),
                    dam_code = COALESCE($7, dam_code),
                    mate_code = COALESCE($8, mate_code),
                    in_stock = COALESCE($9, in_stock),
                    exclude_from_breeding = COALESCE($10, exclude_from_breeding),
                    legacy_breeder_id = COALESCE($11, legacy_breeder_id),
                    updated_at = COALESCE($12, now())
                 WHERE id = $1",
            )
            .persistent(false)
            .bind(&id)
            .bind(&row.series_id)
            .bind(&row.name)
            .bind(&row.description)
            .bind(&row.sex)
            .bind(&row.sire_code)
            .bind(&row.dam_code)
            .bind(&row.mate_code)
            .bind(row.in_stock)
            .bind(row.exclude_from_breeding)
            .bind(&row.legacy_breeder_id)
            .bind(row.updated_at)
            .execute(&mut *self.tx)
            .await
            .context("update products")?;
            return Ok(Upserted { id, created: false });
        }
        let id = row.id.clone().unwrap_or_else(new_id);
        sqlx::query(
            "INSERT INTO products (id, tenant_id, code, series_id, name, description, sex, sire_code, dam_code, mate_code,
                                   in_stock, exclude_from_breeding, legacy_breeder_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                     COALESCE($11, true), COALESCE($12, false), $13, COALESCE($14, now()), COALESCE($15, now()))",
        )
        .persistent(false)
        .bind(&id)
        .bind(&row.tenant_id)
        .bind(&row.code)
        .bind(&row.series_id)
        .bind(&row.name)
        .bind(&row.description)
        .bind(&row.sex)
        .bind(&row.sire_code)
        .bind(&row.dam_code)
        .bind(&row.mate_code)
        .bind(row.in_stock)
        .bind(row.exclude_from_breeding)
        .bind(&row.legacy_breeder_id)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut *self.tx)
        .await
        .context("insert products")?;
        Ok(Upserted { id, created: true })
    }

    async fn find_event(&mut self, row: &EventRow) -> Result<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM product_events
             WHERE tenant_id = $1 AND product_id = $2 AND event_type = $3 AND event_date = $4
               AND note IS NOT DISTINCT FROM $5
             LIMIT 1",
        )
        .persistent(false)
        .bind(&row.tenant_id)
        .bind(&row.product_id)
        .bind(&row.event_type)
        .bind(row.event_date)
        .bind(&row.note)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn insert_event(&mut self, row: &EventRow) -> Result<String> {
        let id = row.id.clone().unwrap_or_else(new_id);
        sqlx::query(
            "INSERT INTO product_events (id, tenant_id, product_id, event_type, event_date, note, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, now(), now())
             ON CONFLICT (id) DO NOTHING",
        )
        .persistent(false)
        .bind(&id)
        .bind(&row.tenant_id)
        .bind(&row.product_id)
        .bind(&row.event_type)
        .bind(row.event_date)
        .bind(&row.note)
        .execute(&mut *self.tx)
        .await
        .context("insert product_events")?;
        Ok(id)
    }

    async fn upsert_image(&mut self, row: &ImageRow) -> Result<Upserted> {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM product_images WHERE tenant_id = $1 AND product_id = $2 AND key = $3",
        )
        .persistent(false)
        .bind(&row.tenant_id)
        .bind(&row.product_id)
        .bind(&row.key)
        .fetch_optional(&mut *self.tx)
        .await?;
        if let Some(id) = existing {
            sqlx::query(
                "UPDATE product_images SET url = $2, content_type = COALESCE($3, content_type), sort_order = $4, updated_at = now() WHERE id = $1",
            )
            .persistent(false)
            .bind(&id)
            .bind(&row.url)
            .bind(&row.content_type)
            .bind(row.sort_order)
            .execute(&mut *self.tx)
            .await?;
            return Ok(Upserted { id, created: false });
        }
        let id = new_id();
        sqlx::query(
            "INSERT INTO product_images (id, tenant_id, product_id, key, url, content_type, sort_order, is_main, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, false, now(), now())",
        )
        .persistent(false)
        .bind(&id)
        .bind(&row.tenant_id)
        .bind(&row.product_id)
        .bind(&row.key)
        .bind(&row.url)
        .bind(&row.content_type)
        .bind(row.sort_order)
        .execute(&mut *self.tx)
        .await
        .context("insert product_images")?;
        Ok(Upserted { id, created: true })
    }

    async fn clear_main_images(&mut self, tenant_id: &str, product_id: &str) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE product_images SET is_main = false WHERE tenant_id = $1 AND product_id = $2 AND is_main",
        )
        .persistent(false)
        .bind(tenant_id)
        .bind(product_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(res.rows_affected())
    }

    async fn mark_main_image(&mut self, image_id: &str) -> Result<()> {
        sqlx::query("UPDATE product_images SET is_main = true WHERE id = $1")
            .persistent(false)
            .bind(image_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn upsert_featured(&mut self, tenant_id: &str, product_id: &str, sort_order: i64) -> Result<Upserted> {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM featured_products WHERE tenant_id = $1 AND product_id = $2",
        )
        .persistent(false)
        .bind(tenant_id)
        .bind(product_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        if let Some(id) = existing {
            sqlx::query("UPDATE featured_products SET sort_order = $2, updated_at = now() WHERE id = $1")
                .persistent(false)
                .bind(&id)
                .bind(sort_order)
                .execute(&mut *self.tx)
                .await?;
            return Ok(Upserted { id, created: false });
        }
        let id = new_id();
        sqlx::query(
            "INSERT INTO featured_products (id, tenant_id, product_id, sort_order, created_at, updated_at)
             VALUES ($1, $2, $3, $4, now(), now())",
        )
        .persistent(false)
        .bind(&id)
        .bind(tenant_id)
        .bind(product_id)
        .bind(sort_order)
        .execute(&mut *self.tx)
        .await
        .context("insert featured_products")?;
        Ok(Upserted { id, created: true })
    }

    async fn upsert_share(&mut self, row: &ShareRow) -> Result<Upserted> {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM public_shares WHERE tenant_id = $1 AND product_id = $2",
        )
        .persistent(false)
        .bind(&row.tenant_id)
        .bind(&row.product_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        if let Some(id) = existing {
            sqlx::query("UPDATE public_shares SET created_by_user_id = $2, updated_at = now() WHERE id = $1")
                .persistent(false)
                .bind(&id)
                .bind(&row.created_by_user_id)
                .execute(&mut *self.tx)
                .await?;
            return Ok(Upserted { id, created: false });
        }
        let id = new_id();
        sqlx::query(
            "INSERT INTO public_shares (id, tenant_id, product_id, share_token, created_by_user_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, now(), now())",
        )
        .persistent(false)
        .bind(&id)
        .bind(&row.tenant_id)
        .bind(&row.product_id)
        .bind(&row.share_token)
        .bind(&row.created_by_user_id)
        .execute(&mut *self.tx)
        .await
        .context("insert public_shares")?;
        Ok(Upserted { id, created: true })
    }

    async fn drop_legacy_breeder_tables(&mut self) -> Result<()> {
        for table in ["breeder_events", "breeders"] {
            let sql = format!("DROP TABLE IF EXISTS {table}");
            sqlx::query(&sql)
                .persistent(false)
                .execute(&mut *self.tx)
                .await
                .with_context(|| format!("drop {table}"))?;
        }
        info!("dropped legacy breeder tables");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let unit = *self;
        unit.tx.commit().await.context("commit failed")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let unit = *self;
        unit.tx.rollback().await.context("rollback failed")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TargetStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>> {
        let tx = self.db.pool.begin().await.context("begin transaction")?;
        debug!("transaction opened");
        Ok(Box::new(PgUnit { tx }))
    }

    async fn find_tenant_id(&self, slug: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar("SELECT id FROM tenants WHERE slug = $1")
            .persistent(false)
            .bind(slug)
            .fetch_optional(&self.db.pool)
            .await?)
    }

    async fn find_user_id(&self, email: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar("SELECT id FROM users WHERE email = $1")
            .persistent(false)
            .bind(email)
            .fetch_optional(&self.db.pool)
            .await?)
    }

    async fn count_existing_codes(&self, table: TargetTable, tenant_id: &str, codes: &[String]) -> Result<i64> {
        if table.has_product_id() {
            bail!("{} has no code column", table.table_name());
        }
        let sql = format!(
            "SELECT count(*) FROM {} WHERE tenant_id = $1 AND code = ANY($2)",
            table.table_name()
        );
        Ok(sqlx::query_scalar(&sql)
            .persistent(false)
            .bind(tenant_id)
            .bind(codes)
            .fetch_one(&self.db.pool)
            .await?)
    }

    async fn count_rows(&self, table: TargetTable, scope: RowScope<'_>) -> Result<i64> {
        let name = table.table_name();
        let n: i64 = match scope {
            RowScope::Tenant(tenant_id) => {
                sqlx::query_scalar(&format!("SELECT count(*) FROM {name} WHERE tenant_id = $1"))
                    .persistent(false)
                    .bind(tenant_id)
                    .fetch_one(&self.db.pool)
                    .await?
            }
            RowScope::Ids(tenant_id, ids) => {
                sqlx::query_scalar(&format!(
                    "SELECT count(*) FROM {name} WHERE tenant_id = $1 AND id = ANY($2)"
                ))
                .persistent(false)
                .bind(tenant_id)
                .bind(ids)
                .fetch_one(&self.db.pool)
                .await?
            }
            RowScope::ProductIds(tenant_id, product_ids) => {
                if !table.has_product_id() {
                    bail!("{name} has no product_id column");
                }
                sqlx::query_scalar(&format!(
                    "SELECT count(*) FROM {name} WHERE tenant_id = $1 AND product_id = ANY($2)"
                ))
                .persistent(false)
                .bind(tenant_id)
                .bind(product_ids)
                .fetch_one(&self.db.pool)
                .await?
            }
        };
        Ok(n)
    }

    async fn count_main_image_violations(&self, tenant_id: &str, product_ids: &[String]) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT count(*) FROM (
                SELECT product_id FROM product_images
                WHERE tenant_id = $1 AND product_id = ANY($2)
                GROUP BY product_id
                HAVING count(*) FILTER (WHERE is_main) <> 1
             ) v",
        )
        .persistent(false)
        .bind(tenant_id)
        .bind(product_ids)
        .fetch_one(&self.db.pool)
        .await?)
    }
}

#[async_trait::async_trait]
impl LegacyBreederSource for PgStore {
    async fn legacy_tables(&self) -> Result<LegacyTablesPresence> {
        Ok(LegacyTablesPresence {
            breeders: table_exists(&self.db.pool, "breeders").await?,
            breeder_events: table_exists(&self.db.pool, "breeder_events").await?,
        })
    }

    async fn check_merge_columns(&self) -> Result<()> {
        if !column_exists(&self.db.pool, "products", "legacy_breeder_id").await? {
            return Err(config_err(
                "products.legacy_breeder_id is missing; apply the schema migration before merging",
            ));
        }
        if !table_exists(&self.db.pool, "product_events").await? {
            return Err(config_err(
                "product_events table is missing; apply the schema migration before merging",
            ));
        }
        Ok(())
    }

    async fn load_products(&self) -> Result<Vec<ExistingProduct>> {
        Ok(sqlx::query_as::<_, ExistingProduct>(
            "SELECT id, tenant_id, code, name, description, series_id, sex, sire_code, dam_code, mate_code,
                    in_stock, legacy_breeder_id, created_at, updated_at
             FROM products",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await
        .context("load products")?)
    }

    async fn load_legacy_breeders(&self) -> Result<Vec<LegacyBreederRow>> {
        Ok(sqlx::query_as::<_, LegacyBreederRow>(
            "SELECT id, tenant_id, series_id, code, name, description, sex, sire_code, dam_code, mate_code,
                    is_active, created_at, updated_at
             FROM breeders",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await
        .context("load breeders")?)
    }

    async fn load_legacy_breeder_events(&self) -> Result<Vec<LegacyBreederEventRow>> {
        Ok(sqlx::query_as::<_, LegacyBreederEventRow>(
            "SELECT id, tenant_id, breeder_id, event_type, event_date, note
             FROM breeder_events
             ORDER BY event_date NULLS LAST, id",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await
        .context("load breeder_events")?)
    }

    async fn count_products_with_legacy_breeder(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT count(*) FROM products WHERE legacy_breeder_id IS NOT NULL")
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?)
    }

    async fn count_product_events(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT count(*) FROM product_events")
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?)
    }
}
