use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    PgPool, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

/// Postgres handle for the target store. Never runs migrations: the engine
/// only moves data into an existing schema.
#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32, use_prepared: bool) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)
            .context("target database URL is not a valid postgres DSN")?;

        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !use_prepared {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("failed to connect to target database")?;
        info!("connected to target db");
        Ok(Self { pool })
    }
}

/// Open a legacy SQLite file without write access.
#[instrument]
pub async fn open_sqlite_read_only(path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .create_if_missing(false);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open legacy sqlite database {path}"))?;
    info!(path, "opened legacy sqlite (read-only)");
    Ok(pool)
}

pub async fn table_exists(pool: &PgPool, table: &str) -> Result<bool> {
    let found: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
        .persistent(false)
        .bind(format!("public.{table}"))
        .fetch_one(pool)
        .await?;
    Ok(found.is_some())
}

pub async fn column_exists(pool: &PgPool, table: &str, column: &str) -> Result<bool> {
    let n: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM information_schema.columns WHERE table_schema='public' AND table_name=$1 AND column_name=$2",
    )
    .persistent(false)
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await?;
    Ok(n > 0)
}

pub async fn sqlite_table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let n: i64 =
        sqlx::query_scalar("SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1")
            .bind(table)
            .fetch_one(pool)
            .await?;
    Ok(n > 0)
}
