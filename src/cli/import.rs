//! `import`: payload file into the multi-tenant target.
use anyhow::Result;
use chrono::Utc;
use clap::Args;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{require_value, TargetArgs, TargetConfig};
use crate::extract::{DEFAULT_TENANT_NAME, DEFAULT_TENANT_SLUG};
use crate::merge::plan_import;
use crate::normalization::{format_run_id, normalize_string};
use crate::payload::ExportPayload;
use crate::report::{readback, ImportReport, ReportTenant, Verification};
use crate::safety;
use crate::store::{PgStore, TargetStore};
use crate::util::env as env_util;
use crate::validate::{collect_validation_issues, preview_import, DryRunPreview, MergeDiagnostics, PreviewInput};
use crate::writer::{run_import, series_codes, ImportContext};

pub const DEFAULT_ADMIN_EMAIL: &str = "admin@turtlealbum.local";
pub const DEFAULT_ADMIN_NAME: &str = "Turtle Album Admin";

#[derive(Args, Debug, Clone, Default)]
pub struct ImportArgs {
    /// Export payload produced by export-api or export-sqlite
    #[arg(long)]
    pub input: Option<PathBuf>,
    /// Target tenant slug (defaults to the payload's suggestion)
    #[arg(long)]
    pub tenant_slug: Option<String>,
    #[arg(long)]
    pub tenant_name: Option<String>,
    /// Owner account email (env MIGRATION_ADMIN_EMAIL)
    #[arg(long, alias = "owner-email")]
    pub admin_email: Option<String>,
    /// Where the report pair goes (defaults to the input's directory)
    #[arg(long)]
    pub report_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub skip_shares: bool,
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub input: PathBuf,
    pub tenant_slug: Option<String>,
    pub tenant_name: Option<String>,
    pub admin_email: String,
    pub report_dir: Option<PathBuf>,
    pub skip_shares: bool,
    pub use_prepared: bool,
    pub target: TargetConfig,
}

impl ImportArgs {
    pub fn resolve(self) -> Result<ImportConfig> {
        let input = require_value(self.input.map(|p| p.display().to_string()), "--input")?;
        let admin_email = self
            .admin_email
            .or_else(|| env_util::env_opt("MIGRATION_ADMIN_EMAIL"))
            .and_then(|e| normalize_string(Some(&e)))
            .map(|e| e.to_lowercase())
            .unwrap_or_else(|| DEFAULT_ADMIN_EMAIL.to_string());
        Ok(ImportConfig {
            input: PathBuf::from(input),
            tenant_slug: self.tenant_slug.and_then(|s| normalize_string(Some(&s))),
            tenant_name: self.tenant_name.and_then(|s| normalize_string(Some(&s))),
            admin_email,
            report_dir: self.report_dir,
            skip_shares: self.skip_shares,
            use_prepared: env_util::env_flag("USE_PREPARED", false),
            target: self.target.resolve()?,
        })
    }
}

impl ImportConfig {
    /// Tenant and owner identity, falling back to what the payload suggests.
    pub fn context(&self, payload: &ExportPayload) -> ImportContext {
        let tenant_slug = self
            .tenant_slug
            .clone()
            .or_else(|| payload.tenant.suggested_slug.clone())
            .unwrap_or_else(|| DEFAULT_TENANT_SLUG.to_string());
        let tenant_name = self
            .tenant_name
            .clone()
            .or_else(|| payload.tenant.suggested_name.clone())
            .unwrap_or_else(|| DEFAULT_TENANT_NAME.to_string());
        let admin_name = payload
            .users
            .first()
            .and_then(|u| normalize_string(Some(&u.username)))
            .unwrap_or_else(|| DEFAULT_ADMIN_NAME.to_string());
        ImportContext {
            tenant_slug,
            tenant_name,
            admin_email: self.admin_email.clone(),
            admin_name,
            skip_shares: self.skip_shares,
        }
    }

    fn report_dir(&self) -> PathBuf {
        if let Some(dir) = &self.report_dir {
            return dir.clone();
        }
        match self.input.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[derive(Debug)]
pub struct WrittenImport {
    pub report: ImportReport,
    pub json_path: PathBuf,
    pub markdown_path: PathBuf,
}

#[derive(Debug)]
pub enum ImportRun {
    DryRun(DryRunPreview),
    Written(Box<WrittenImport>),
}

/// Gate, connect, import.
pub async fn run(cfg: &ImportConfig) -> Result<ImportRun> {
    // reject before opening a connection
    safety::evaluate(&cfg.target)?;
    let store = PgStore::connect(&cfg.target.database_url, cfg.use_prepared).await?;
    execute(cfg, &store).await
}

/// Everything after the connection: plan, preview or write, read back, report.
pub async fn execute(cfg: &ImportConfig, store: &dyn TargetStore) -> Result<ImportRun> {
    let gate = safety::evaluate(&cfg.target)?;
    for note in &gate.notes {
        println!("{note}");
    }

    let payload = ExportPayload::load(&cfg.input)?;
    let codes = series_codes(&payload);
    let known: HashSet<String> = codes.iter().map(|(id, _)| id.clone()).collect();
    let plan = plan_import(&payload, &known);
    let diagnostics = MergeDiagnostics::from_plan(&payload, &plan);
    let ctx = cfg.context(&payload);
    info!(
        tenant = %ctx.tenant_slug,
        products = plan.products.len(),
        conflicts = diagnostics.conflicts.len(),
        unmatched = diagnostics.unmatched_breeder_ids.len(),
        dry_run = gate.is_dry_run(),
        "import planned"
    );

    if gate.is_dry_run() {
        let code_list: Vec<String> = codes.iter().map(|(_, c)| c.clone()).collect();
        let preview = preview_import(
            store,
            PreviewInput {
                payload: &payload,
                plan: &plan,
                series_codes: &code_list,
                tenant_slug: &ctx.tenant_slug,
                admin_email: &ctx.admin_email,
            },
        )
        .await?;
        println!("{}", preview.render());
        return Ok(ImportRun::DryRun(preview));
    }

    let outcome = run_import(store, &payload, &plan, &codes, &ctx).await?;
    let readback_counts = readback(store, &outcome.ids).await?;
    let verification = Verification::compute(&outcome.counters, &outcome.ids, &readback_counts);

    let mut issues = if payload.validation_issues.is_empty() {
        collect_validation_issues(&payload)
    } else {
        payload.validation_issues.clone()
    };
    issues.extend(diagnostics.issues());

    let now = Utc::now();
    let report = ImportReport {
        run_id: format_run_id(now),
        imported_at: now.to_rfc3339(),
        env: cfg.target.env,
        input: cfg.input.display().to_string(),
        tenant: ReportTenant {
            id: outcome.ids.tenant_id.clone(),
            slug: ctx.tenant_slug.clone(),
            name: ctx.tenant_name.clone(),
        },
        source: payload.source.clone(),
        payload_counts: payload.compute_counts(),
        counters: outcome.counters,
        readback_counts,
        verification,
        merge_diagnostics: diagnostics,
        payload_validation_issues: issues,
    };
    let (json_path, markdown_path) = report.write_to(&cfg.report_dir())?;
    print_summary(&report, &json_path, &markdown_path);
    Ok(ImportRun::Written(Box::new(WrittenImport {
        report,
        json_path,
        markdown_path,
    })))
}

fn print_summary(report: &ImportReport, json_path: &Path, markdown_path: &Path) {
    let c = &report.counters;
    println!("import {} into tenant {}", report.run_id, report.tenant.slug);
    println!(
        "  products: {} created, {} updated; breeder products: {} created, {} updated",
        c.products_created, c.products_updated, c.breeder_products_created, c.breeder_products_updated
    );
    println!(
        "  events: {} created, {} existing; images: {} created; featured: {}; shares: {}",
        c.events_created, c.events_skipped_existing, c.images_created, c.featured_created, c.shares_created
    );
    for (name, ok) in report.verification.entries() {
        println!("  {}: {name}", if ok { "PASS" } else { "CHECK" });
    }
    println!("  report: {} / {}", json_path.display(), markdown_path.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::error::MigrateError;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn write_payload(dir: &Path) -> PathBuf {
        let path = dir.join("export.json");
        let doc = json!({
            "version": 2,
            "users": [{"username": "keeper"}],
            "series": [{"legacyId": "s1", "code": "GH", "name": "Golden Head"}],
            "products": [{"legacyId": "p1", "code": "GH-1", "seriesLegacyId": "s1"}],
            "productImages": [{"legacyId": "i1", "legacyProductId": "p1", "url": "https://cdn/x.jpg"}],
            "breeders": [{"legacyId": "b1", "code": "GH-F01", "seriesLegacyId": "s1", "sex": "female"}],
            "breederEvents": [{"legacyId": "e1", "legacyBreederId": "b1", "eventType": "egg", "eventDate": "2024-05-01", "eggCount": 3}],
            "featuredProducts": [{"legacyId": "f1", "legacyProductId": "p1", "isActive": true}]
        });
        std::fs::write(&path, doc.to_string()).unwrap();
        path
    }

    fn config(input: PathBuf, url: &str, confirm: bool) -> ImportConfig {
        let mut target = TargetConfig::for_url(url);
        target.confirm = confirm;
        ImportConfig {
            input,
            tenant_slug: None,
            tenant_name: None,
            admin_email: DEFAULT_ADMIN_EMAIL.into(),
            report_dir: None,
            skip_shares: false,
            use_prepared: false,
            target,
        }
    }

    #[tokio::test]
    async fn dry_run_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_payload(dir.path());
        let store = MemoryStore::new();
        let before = store.snapshot().row_counts();

        let run = execute(&config(input, "postgres://localhost/dev", false), &store).await.unwrap();
        let ImportRun::DryRun(preview) = run else { panic!("expected dry-run") };
        assert!(!preview.tenant_exists);
        assert_eq!(preview.products.planned, 2);
        assert_eq!(preview.products.likely_create, 2);
        assert_eq!(store.snapshot().row_counts(), before);
        let reports = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with("import-report"))
            .count();
        assert_eq!(reports, 0);
    }

    #[tokio::test]
    async fn prod_target_without_second_flag_fails_before_any_query() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_payload(dir.path());
        let store = MemoryStore::new();
        let cfg = config(input, "postgres://u:p@db.prod.internal/x", true);

        let err = execute(&cfg, &store).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<MigrateError>(), Some(MigrateError::Safety(_))));
        assert_eq!(store.touches(), 0);

        let mut staging = config(cfg.input.clone(), "postgres://localhost/app", true);
        staging.target.env = Environment::Prod;
        assert!(execute(&staging, &store).await.is_err());
        assert_eq!(store.touches(), 0);
    }

    #[tokio::test]
    async fn confirmed_import_writes_report_next_to_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_payload(dir.path());
        let store = MemoryStore::new();

        let run = execute(&config(input, "postgres://localhost/dev", true), &store).await.unwrap();
        let ImportRun::Written(written) = run else { panic!("expected a write") };
        assert!(written.report.verification.all_pass(), "{:?}", written.report.verification);
        assert_eq!(written.report.tenant.slug, "turtle-album");
        assert_eq!(written.report.counters.breeder_products_created, 1);
        assert_eq!(written.report.counters.events_created, 1);
        assert!(written.json_path.starts_with(dir.path()));
        assert!(written.markdown_path.exists());

        let state = store.snapshot();
        assert_eq!(state.users[0].name, "keeper");
        assert_eq!(state.products.len(), 2);
    }

    #[test]
    fn owner_email_alias_and_default() {
        let args = ImportArgs {
            input: Some(PathBuf::from("x.json")),
            admin_email: Some(" Owner@Example.COM ".into()),
            target: TargetArgs {
                database_url: Some("postgres://localhost/dev".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let cfg = args.resolve().unwrap();
        assert_eq!(cfg.admin_email, "owner@example.com");
        assert_eq!(cfg.report_dir(), PathBuf::from("."));

        let missing = ImportArgs::default().resolve().unwrap_err();
        assert!(matches!(missing.downcast_ref::<MigrateError>(), Some(MigrateError::Config(_))));
    }
}
