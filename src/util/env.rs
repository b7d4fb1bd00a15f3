//! Environment helpers: dotenv loading and ergonomic getters.
//! Only the command layer calls these; library components receive config values.
use std::str::FromStr;
use std::sync::Once;
use tracing::info;

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        let _ = dotenv::dotenv();
    });
}

/// Common bootstrap for CLI binaries: load .env, install tracing, log the
/// redacted connection snapshot.
pub fn bootstrap_cli(bin_name: &str) {
    init_env();
    let _ = crate::tracing::init_tracing("info");
    let snapshot = snapshot(&[
        "DATABASE_URL",
        "DB_URL",
        "DB_HOST",
        "LEGACY_API_BASE_URL",
        "LEGACY_API_USERNAME",
        "LEGACY_API_PASSWORD",
        "MIGRATION_ADMIN_EMAIL",
    ]);
    info!(target = "preflight", bin = bin_name, snapshot = ?snapshot, "configuration snapshot");
}

/// Get optional env var (None if unset or blank).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_opt(key)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        None => default,
    }
}

/// Target database URL: DATABASE_URL, DB_URL, then a DSN composed from DB_* parts.
pub fn db_url() -> anyhow::Result<String> {
    for k in ["DATABASE_URL", "DB_URL"] {
        if let Some(v) = env_opt(k) {
            return Ok(v.trim().to_string());
        }
    }
    if let Some(dsn) = build_dsn_from_parts() {
        info!(target = "env", "using DSN composed from DB_* variables");
        return Ok(dsn);
    }
    Err(anyhow::anyhow!("no database URL env vars set"))
}

fn build_dsn_from_parts() -> Option<String> {
    let host = env_opt("DB_HOST")?;
    let user = env_opt("DB_USERNAME")?;
    let password = env_opt("DB_PASSWORD");
    let database = env_opt("DB_DATABASE").unwrap_or_else(|| "postgres".into());
    let port: u16 = env_parse("DB_PORT", 5432);
    let ssl_mode = env_opt("DB_SSLMODE").unwrap_or_else(|| "prefer".into());
    compose_dsn(&host, &user, password.as_deref(), &database, port, &ssl_mode)
}

/// Build a postgres DSN via `url::Url` so reserved characters in the
/// credentials are percent-encoded.
pub fn compose_dsn(
    host: &str,
    user: &str,
    password: Option<&str>,
    database: &str,
    port: u16,
    ssl_mode: &str,
) -> Option<String> {
    let mut out = url::Url::parse("postgresql://localhost").ok()?;
    out.set_username(user).ok()?;
    if let Some(pass) = password {
        out.set_password(Some(pass)).ok()?;
    }
    let host_trimmed = host.trim().trim_matches(|c| c == '[' || c == ']');
    if host_trimmed.contains(':') {
        out.set_host(Some(&format!("[{host_trimmed}]"))).ok()?;
    } else {
        out.set_host(Some(host_trimmed)).ok()?;
    }
    out.set_port(Some(port)).ok()?;
    out.set_path(&format!("/{database}"));
    if ssl_mode != "disable" {
        out.query_pairs_mut().append_pair("sslmode", ssl_mode);
    }
    Some(out.to_string())
}

/// Mask user and password in a connection string.
pub fn redact_dsn(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(mut u) = url::Url::parse(trimmed) {
        if u.has_host() {
            if !u.username().is_empty() {
                let _ = u.set_username("***");
            }
            if u.password().is_some() {
                let _ = u.set_password(Some("***"));
            }
            return u.to_string();
        }
    }
    match (trimmed.find("//"), trimmed.rfind('@')) {
        (Some(proto), Some(at)) if at > proto => {
            format!("{}***@{}", &trimmed[..proto + 2], &trimmed[at + 1..])
        }
        _ => trimmed.to_string(),
    }
}

fn redact_value(key: &str, val: &str) -> String {
    let k = key.to_ascii_uppercase();
    if k.contains("PASSWORD") || k.contains("SECRET") || k.contains("TOKEN") {
        return "***".to_string();
    }
    if k.contains("URL") || k.contains("DSN") {
        return redact_dsn(val);
    }
    val.trim().to_string()
}

fn snapshot(keys: &[&str]) -> Vec<(String, String)> {
    keys.iter()
        .filter_map(|&k| env_opt(k).map(|v| (k.to_string(), redact_value(k, &v))))
        .collect()
}
