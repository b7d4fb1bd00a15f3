//! Legacy HTTP API source.
//!
//! Calls are strictly sequential with one timeout per request and no
//! retries; any failure aborts the export with the endpoint named.
use anyhow::{Context, Result};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::records::{
    animal_from_value, event_from_value, featured_from_value, list_of, series_from_value,
    user_from_value,
};
use super::{dedupe_users, finish_payload};
use crate::error::SourceError;
use crate::normalization::value::{bool_field, int_field, str_field};
use crate::payload::ExportPayload;

pub const PRODUCTS_PAGE_LIMIT: usize = 500;
pub const BREEDERS_LIMIT: usize = 1000;
pub const EVENTS_PAGE_LIMIT: usize = 100;
/// Hard stop for cursor pagination per breeder.
pub const EVENTS_MAX_PAGES: usize = 500;
pub const MIN_TIMEOUT_MS: u64 = 1000;
const USER_AGENT: &str = "eggturtle-migrate/0.1 (legacy export)";

pub struct LegacyApiClient {
    http: Client,
    base_url: String,
    timeout_ms: u64,
    token: Option<String>,
}

/// Unwrap the `{success, message, data}` envelope the legacy API uses on
/// most routes.
pub fn unwrap_envelope(endpoint: &str, body: Value) -> Result<Value, SourceError> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let message = str_field(&body, &["message", "error"]).unwrap_or_else(|| "request failed".into());
        return Err(SourceError::Rejected {
            endpoint: endpoint.to_string(),
            message,
        });
    }
    match body {
        Value::Object(mut map) if map.contains_key("data") => Ok(map.remove("data").unwrap_or(Value::Null)),
        other => Ok(other),
    }
}

impl LegacyApiClient {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self> {
        let timeout_ms = timeout_ms.max(MIN_TIMEOUT_MS);
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            timeout_ms,
            token: None,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, SourceError> {
        let endpoint = format!("{} {path}", method.as_str());
        let transport = |source: reqwest::Error| {
            if source.is_timeout() {
                SourceError::Timeout {
                    endpoint: endpoint.clone(),
                    timeout_ms: self.timeout_ms,
                }
            } else {
                SourceError::Transport {
                    endpoint: endpoint.clone(),
                    source,
                }
            }
        };

        let mut req = self
            .http
            .request(method.clone(), format!("{}{path}", self.base_url))
            .header("accept", "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport)?;
        debug!(%endpoint, status = status.as_u16(), bytes = text.len(), "legacy api response");

        if !status.is_success() {
            return Err(SourceError::Http {
                endpoint,
                status: status.as_u16(),
                body: text.chars().take(2000).collect(),
            });
        }
        let parsed: Value = if text.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&text).map_err(|e| SourceError::Malformed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?
        };
        unwrap_envelope(&endpoint, parsed)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, SourceError> {
        self.call(Method::GET, path, query, None).await
    }

    /// Log in and keep the bearer token. Returns the user record, if any.
    #[instrument(skip(self, password))]
    pub async fn login(&mut self, username: &str, password: &str) -> Result<Option<Value>, SourceError> {
        let body = json!({ "username": username, "password": password });
        let data = self.call(Method::POST, "/api/auth/login", &[], Some(&body)).await?;
        let token = str_field(&data, &["token", "accessToken", "access_token"]).ok_or(SourceError::MissingToken)?;
        self.token = Some(token);
        info!("logged in to legacy api");
        Ok(data.get("user").cloned())
    }

    pub async fn verify(&self) -> Result<Option<Value>, SourceError> {
        let data = self.get("/api/auth/verify", &[]).await?;
        Ok(data.get("user").cloned().or_else(|| {
            str_field(&data, &["username"]).map(|_| data.clone())
        }))
    }

    /// All products across pages, deduplicated by id.
    pub async fn fetch_products(&self) -> Result<Vec<Value>, SourceError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut page = 1usize;
        loop {
            let data = self
                .get(
                    "/api/products",
                    &[("page", page.to_string()), ("limit", PRODUCTS_PAGE_LIMIT.to_string())],
                )
                .await?;
            let items = list_of(&data, &["products", "items"]);
            for item in items {
                match str_field(item, &["id"]) {
                    Some(id) if !seen.insert(id.clone()) => {
                        debug!(%id, "duplicate product across pages");
                    }
                    _ => out.push(item.clone()),
                }
            }
            let total_pages = int_field(&data, &["totalPages", "total_pages"], 1).max(1) as usize;
            debug!(page, total_pages, fetched = items.len(), "products page");
            if items.is_empty() || page >= total_pages {
                break;
            }
            page += 1;
        }
        Ok(out)
    }

    /// Admin series listing, falling back to the public one when the admin
    /// route refuses the token. The flag reports whether the fallback ran.
    pub async fn fetch_series(&self) -> Result<(Vec<Value>, bool), SourceError> {
        match self
            .get("/api/admin/series", &[("include_inactive", "true".to_string())])
            .await
        {
            Ok(data) => Ok((list_of(&data, &["series", "items"]).to_vec(), false)),
            Err(err) if err.is_unauthorized() => {
                warn!(status = ?err.status(), "admin series endpoint refused; using public series");
                let data = self.get("/api/series", &[]).await?;
                Ok((list_of(&data, &["series", "items"]).to_vec(), true))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn fetch_breeders(&self) -> Result<Vec<Value>, SourceError> {
        let data = self
            .get("/api/breeders", &[("limit", BREEDERS_LIMIT.to_string())])
            .await?;
        Ok(list_of(&data, &["breeders", "items", "products"]).to_vec())
    }

    /// Cursor-paged events for one breeder. The flag is true when the page
    /// ceiling stopped the loop.
    pub async fn fetch_breeder_events(&self, breeder_id: &str) -> Result<(Vec<Value>, bool), SourceError> {
        let path = format!("/api/breeders/{breeder_id}/events");
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..EVENTS_MAX_PAGES {
            let mut query = vec![("limit", EVENTS_PAGE_LIMIT.to_string())];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }
            let data = self.get(&path, &query).await?;
            out.extend(list_of(&data, &["items", "events"]).iter().cloned());
            let has_more = bool_field(&data, &["hasMore", "has_more"], false);
            cursor = str_field(&data, &["nextCursor", "next_cursor"]);
            if !has_more || cursor.is_none() {
                return Ok((out, false));
            }
        }
        warn!(breeder_id, pages = EVENTS_MAX_PAGES, "event pagination hit the page ceiling");
        Ok((out, true))
    }

    pub async fn fetch_featured(&self) -> Result<Vec<Value>, SourceError> {
        let data = self.get("/api/featured-products", &[]).await?;
        Ok(list_of(&data, &["items", "featuredProducts", "featured_products", "products"]).to_vec())
    }
}

/// Credentials and limits for one API export.
#[derive(Clone)]
pub struct ApiSource {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout_ms: u64,
}

impl std::fmt::Debug for ApiSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSource")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Pull everything from the legacy API into a finished payload.
pub async fn export_from_api(source: &ApiSource) -> Result<ExportPayload> {
    let mut client = LegacyApiClient::new(&source.base_url, source.timeout_ms)?;
    let mut issues = Vec::new();
    let mut users = Vec::new();

    if let Some(user) = client.login(&source.username, &source.password).await? {
        users.extend(user_from_value(&user));
    }
    if let Some(user) = client.verify().await? {
        users.extend(user_from_value(&user));
    }

    let mut payload = ExportPayload::empty(json!({}));

    let (series_raw, fell_back) = client.fetch_series().await?;
    if fell_back {
        issues.push("admin series endpoint unauthorized; exported public series only (inactive series may be missing)".to_string());
    }
    payload.series = series_raw.iter().filter_map(series_from_value).collect();

    let products_raw = client.fetch_products().await?;
    for (i, raw) in products_raw.iter().enumerate() {
        match animal_from_value(raw) {
            Some((product, images)) => {
                payload.products.push(product);
                payload.product_images.extend(images);
            }
            None => issues.push(format!("product at position {} has no id; skipped", i + 1)),
        }
    }

    let breeders_raw = client.fetch_breeders().await?;
    for (i, raw) in breeders_raw.iter().enumerate() {
        let Some((breeder, _)) = animal_from_value(raw) else {
            issues.push(format!("breeder at position {} has no id; skipped", i + 1));
            continue;
        };
        let (events, capped) = client.fetch_breeder_events(&breeder.legacy_id).await?;
        if capped {
            issues.push(format!(
                "breeder {} events truncated at {EVENTS_MAX_PAGES} pages",
                breeder.legacy_id
            ));
        }
        payload.breeder_events.extend(
            events
                .iter()
                .enumerate()
                .map(|(j, ev)| event_from_value(ev, &breeder.legacy_id, j)),
        );
        payload.breeders.push(breeder);
    }

    payload.featured_products = client
        .fetch_featured()
        .await?
        .iter()
        .enumerate()
        .filter_map(|(i, v)| featured_from_value(v, i))
        .collect();

    payload.users = dedupe_users(users);
    payload.source = json!({
        "type": "legacy_api",
        "mode": "http",
        "apiBaseUrl": client.base_url(),
        "endpoints": {
            "login": "/api/auth/login",
            "verify": "/api/auth/verify",
            "products": "/api/products",
            "series": if fell_back { "/api/series" } else { "/api/admin/series" },
            "breeders": "/api/breeders",
            "breederEvents": "/api/breeders/{id}/events",
            "featuredProducts": "/api/featured-products"
        }
    });
    finish_payload(&mut payload, issues);
    info!(
        products = payload.products.len(),
        breeders = payload.breeders.len(),
        events = payload.breeder_events.len(),
        issues = payload.validation_issues.len(),
        "legacy api export assembled"
    );
    Ok(payload)
}
