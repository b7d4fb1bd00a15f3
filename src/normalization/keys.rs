//! Deterministic identifiers derived from legacy data.
use sha1::{Digest, Sha1};
use std::collections::HashSet;

use super::text::{normalize_code, normalize_string, sanitize_code_fragment, truncate_chars};

fn sha1_hex(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Storage key for a migrated image; stable for the same legacy id and url.
pub fn image_key(legacy_image_id: &str, url: &str) -> String {
    format!("legacy/{}", sha1_hex(&format!("{legacy_image_id}|{url}")))
}

/// Public share token for a product, stable per tenant slug.
pub fn share_token(tenant_slug: &str, product_id: &str) -> String {
    let digest = sha1_hex(&format!("{tenant_slug}:{product_id}"));
    format!("ta-{}", &digest[..32])
}

pub fn content_type_from_url(url: &str) -> Option<&'static str> {
    let lower = url.to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or_default();
    if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        Some("image/jpeg")
    } else if path.ends_with(".png") {
        Some("image/png")
    } else if path.ends_with(".webp") {
        Some("image/webp")
    } else if path.ends_with(".gif") {
        Some("image/gif")
    } else {
        None
    }
}

const SERIES_CODE_MAX: usize = 120;

/// Input for [`assign_series_codes`]: `(legacy_id, code, name)`.
pub type SeriesCodeInput<'a> = (&'a str, Option<&'a str>, Option<&'a str>);

/// Assign a unique target code to every series, in input order.
///
/// Explicit code wins, then `SER-<NAME>`, then `SER-<hash>`. Collisions get
/// `-2`, `-3`, ... suffixes. Rows without a legacy id are left out.
pub fn assign_series_codes(series: &[SeriesCodeInput<'_>]) -> Vec<(String, String)> {
    let mut used: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(series.len());
    for (index, (legacy_id, code, name)) in series.iter().enumerate() {
        let Some(legacy_id) = normalize_string(Some(*legacy_id)) else {
            continue;
        };
        let by_name = normalize_string(*name)
            .map(|n| sanitize_code_fragment(&n))
            .filter(|s| !s.is_empty())
            .map(|s| format!("SER-{s}"));
        let candidate = normalize_code(*code).or(by_name).unwrap_or_else(|| {
            let digest = sha1_hex(&format!("{legacy_id}:{index}"));
            format!("SER-{}", digest[..10].to_uppercase())
        });
        let candidate = truncate_chars(&candidate, SERIES_CODE_MAX);

        let mut chosen = candidate.clone();
        let mut suffix = 2;
        while used.contains(&chosen) {
            chosen = format!("{candidate}-{suffix}");
            suffix += 1;
        }
        used.insert(chosen.clone());
        out.push((legacy_id, chosen));
    }
    out
}
