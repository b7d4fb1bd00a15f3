//! Source-agnostic intermediate schema written by the exporters and read by
//! the importer. Field names are camelCase on disk.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::error::MigrateError;

pub const PAYLOAD_VERSION: u32 = 2;

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PayloadTenant {
    #[serde(default)]
    pub legacy_mode: Option<String>,
    #[serde(default)]
    pub suggested_slug: Option<String>,
    #[serde(default)]
    pub suggested_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyUser {
    #[serde(default)]
    pub legacy_id: Option<String>,
    pub username: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacySeries {
    pub legacy_id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyProductImage {
    pub legacy_id: String,
    #[serde(default)]
    pub legacy_product_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// A legacy animal row. Products and breeders share this shape; the two
/// legacy tables may each hold a row for the same animal.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyProduct {
    pub legacy_id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub series_legacy_id: Option<String>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub sire_code: Option<String>,
    #[serde(default)]
    pub dam_code: Option<String>,
    #[serde(default)]
    pub mate_code: Option<String>,
    #[serde(default)]
    pub exclude_from_breeding: Option<bool>,
    #[serde(default)]
    pub in_stock: Option<bool>,
    #[serde(default)]
    pub is_featured: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    /// Images embedded on the product instead of the top-level list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<LegacyProductImage>,
}

pub type LegacyBreeder = LegacyProduct;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyBreederEvent {
    pub legacy_id: String,
    #[serde(default)]
    pub legacy_breeder_id: String,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub event_date: Option<String>,
    #[serde(default)]
    pub male_code: Option<String>,
    #[serde(default)]
    pub egg_count: Option<i64>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub old_mate_code: Option<String>,
    #[serde(default)]
    pub new_mate_code: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyFeaturedProduct {
    pub legacy_id: String,
    pub legacy_product_id: String,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyShareSeed {
    pub legacy_product_id: String,
    #[serde(default)]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportPayload {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub exported_at: Option<String>,
    #[serde(default)]
    pub source: Value,
    #[serde(default)]
    pub tenant: PayloadTenant,
    #[serde(default)]
    pub users: Vec<LegacyUser>,
    pub series: Vec<LegacySeries>,
    pub products: Vec<LegacyProduct>,
    pub product_images: Vec<LegacyProductImage>,
    pub breeders: Vec<LegacyBreeder>,
    pub breeder_events: Vec<LegacyBreederEvent>,
    pub featured_products: Vec<LegacyFeaturedProduct>,
    #[serde(default)]
    pub share_seeds: Vec<LegacyShareSeed>,
    #[serde(default)]
    pub counts: BTreeMap<String, usize>,
    #[serde(default)]
    pub validation_issues: Vec<String>,
}

const REQUIRED_ARRAYS: [&str; 6] = [
    "series",
    "products",
    "productImages",
    "breeders",
    "breederEvents",
    "featuredProducts",
];

impl ExportPayload {
    pub fn empty(source: Value) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            exported_at: None,
            source,
            tenant: PayloadTenant::default(),
            users: Vec::new(),
            series: Vec::new(),
            products: Vec::new(),
            product_images: Vec::new(),
            breeders: Vec::new(),
            breeder_events: Vec::new(),
            featured_products: Vec::new(),
            share_seeds: Vec::new(),
            counts: BTreeMap::new(),
            validation_issues: Vec::new(),
        }
    }

    /// Parse a payload document, checking the required arrays first so the
    /// error names the missing key rather than a serde position.
    pub fn from_json_str(raw: &str, origin: &str) -> Result<Self> {
        let payload_err = |reason: String| MigrateError::Payload {
            path: origin.to_string(),
            reason,
        };
        let doc: Value = serde_json::from_str(raw).map_err(|e| payload_err(e.to_string()))?;
        if !doc.is_object() {
            return Err(payload_err("top-level value must be an object".into()).into());
        }
        for key in REQUIRED_ARRAYS {
            if !doc.get(key).is_some_and(Value::is_array) {
                return Err(payload_err(format!("`{key}` must be an array")).into());
            }
        }
        let mut payload: ExportPayload =
            serde_json::from_value(doc).map_err(|e| payload_err(e.to_string()))?;
        payload.flatten_embedded_images();
        Ok(payload)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read export payload {}", path.display()))?;
        let payload = Self::from_json_str(&raw, &path.display().to_string())?;
        info!(
            path = %path.display(),
            version = payload.version,
            products = payload.products.len(),
            breeders = payload.breeders.len(),
            "loaded export payload"
        );
        Ok(payload)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(path, body + "\n")
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Move images nested under `products[].images` into `productImages`,
    /// skipping ids that are already listed there.
    fn flatten_embedded_images(&mut self) {
        let mut seen: std::collections::HashSet<String> = self
            .product_images
            .iter()
            .map(|img| img.legacy_id.clone())
            .collect();
        for product in self.products.iter_mut().chain(self.breeders.iter_mut()) {
            for mut image in std::mem::take(&mut product.images) {
                if image.legacy_product_id.trim().is_empty() {
                    image.legacy_product_id = product.legacy_id.clone();
                }
                if seen.insert(image.legacy_id.clone()) {
                    self.product_images.push(image);
                }
            }
        }
    }

    /// Per-entity record counts as stored in `counts`.
    pub fn compute_counts(&self) -> BTreeMap<String, usize> {
        BTreeMap::from([
            ("users".to_string(), self.users.len()),
            ("series".to_string(), self.series.len()),
            ("products".to_string(), self.products.len()),
            ("productImages".to_string(), self.product_images.len()),
            ("breeders".to_string(), self.breeders.len()),
            ("breederEvents".to_string(), self.breeder_events.len()),
            ("featuredProducts".to_string(), self.featured_products.len()),
            ("shareSeeds".to_string(), self.share_seeds.len()),
            ("validationIssues".to_string(), self.validation_issues.len()),
        ])
    }

    pub fn refresh_counts(&mut self) {
        self.counts = self.compute_counts();
    }
}
