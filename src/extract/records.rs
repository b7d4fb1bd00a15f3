//! Loosely-typed legacy JSON records to payload records.
//!
//! The legacy API mixes snake_case and camelCase keys and sometimes renders
//! ids as numbers; every accessor here accepts both. Records without an id
//! get a positional fallback id so the payload never carries blank ids.
use serde_json::Value;

use crate::normalization::value::{array_field, bool_field, int_field, opt_int_field, str_field};
use crate::payload::{
    LegacyBreederEvent, LegacyFeaturedProduct, LegacyProduct, LegacyProductImage, LegacySeries,
    LegacyUser,
};

/// The record list inside a response: the body itself when it is an array,
/// otherwise the first array found under `keys`.
pub fn list_of<'a>(body: &'a Value, keys: &[&str]) -> &'a [Value] {
    if let Some(items) = body.as_array() {
        return items;
    }
    keys.iter()
        .map(|k| array_field(body, k))
        .find(|items| !items.is_empty())
        .unwrap_or(&[])
}

pub fn series_from_value(v: &Value) -> Option<LegacySeries> {
    Some(LegacySeries {
        legacy_id: str_field(v, &["id", "legacyId"])?,
        code: str_field(v, &["code"]),
        name: str_field(v, &["name"]),
        description: str_field(v, &["description"]),
        sort_order: int_field(v, &["sort_order", "sortOrder"], 0),
        is_active: bool_field(v, &["is_active", "isActive"], true),
        created_at: str_field(v, &["created_at", "createdAt"]),
        updated_at: str_field(v, &["updated_at", "updatedAt"]),
    })
}

pub fn image_from_value(v: &Value, product_id: &str, index: usize) -> LegacyProductImage {
    LegacyProductImage {
        legacy_id: str_field(v, &["id", "legacyId"])
            .unwrap_or_else(|| format!("{product_id}-image-{}", index + 1)),
        legacy_product_id: str_field(v, &["product_id", "productId"])
            .unwrap_or_else(|| product_id.to_string()),
        url: str_field(v, &["url"]),
        kind: str_field(v, &["type"]),
        sort_order: int_field(v, &["sort_order", "sortOrder"], index as i64),
        created_at: str_field(v, &["created_at", "createdAt"]),
    }
}

/// Product or breeder record with its embedded images split out.
pub fn animal_from_value(v: &Value) -> Option<(LegacyProduct, Vec<LegacyProductImage>)> {
    let legacy_id = str_field(v, &["id", "legacyId"])?;
    let images = array_field(v, "images")
        .iter()
        .enumerate()
        .map(|(i, img)| image_from_value(img, &legacy_id, i))
        .collect();
    let product = LegacyProduct {
        code: str_field(v, &["code"]),
        name: str_field(v, &["name"]),
        description: str_field(v, &["description"]),
        series_legacy_id: str_field(v, &["series_id", "seriesId", "seriesLegacyId"]),
        sex: str_field(v, &["sex"]),
        sire_code: str_field(v, &["sire_code", "sireCode"]),
        dam_code: str_field(v, &["dam_code", "damCode"]),
        mate_code: str_field(v, &["mate_code", "mateCode"]),
        exclude_from_breeding: Some(bool_field(v, &["exclude_from_breeding", "excludeFromBreeding"], false)),
        in_stock: Some(bool_field(v, &["in_stock", "inStock"], true)),
        is_featured: Some(bool_field(v, &["is_featured", "isFeatured"], false)),
        created_at: str_field(v, &["created_at", "createdAt"]),
        updated_at: str_field(v, &["updated_at", "updatedAt"]),
        images: Vec::new(),
        legacy_id,
    };
    Some((product, images))
}

pub fn event_from_value(v: &Value, breeder_id: &str, index: usize) -> LegacyBreederEvent {
    LegacyBreederEvent {
        legacy_id: str_field(v, &["id", "legacyId"])
            .unwrap_or_else(|| format!("{breeder_id}-event-{}", index + 1)),
        legacy_breeder_id: str_field(v, &["product_id", "productId", "breeder_id", "breederId"])
            .unwrap_or_else(|| breeder_id.to_string()),
        event_type: str_field(v, &["event_type", "eventType"]),
        event_date: str_field(v, &["event_date", "eventDate"]),
        male_code: str_field(v, &["male_code", "maleCode"]),
        egg_count: opt_int_field(v, &["egg_count", "eggCount"]),
        note: str_field(v, &["note"]),
        old_mate_code: str_field(v, &["old_mate_code", "oldMateCode"]),
        new_mate_code: str_field(v, &["new_mate_code", "newMateCode"]),
        created_at: str_field(v, &["created_at", "createdAt"]),
    }
}

pub fn featured_from_value(v: &Value, index: usize) -> Option<LegacyFeaturedProduct> {
    let product_id = str_field(v, &["product_id", "productId"])
        .or_else(|| v.get("product").and_then(|p| str_field(p, &["id"])))?;
    Some(LegacyFeaturedProduct {
        legacy_id: str_field(v, &["id", "legacyId"]).unwrap_or_else(|| format!("featured-{}", index + 1)),
        legacy_product_id: product_id,
        sort_order: int_field(v, &["sort_order", "sortOrder"], index as i64),
        is_active: bool_field(v, &["is_active", "isActive"], true),
    })
}

pub fn user_from_value(v: &Value) -> Option<LegacyUser> {
    Some(LegacyUser {
        legacy_id: str_field(v, &["id"]),
        username: str_field(v, &["username", "name"])?,
        role: str_field(v, &["role"]),
        is_active: bool_field(v, &["is_active", "isActive"], true),
    })
}
