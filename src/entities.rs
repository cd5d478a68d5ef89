//! Cumulative customer preferences (the entity bag).
//!
//! Entities extracted per turn are merged into the session's cumulative
//! `ExtractedInfo`. The bag is open-world: unknown fields ride along in the
//! flattened `extra` map and survive merges unchanged.

use serde::{Deserialize, Serialize};

// ─── Bounds ─────────────────────────────────────────────────────────────────

const MAX_BUDGET: f64 = 1e9;
const MAX_ROOMS: u32 = 20;
const MAX_INSTALLMENT_YEARS: u32 = 30;

/// How far a single target area is widened into a search range.
const AREA_WIDENING: f64 = 0.10;

// ─── Bag ────────────────────────────────────────────────────────────────────

/// Open-world map of customer preferences accumulated across turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bathrooms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_area: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_area: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_timeline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_payment_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installment_years: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    /// Fields this version doesn't model; carried through merges unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ExtractedInfo {
    /// Number of filled known fields (used by the lead scorer).
    pub fn filled_count(&self) -> usize {
        let mut count = 0;
        count += self.budget.is_some() as usize;
        count += self.min_price.is_some() as usize;
        count += self.max_price.is_some() as usize;
        count += self.location.is_some() as usize;
        count += self.city.is_some() as usize;
        count += self.district.is_some() as usize;
        count += self.property_type.is_some() as usize;
        count += self.bedrooms.is_some() as usize;
        count += self.bathrooms.is_some() as usize;
        count += self.area.is_some() as usize;
        count += self.delivery_timeline.is_some() as usize;
        count += self.urgency.is_some() as usize;
        count += self.payment_method.is_some() as usize;
        count += self.down_payment_percentage.is_some() as usize;
        count += self.installment_years.is_some() as usize;
        count += self.purpose.is_some() as usize;
        count += self.customer_name.is_some() as usize;
        count
    }
}

// ─── Merge ──────────────────────────────────────────────────────────────────

macro_rules! take_new {
    ($merged:ident, $new:ident, $($field:ident),+ $(,)?) => {
        $(
            if $new.$field.is_some() {
                $merged.$field = $new.$field.clone();
            }
        )+
    };
}

/// Merge a turn's entities into the cumulative bag.
///
/// Non-nil fields in `new` overwrite; absent fields stay untouched; derived
/// fields (budget from the price range, location from city + district, area
/// from the area range) are synthesized; the result is validated.
pub fn merge(existing: &ExtractedInfo, new: &ExtractedInfo) -> ExtractedInfo {
    let mut merged = existing.clone();

    take_new!(
        merged, new, budget, min_price, max_price, location, city, district, property_type,
        bedrooms, bathrooms, area, min_area, max_area, delivery_timeline, urgency,
        payment_method, down_payment_percentage, installment_years, purpose, customer_name,
    );
    for (key, value) in &new.extra {
        merged.extra.insert(key.clone(), value.clone());
    }

    // A price range collapses into one budget figure: the top of the range.
    if merged.budget.is_none() {
        merged.budget = match (merged.min_price, merged.max_price) {
            (Some(min), Some(max)) => Some(min.max(max)),
            (Some(min), None) => Some(min),
            (None, Some(max)) => Some(max),
            (None, None) => None,
        };
    }

    // City + district without a location synthesize one.
    if merged.location.is_none() {
        merged.location = match (&merged.city, &merged.district) {
            (Some(city), Some(district)) => Some(format!("{city}, {district}")),
            _ => None,
        };
    }

    // An area range collapses into an approximate midpoint.
    if merged.area.is_none() {
        merged.area = match (merged.min_area, merged.max_area) {
            (Some(min), Some(max)) => Some((min + max) / 2.0),
            (Some(min), None) => Some(min),
            (None, Some(max)) => Some(max),
            (None, None) => None,
        };
    }

    validate(&merged)
}

/// Drop out-of-range values; everything else passes through.
pub fn validate(info: &ExtractedInfo) -> ExtractedInfo {
    let mut clean = info.clone();

    let price_ok = |v: f64| (0.0..=MAX_BUDGET).contains(&v);
    clean.budget = clean.budget.filter(|v| price_ok(*v));
    clean.min_price = clean.min_price.filter(|v| price_ok(*v));
    clean.max_price = clean.max_price.filter(|v| price_ok(*v));

    clean.bedrooms = clean.bedrooms.filter(|v| *v <= MAX_ROOMS);
    clean.bathrooms = clean.bathrooms.filter(|v| *v <= MAX_ROOMS);

    let area_ok = |v: f64| v >= 0.0;
    clean.area = clean.area.filter(|v| area_ok(*v));
    clean.min_area = clean.min_area.filter(|v| area_ok(*v));
    clean.max_area = clean.max_area.filter(|v| area_ok(*v));

    clean.down_payment_percentage = clean
        .down_payment_percentage
        .filter(|v| (0.0..=100.0).contains(v));
    clean.installment_years = clean
        .installment_years
        .filter(|v| *v <= MAX_INSTALLMENT_YEARS);

    clean
}

// ─── Search projection ──────────────────────────────────────────────────────

/// Vector-store filter fields projected from the cumulative bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub location: Option<String>,
    pub property_type: Option<String>,
    pub bedrooms: Option<u32>,
    pub min_area: Option<f64>,
    pub max_area: Option<f64>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        *self == SearchFilters::default()
    }
}

/// Project the bag into search filters. A lone budget becomes the price
/// ceiling; a lone target area is widened ±10 %.
pub fn extract_search_filters(info: &ExtractedInfo) -> SearchFilters {
    let mut filters = SearchFilters {
        min_price: info.min_price,
        max_price: info.max_price,
        location: info.location.clone().or_else(|| info.city.clone()),
        property_type: info.property_type.clone(),
        bedrooms: info.bedrooms,
        min_area: info.min_area,
        max_area: info.max_area,
        ..SearchFilters::default()
    };

    if filters.max_price.is_none() {
        filters.max_price = info.budget;
    }

    if filters.min_area.is_none() && filters.max_area.is_none() {
        if let Some(area) = info.area {
            filters.min_area = Some(area * (1.0 - AREA_WIDENING));
            filters.max_area = Some(area * (1.0 + AREA_WIDENING));
        }
    }

    filters
}

// ─── Tests ──────────────────────────────────────────────────────────────────
