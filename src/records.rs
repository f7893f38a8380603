use serde::{Deserialize, Serialize};

/// Normalized nightly price. `amount` stays unset when no numeric token was
/// found in the source string — never defaulted to zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Price {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Price {
    pub fn is_empty(&self) -> bool {
        self.amount.is_none() && self.currency.is_none() && self.label.is_none()
    }

    pub fn amount_f64(&self) -> Option<f64> {
        self.amount.as_deref().and_then(|a| a.parse::<f64>().ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_superhost: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub years_hosting: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_url: Option<String>,
}

impl Host {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.name.is_none() && self.is_superhost.is_none()
            && self.years_hosting.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amenity {
    pub title: String,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// One listing as seen on a search-result page. Created and consumed within
/// a single task, never retained across tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingSummary {
    pub id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Price::is_empty", default)]
    pub price: Price,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviews_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bathrooms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_capacity: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Full record extracted from a detail page. Superset of [`ListingSummary`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingDetail {
    #[serde(flatten)]
    pub summary: ListingSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub house_rules: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub amenities: Vec<Amenity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<Host>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

impl ListingDetail {
    /// Minimal identity-only record, used when detail extraction fails
    /// internally. Detail failures are non-fatal.
    pub fn identity_only(id: &str, url: &str) -> Self {
        ListingDetail {
            summary: ListingSummary {
                id: id.to_string(),
                url: url.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Merge a carried-over search summary under this detail record. A
    /// detail field keeps its value; the summary fills a field only when the
    /// detail left it unset or empty.
    pub fn fill_from_summary(&mut self, carried: &ListingSummary) {
        let s = &mut self.summary;
        if s.id.is_empty() {
            s.id = carried.id.clone();
        }
        if s.url.is_empty() {
            s.url = carried.url.clone();
        }
        fill_opt(&mut s.title, &carried.title);
        if s.price.amount.is_none() {
            s.price = carried.price.clone();
        }
        fill_opt(&mut s.rating, &carried.rating);
        fill_opt(&mut s.reviews_count, &carried.reviews_count);
        fill_opt(&mut s.room_type, &carried.room_type);
        fill_opt(&mut s.thumbnail, &carried.thumbnail);
        fill_opt(&mut s.beds, &carried.beds);
        fill_opt(&mut s.bedrooms, &carried.bedrooms);
        fill_opt(&mut s.bathrooms, &carried.bathrooms);
        fill_opt(&mut s.person_capacity, &carried.person_capacity);
        fill_opt(&mut s.location, &carried.location);
    }
}

fn fill_opt<T: Clone>(slot: &mut Option<T>, carried: &Option<T>) {
    if slot.is_none() {
        *slot = carried.clone();
    }
}

/// Set a field from a fallback chain without ever flipping an already-set
/// value. First-match-wins resolution relies on this being idempotent.
pub fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// One rendered search page's extraction output.
#[derive(Debug, Clone, Default)]
pub struct SearchPageResult {
    pub listings: Vec<ListingSummary>,
    pub total_count: u64,
    pub duplicate_count: u64,
}

/// One price sub-range processed as its own search task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardTask {
    pub min_price: u32,
    pub max_price: u32,
    pub split_depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl ShardTask {
    pub fn new(min_price: u32, max_price: u32) -> Self {
        ShardTask { min_price, max_price, split_depth: 0, cursor: None }
    }

    /// Shard covering `[min_price, ∞)`. The sentinel `max_price` must never
    /// surface as a URL parameter; see [`ShardTask::is_unbounded`].
    pub fn unbounded(min_price: u32) -> Self {
        ShardTask { min_price, max_price: u32::MAX, split_depth: 0, cursor: None }
    }

    /// An unbounded shard has no upper price limit and no meaningful
    /// midpoint, so it is exempt from bisection.
    pub fn is_unbounded(&self) -> bool {
        self.max_price == u32::MAX
    }

    pub fn width(&self) -> u32 {
        self.max_price.saturating_sub(self.min_price)
    }
}
