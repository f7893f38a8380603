//! Crawl input model and shard-step derivation.

use std::env;
use std::fs;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::records::ShardTask;

pub const BASE_URL: &str = "https://www.airbnb.com";

/// Shard width in USD before currency scaling.
const BASE_SHARD_STEP_USD: f64 = 20.0;

const EXCHANGE_RATE_API: &str = "https://open.er-api.com/v6/latest/USD";

/// Offline fallback when the live exchange-rate fetch fails. Coarse values
/// are fine — the rate only scales shard granularity.
const FALLBACK_RATES: &[(&str, f64)] = &[
    ("USD", 1.0),
    ("EUR", 0.92),
    ("GBP", 0.79),
    ("CAD", 1.36),
    ("AUD", 1.51),
    ("JPY", 155.0),
    ("INR", 83.0),
    ("BRL", 5.1),
    ("MXN", 17.0),
    ("SEK", 10.5),
    ("PLN", 4.0),
    ("KRW", 1350.0),
];

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnrichmentFlags {
    pub images: bool,
    pub reviews: bool,
    pub details: bool,
    pub host_details: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlInput {
    /// Free-text location queries, each fanned out into its own search.
    pub location_queries: Vec<String>,
    /// Direct search URLs, used as-is.
    pub start_urls: Vec<String>,
    pub check_in: Option<String>,
    pub check_out: Option<String>,
    pub adults: u32,
    pub children: u32,
    pub infants: u32,
    pub pets: u32,
    pub min_beds: Option<u32>,
    pub min_bedrooms: Option<u32>,
    pub min_bathrooms: Option<u32>,
    /// Global price window. Listings priced outside it are skipped
    /// regardless of which shard surfaced them.
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    /// Target result cap; absent or 0 means unlimited.
    pub max_listings: u64,
    pub currency: String,
    #[serde(flatten)]
    pub enrichment: EnrichmentFlags,
    /// Fast mode emits search summaries directly; deep mode visits every
    /// detail page.
    pub fast_mode: bool,
    pub enable_price_sharding: bool,
    /// Explicit shard width; when unset it is derived from the currency's
    /// exchange rate.
    pub price_shard_step: Option<u32>,
    pub max_concurrency: usize,
}

impl Default for CrawlInput {
    fn default() -> Self {
        CrawlInput {
            location_queries: Vec::new(),
            start_urls: Vec::new(),
            check_in: None,
            check_out: None,
            adults: 1,
            children: 0,
            infants: 0,
            pets: 0,
            min_beds: None,
            min_bedrooms: None,
            min_bathrooms: None,
            min_price: None,
            max_price: None,
            max_listings: 0,
            currency: "USD".to_string(),
            enrichment: EnrichmentFlags::default(),
            fast_mode: false,
            enable_price_sharding: true,
            price_shard_step: None,
            max_concurrency: 100,
        }
    }
}

impl CrawlInput {
    /// Load from the JSON file named by `INPUT_PATH`, defaulting to
    /// `input.json`.
    pub fn load() -> Result<Self> {
        let path = env::var("INPUT_PATH").unwrap_or_else(|_| "input.json".to_string());
        let raw = fs::read_to_string(&path).with_context(|| format!("reading input {path}"))?;
        let input: CrawlInput =
            serde_json::from_str(&raw).with_context(|| format!("parsing input {path}"))?;
        input.validate()?;
        Ok(input)
    }

    pub fn validate(&self) -> Result<()> {
        if self.location_queries.is_empty() && self.start_urls.is_empty() {
            anyhow::bail!("at least one location query or start URL is required");
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                anyhow::bail!("minPrice {min} exceeds maxPrice {max}");
            }
        }
        Ok(())
    }

    /// Normalized target: 0 means unlimited.
    pub fn target(&self) -> Option<u64> {
        (self.max_listings > 0).then_some(self.max_listings)
    }

    /// Nights of the requested stay, from the date range.
    pub fn nights(&self) -> Option<u32> {
        let check_in = self.check_in.as_deref()?.parse::<chrono::NaiveDate>().ok()?;
        let check_out = self.check_out.as_deref()?.parse::<chrono::NaiveDate>().ok()?;
        let nights = (check_out - check_in).num_days();
        (nights > 0).then_some(nights as u32)
    }

    /// Search URL for one location query constrained to one price shard.
    pub fn search_url(&self, query: &str, shard: &ShardTask) -> String {
        let mut url = format!(
            "{BASE_URL}/s/{}/homes?price_filter_input_type=0&search_type=filter_change",
            urlencoding::encode(query)
        );
        // An unbounded shard carries no price window; its sentinel max must
        // not leak into the URL.
        if !(shard.is_unbounded() && shard.min_price == 0) {
            push_param(&mut url, "price_min", Some(shard.min_price.to_string()));
        }
        if !shard.is_unbounded() {
            push_param(&mut url, "price_max", Some(shard.max_price.to_string()));
        }
        push_param(&mut url, "checkin", self.check_in.clone());
        push_param(&mut url, "checkout", self.check_out.clone());
        push_param(&mut url, "adults", Some(self.adults.to_string()));
        push_param(&mut url, "children", nonzero(self.children));
        push_param(&mut url, "infants", nonzero(self.infants));
        push_param(&mut url, "pets", nonzero(self.pets));
        push_param(&mut url, "min_beds", self.min_beds.map(|v| v.to_string()));
        push_param(&mut url, "min_bedrooms", self.min_bedrooms.map(|v| v.to_string()));
        push_param(&mut url, "min_bathrooms", self.min_bathrooms.map(|v| v.to_string()));
        push_param(&mut url, "currency", Some(self.currency.clone()));
        push_param(&mut url, "cursor", shard.cursor.clone());
        url
    }

    pub fn detail_url(&self, listing_id: &str) -> String {
        let mut url = format!("{BASE_URL}/rooms/{listing_id}?");
        push_param(&mut url, "checkin", self.check_in.clone());
        push_param(&mut url, "checkout", self.check_out.clone());
        push_param(&mut url, "adults", Some(self.adults.to_string()));
        push_param(&mut url, "currency", Some(self.currency.clone()));
        url.trim_end_matches(['?', '&']).to_string()
    }
}

fn push_param(url: &mut String, key: &str, value: Option<String>) {
    if let Some(value) = value {
        let sep = if url.ends_with(['?', '&']) { "" } else { "&" };
        url.push_str(&format!("{sep}{key}={}", urlencoding::encode(&value)));
    }
}

fn nonzero(value: u32) -> Option<String> {
    (value > 0).then(|| value.to_string())
}

/// Shard step for the target currency: the USD base width scaled by the
/// exchange rate, fetched live with an offline fallback table.
pub async fn derive_shard_step(currency: &str) -> u32 {
    let rate = match fetch_usd_rate(currency).await {
        Ok(Some(rate)) => rate,
        Ok(None) | Err(_) => {
            let fallback = fallback_rate(currency);
            tracing::warn!(currency, rate = fallback, "using offline exchange-rate fallback");
            fallback
        }
    };
    ((BASE_SHARD_STEP_USD * rate).round() as u32).max(1)
}

async fn fetch_usd_rate(currency: &str) -> Result<Option<f64>> {
    let response = reqwest::Client::new()
        .get(EXCHANGE_RATE_API)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await?
        .json::<serde_json::Value>()
        .await?;
    Ok(response
        .get("rates")
        .and_then(|rates| rates.get(currency))
        .and_then(serde_json::Value::as_f64))
}

fn fallback_rate(currency: &str) -> f64 {
    FALLBACK_RATES
        .iter()
        .find(|(code, _)| *code == currency)
        .map(|(_, rate)| *rate)
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_target_normalization() {
        let input = CrawlInput::default();
        assert_eq!(input.target(), None);
        let mut capped = CrawlInput::default();
        capped.max_listings = 5;
        assert_eq!(capped.target(), Some(5));
    }

    #[test]
    fn nights_from_dates() {
        let mut input = CrawlInput::default();
        input.check_in = Some("2026-09-01".into());
        input.check_out = Some("2026-09-07".into());
        assert_eq!(input.nights(), Some(6));
    }

    #[test]
    fn search_url_carries_shard_window() {
        let mut input = CrawlInput::default();
        input.location_queries = vec!["London".into()];
        let shard = ShardTask::new(50, 99);
        let url = input.search_url("London", &shard);
        assert!(url.contains("price_min=50"));
        assert!(url.contains("price_max=99"));
        assert!(url.contains("price_filter_input_type=0"));
        assert!(!url.contains("cursor="));
    }

    #[test]
    fn search_url_omits_window_for_unbounded_shard() {
        let mut input = CrawlInput::default();
        input.location_queries = vec!["London".into()];
        let url = input.search_url("London", &ShardTask::unbounded(0));
        assert!(!url.contains("price_min"));
        assert!(!url.contains("price_max"));

        let floored = input.search_url("London", &ShardTask::unbounded(75));
        assert!(floored.contains("price_min=75"));
        assert!(!floored.contains("price_max"));
    }

    #[test]
    fn invalid_price_window_rejected() {
        let mut input = CrawlInput::default();
        input.location_queries = vec!["x".into()];
        input.min_price = Some(300.0);
        input.max_price = Some(100.0);
        assert!(input.validate().is_err());
    }

    #[test]
    fn fallback_rate_known_and_unknown() {
        assert_eq!(fallback_rate("JPY"), 155.0);
        assert_eq!(fallback_rate("XXX"), 1.0);
    }

    #[test]
    fn input_json_parses() {
        let raw = r#"{
            "locationQueries": ["Paris"],
            "checkIn": "2026-09-01",
            "checkOut": "2026-09-05",
            "adults": 2,
            "minPrice": 50,
            "maxPrice": 300,
            "maxListings": 100,
            "currency": "EUR",
            "images": true,
            "hostDetails": true,
            "fastMode": false,
            "priceShardStep": 25
        }"#;
        let input: CrawlInput = serde_json::from_str(raw).unwrap();
        assert_eq!(input.location_queries, vec!["Paris".to_string()]);
        assert!(input.enrichment.images);
        assert!(input.enrichment.host_details);
        assert!(!input.enrichment.reviews);
        assert_eq!(input.price_shard_step, Some(25));
    }
}
