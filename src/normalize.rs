//! Pure string→value parsers behind the field fallback chains.
//!
//! Every parser returns an explicit "unparseable" result (`None` / empty)
//! instead of guessing. Accepted patterns are documented per function so the
//! heuristics can be fuzzed without page automation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use crate::records::{Host, Price};

static RE_NUMERIC_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[\d.,\s]*\d|\d").unwrap());
// Plural only: a singular "night" qualifier marks an already-per-night
// amount ("$85 night"), and must not capture the amount as a divisor.
static RE_NIGHTS_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:for\s+)?(\d+)\s*nights\b").unwrap());
static RE_KIND_DIGITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]+:(\d+)$").unwrap());
static RE_ISO_CURRENCY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([A-Z]{3})\b").unwrap());

static RE_BEDROOMS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*bedroom").unwrap());
static RE_BEDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*beds?\b").unwrap());
static RE_BATHS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:shared\s+|private\s+)?bath").unwrap());
static RE_GUESTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+)\s*guest").unwrap());

static RE_GENERIC_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:room|home|house|apartment|flat|condo|loft|cabin|cottage|townhouse|villa|rental unit|guesthouse|guest suite|place to stay|hotel room|bed and breakfast|boutique hotel)\s+in\s+\S",
    )
    .unwrap()
});

static RE_HOSTED_BY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Hosted by ([A-Za-z][A-Za-z'’\- ]*[A-Za-z])").unwrap());
static RE_YEARS_HOSTING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*years?\s+hosting").unwrap());
static RE_JOINED_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)joined\s+(?:in\s+)?(\d{4})").unwrap());

/// Currency symbols the site renders, mapped to ISO codes.
const CURRENCY_SYMBOLS: &[(&str, &str)] = &[
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
    ("₹", "INR"),
    ("₩", "KRW"),
    ("R$", "BRL"),
    ("zł", "PLN"),
    ("kr", "SEK"),
    ("$", "USD"),
];

/// Detail-page titles that mean the page was a redirect or a generic shell,
/// not the listing itself.
const PLACEHOLDER_TITLES: &[&str] = &[
    "vacation rentals",
    "homes & experiences",
    "holiday rentals",
    "access denied",
    "just a moment",
    "page not found",
];

// ============================================================================
// Price
// ============================================================================

/// Parse a localized price string into a normalized per-night [`Price`].
///
/// Accepted inputs: "$150 / night", "€ 1.234,56", "$900 total for 6 nights".
/// A textual "N nights" marker divides the parsed amount by N; a bare
/// "total" marker divides by the caller's nights qualifier. Anything without
/// a numeric token yields an unset amount, never zero.
pub fn parse_price(raw: &str, qualifier_nights: Option<u32>) -> Price {
    let label = raw.trim();
    if label.is_empty() {
        return Price::default();
    }

    let currency = detect_currency(label);
    let amount = RE_NUMERIC_TOKEN
        .find(label)
        .and_then(|m| parse_localized_number(m.as_str()))
        .map(|mut value| {
            if let Some(nights) = nights_divisor(label, qualifier_nights) {
                if nights > 1 {
                    value /= f64::from(nights);
                }
            }
            format_amount(value)
        });

    Price {
        amount,
        currency,
        label: Some(label.to_string()),
    }
}

/// Nights to divide by: an explicit "N nights" in the text wins, a bare
/// "total" marker falls back to the qualifier. No marker means the amount is
/// already per-night.
fn nights_divisor(label: &str, qualifier_nights: Option<u32>) -> Option<u32> {
    if let Some(caps) = RE_NIGHTS_MARKER.captures(label) {
        return caps[1].parse::<u32>().ok();
    }
    if label.to_lowercase().contains("total") {
        return qualifier_nights;
    }
    None
}

fn detect_currency(label: &str) -> Option<String> {
    for (symbol, iso) in CURRENCY_SYMBOLS {
        if label.contains(symbol) {
            return Some((*iso).to_string());
        }
    }
    RE_ISO_CURRENCY
        .captures(label)
        .map(|caps| caps[1].to_string())
}

/// Handle both separator conventions: "1,234.56" and "1.234,56". When both
/// separators appear, the later one is the decimal point. A lone separator
/// followed by exactly three digits is a thousands separator.
fn parse_localized_number(token: &str) -> Option<f64> {
    let cleaned: String = token.chars().filter(|c| !c.is_whitespace()).collect();
    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(d), Some(c)) => {
            let (decimal, group) = if d > c { ('.', ',') } else { (',', '.') };
            cleaned
                .replace(group, "")
                .replace(decimal, ".")
        }
        (None, Some(c)) => {
            if cleaned.len() - c == 4 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        (Some(d), None) => {
            if cleaned.len() - d == 4 && cleaned.matches('.').count() == 1 && d > 0 {
                // Ambiguous "1.234": group separator in most locales the
                // site emits for whole amounts.
                cleaned.replace('.', "")
            } else {
                cleaned
            }
        }
        (None, None) => cleaned,
    };

    normalized.parse::<f64>().ok()
}

fn format_amount(value: f64) -> String {
    if (value - value.round()).abs() < 1e-9 {
        format!("{}", value.round() as i64)
    } else {
        let s = format!("{:.2}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

// ============================================================================
// Capacity / room composition
// ============================================================================

/// Room composition parsed from a compact summary string.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoomStats {
    pub beds: Option<f64>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub person_capacity: Option<u32>,
}

/// Parse "2 bedrooms · 3 beds · 1 bath" style summaries. "Studio" counts as
/// zero bedrooms, a half-bath as 0.5 bathrooms.
pub fn parse_room_summary(raw: &str) -> RoomStats {
    let mut stats = RoomStats::default();

    if raw.to_lowercase().contains("studio") {
        stats.bedrooms = Some(0.0);
    }
    if let Some(caps) = RE_BEDROOMS.captures(raw) {
        stats.bedrooms = caps[1].parse::<f64>().ok().or(stats.bedrooms);
    }
    if let Some(caps) = RE_BEDS.captures(raw) {
        stats.beds = caps[1].parse::<f64>().ok();
    }
    let lower = raw.to_lowercase();
    if lower.contains("half-bath") || lower.contains("half bath") {
        stats.bathrooms = Some(0.5);
    } else if let Some(caps) = RE_BATHS.captures(raw) {
        stats.bathrooms = caps[1].parse::<f64>().ok();
    }
    if let Some(caps) = RE_GUESTS.captures(raw) {
        stats.person_capacity = caps[1].parse::<u32>().ok();
    }

    stats
}

// ============================================================================
// Identity
// ============================================================================

/// Canonicalize a listing or host id. Purely numeric tokens pass through;
/// opaque tokens are base64-decoded and a `Kind:digits` pattern extracted
/// when present; otherwise the raw token is kept.
pub fn canonical_id(token: &str) -> String {
    if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()) {
        return token.to_string();
    }
    if let Ok(bytes) = STANDARD.decode(token) {
        if let Ok(decoded) = String::from_utf8(bytes) {
            if let Some(caps) = RE_KIND_DIGITS.captures(&decoded) {
                return caps[1].to_string();
            }
        }
    }
    token.to_string()
}

// ============================================================================
// Title
// ============================================================================

/// A short "<RoomType> in <Place>" string is the site's category label, not
/// the listing's actual name.
pub fn is_generic_title(title: &str) -> bool {
    title.len() < 40 && RE_GENERIC_TITLE.is_match(title.trim())
}

/// Known generic/redirect placeholder titles on detail pages.
pub fn is_placeholder_title(title: &str) -> bool {
    let lower = title.to_lowercase();
    PLACEHOLDER_TITLES.iter().any(|p| lower.contains(p))
}

static SEL_H1: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").unwrap());
static SEL_DOC_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static SEL_META_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta[property='og:title'], meta[name='title']").unwrap());

/// Title fallback chain over the DOM: page heading, then the first
/// hyphen-delimited segment of the document title, then the first
/// "·"-delimited segment of the meta title. Generic and placeholder
/// candidates are rejected at every step.
pub fn title_from_dom(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    let heading = document
        .select(&SEL_H1)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string());
    if let Some(t) = acceptable_title(heading) {
        return Some(t);
    }

    let doc_title = document
        .select(&SEL_DOC_TITLE)
        .next()
        .map(|el| el.text().collect::<String>())
        .and_then(|t| t.split(" - ").next().map(|s| s.trim().to_string()));
    if let Some(t) = acceptable_title(doc_title) {
        return Some(t);
    }

    let meta_title = document
        .select(&SEL_META_TITLE)
        .next()
        .and_then(|el| el.value().attr("content"))
        .and_then(|t| t.split('·').next().map(|s| s.trim().to_string()));
    acceptable_title(meta_title)
}

fn acceptable_title(candidate: Option<String>) -> Option<String> {
    candidate.filter(|t| !t.is_empty() && !is_generic_title(t) && !is_placeholder_title(t))
}

// ============================================================================
// Host
// ============================================================================

static SEL_HOST_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href*='/users/show/']").unwrap());
static SEL_IMG: Lazy<Selector> = Lazy::new(|| Selector::parse("img").unwrap());

/// DOM fallback for host fields: scan the text around the host-profile link
/// for "Hosted by X", a Superhost marker, "N years hosting", or
/// "Joined <year>" (tenure = current year − joined year when no explicit
/// count exists).
pub fn host_from_dom(html: &str, current_year: i32) -> Host {
    let document = Html::parse_document(html);
    let mut host = Host::default();

    let Some(link) = document.select(&SEL_HOST_LINK).next() else {
        return host;
    };

    if let Some(href) = link.value().attr("href") {
        host.profile_url = Some(href.to_string());
        host.id = href
            .rsplit('/')
            .find(|seg| !seg.is_empty())
            .map(|seg| canonical_id(seg.split('?').next().unwrap_or(seg)));
    }
    host.thumbnail = link
        .select(&SEL_IMG)
        .next()
        .and_then(|img| img.value().attr("src"))
        .map(String::from);

    // Scope the text scan to the enclosing host section, not the whole page.
    let mut scope = link;
    for _ in 0..3 {
        match scope.parent().and_then(scraper::ElementRef::wrap) {
            Some(parent) => scope = parent,
            None => break,
        }
    }
    // Scan per text node: separate spans must not bleed into one another
    // (a name capture stopping at the next span's "Superhost" marker).
    let mut joined_year: Option<i32> = None;
    for text in scope.text() {
        if host.name.is_none() {
            if let Some(caps) = RE_HOSTED_BY.captures(text) {
                host.name = Some(caps[1].trim().to_string());
            }
        }
        if text.contains("Superhost") {
            host.is_superhost = Some(true);
        }
        if host.years_hosting.is_none() {
            if let Some(caps) = RE_YEARS_HOSTING.captures(text) {
                host.years_hosting = caps[1].parse::<u32>().ok();
            }
        }
        if joined_year.is_none() {
            if let Some(caps) = RE_JOINED_YEAR.captures(text) {
                joined_year = caps[1].parse::<i32>().ok();
            }
        }
    }
    if host.years_hosting.is_none() {
        if let Some(joined) = joined_year.filter(|y| *y <= current_year) {
            host.years_hosting = Some((current_year - joined) as u32);
        }
    }

    host
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_price_divided_by_textual_nights() {
        let price = parse_price("$900 total for 6 nights", Some(6));
        assert_eq!(price.amount.as_deref(), Some("150"));
        assert_eq!(price.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn per_night_price_unchanged() {
        let price = parse_price("$150 / night", None);
        assert_eq!(price.amount.as_deref(), Some("150"));
    }

    #[test]
    fn per_night_price_ignores_qualifier_without_marker() {
        // A nightly display with no "total" or "N nights" marker must not be
        // divided even when the caller knows the stay length.
        let price = parse_price("$150 / night", Some(6));
        assert_eq!(price.amount.as_deref(), Some("150"));
        // The singular qualifier right after the amount is not a divisor.
        let price = parse_price("$85 night", Some(6));
        assert_eq!(price.amount.as_deref(), Some("85"));
    }

    #[test]
    fn total_marker_uses_qualifier_nights() {
        let price = parse_price("€600 total", Some(4));
        assert_eq!(price.amount.as_deref(), Some("150"));
        assert_eq!(price.currency.as_deref(), Some("EUR"));
    }

    #[test]
    fn no_numeric_token_leaves_amount_unset() {
        let price = parse_price("Price unavailable", None);
        assert!(price.amount.is_none());
        assert_eq!(price.label.as_deref(), Some("Price unavailable"));
    }

    #[test]
    fn localized_separators_parsed() {
        assert_eq!(parse_price("€ 1.234,56", None).amount.as_deref(), Some("1234.56"));
        assert_eq!(parse_price("$1,234.56", None).amount.as_deref(), Some("1234.56"));
        assert_eq!(parse_price("¥12,000", None).amount.as_deref(), Some("12000"));
    }

    #[test]
    fn room_summary_parsed() {
        let stats = parse_room_summary("4 guests · 2 bedrooms · 3 beds · 1 bath");
        assert_eq!(stats.person_capacity, Some(4));
        assert_eq!(stats.bedrooms, Some(2.0));
        assert_eq!(stats.beds, Some(3.0));
        assert_eq!(stats.bathrooms, Some(1.0));
    }

    #[test]
    fn studio_is_zero_bedrooms() {
        let stats = parse_room_summary("Studio · 1 bed · 1 bath");
        assert_eq!(stats.bedrooms, Some(0.0));
        assert_eq!(stats.beds, Some(1.0));
    }

    #[test]
    fn half_bath_is_fractional() {
        let stats = parse_room_summary("1 bedroom · 1 bed · 1 half-bath");
        assert_eq!(stats.bathrooms, Some(0.5));
    }

    #[test]
    fn bedroom_count_does_not_leak_into_beds() {
        let stats = parse_room_summary("2 bedrooms");
        assert_eq!(stats.bedrooms, Some(2.0));
        assert_eq!(stats.beds, None);
    }

    #[test]
    fn numeric_id_passes_through() {
        assert_eq!(canonical_id("12345678"), "12345678");
    }

    #[test]
    fn opaque_id_decoded() {
        let encoded = STANDARD.encode("DemandStayListing:987654321");
        assert_eq!(canonical_id(&encoded), "987654321");
    }

    #[test]
    fn undecodable_token_kept_raw() {
        assert_eq!(canonical_id("not-base64!!"), "not-base64!!");
        // Valid base64 but not Kind:digits
        let encoded = STANDARD.encode("hello world");
        assert_eq!(canonical_id(&encoded), encoded);
    }

    #[test]
    fn generic_title_rejected() {
        assert!(is_generic_title("Room in London"));
        assert!(is_generic_title("Rental unit in Paris, France"));
        assert!(!is_generic_title("Stylish loft near Tower Bridge"));
        // Same pattern but past the length cutoff is a real name.
        assert!(!is_generic_title("Apartment in the heart of the old town, with terrace"));
    }

    #[test]
    fn dom_title_chain() {
        let html = r#"<html><head>
            <title>Cozy flat - Marketplace</title>
            <meta property="og:title" content="Garden studio · 2 guests">
        </head><body><h1>Room in London</h1></body></html>"#;
        // h1 is generic, falls through to the document title segment.
        assert_eq!(title_from_dom(html).as_deref(), Some("Cozy flat"));
    }

    #[test]
    fn dom_title_meta_segment_last() {
        let html = r#"<html><head>
            <title>Villa in Nice - Marketplace</title>
            <meta property="og:title" content="Seaside escape · 4 guests · Nice">
        </head><body></body></html>"#;
        assert_eq!(title_from_dom(html).as_deref(), Some("Seaside escape"));
    }

    #[test]
    fn host_scanned_from_dom() {
        let html = r#"<html><body><div><div>
            <a href="/users/show/4242"><img src="https://img/host.jpg"></a>
            <span>Hosted by Marie</span> <span>Superhost</span>
            <span>7 years hosting</span>
        </div></div></body></html>"#;
        let host = host_from_dom(html, 2026);
        assert_eq!(host.id.as_deref(), Some("4242"));
        assert_eq!(host.name.as_deref(), Some("Marie"));
        assert_eq!(host.is_superhost, Some(true));
        assert_eq!(host.years_hosting, Some(7));
        assert_eq!(host.thumbnail.as_deref(), Some("https://img/host.jpg"));
    }

    #[test]
    fn host_tenure_from_joined_year() {
        let html = r#"<html><body><div><div>
            <a href="/users/show/9"></a>
            <span>Hosted by Ken</span> <span>Joined in 2019</span>
        </div></div></body></html>"#;
        let host = host_from_dom(html, 2026);
        assert_eq!(host.years_hosting, Some(7));
    }

    #[test]
    fn no_host_link_yields_empty_host() {
        assert!(host_from_dom("<html><body>Hosted by Ghost</body></html>", 2026).is_empty());
    }
}
