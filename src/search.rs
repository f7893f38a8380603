//! Search-result page extraction: structured pass, DOM-anchor fallback,
//! in-page dedup, and the total-result-count signal.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::locator::{self, as_string, resolve, resolve_f64, resolve_str};
use crate::normalize::{self, parse_price, parse_room_summary};
use crate::records::{set_once, ListingSummary, SearchPageResult};

/// Keys that plausibly carry the query's total result count.
const COUNT_KEYS: &[&str] = &["totalInventoryCount", "totalCount", "resultCount", "totalResults"];

static SEL_ROOM_LINKS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href*='/rooms/']").unwrap());

/// Shape heuristic for a search-result record node. Matched by field
/// presence, not a fixed schema — the payload shape drifts.
fn is_listing_node(node: &Value) -> bool {
    let Some(map) = node.as_object() else {
        return false;
    };
    map.contains_key("demandStayListing")
        || map.contains_key("structuredDisplayPrice")
        || map.contains_key("listingId")
        || map
            .get("listing")
            .map(|l| l.get("id").is_some() || l.get("listingId").is_some())
            .unwrap_or(false)
}

/// Extract one rendered search page.
///
/// Structured matches are deduplicated by id within the page (duplicates
/// counted, dropped), then a DOM-anchor pass over every listing link catches
/// anything the structured pass missed. `total_count` falls back to the
/// number of extracted listings when no count field is found.
pub fn extract_search_page(html: &str, base_url: &str, nights: Option<u32>) -> SearchPageResult {
    let mut result = SearchPageResult::default();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut total_count: Option<u64> = None;

    for payload in locator::structured_payloads(html) {
        for node in locator::find_matches(&payload, &is_listing_node) {
            let Some(summary) = normalize_listing_node(node, base_url, nights) else {
                continue;
            };
            if seen_ids.insert(summary.id.clone()) {
                result.listings.push(summary);
            } else {
                result.duplicate_count += 1;
            }
        }
        if total_count.is_none() {
            total_count = locator::first_count_field(&payload, COUNT_KEYS);
        }
    }

    dom_anchor_pass(html, base_url, &mut seen_ids, &mut result);

    result.total_count = total_count.unwrap_or(result.listings.len() as u64);
    result
}

/// Normalize one structured node into a [`ListingSummary`]. Fields resolve
/// through prioritized path lists, first-match-wins; anything unresolved
/// stays unset.
fn normalize_listing_node(node: &Value, base_url: &str, nights: Option<u32>) -> Option<ListingSummary> {
    let raw_id = resolve_str(
        node,
        &[
            &["demandStayListing", "id"],
            &["listing", "id"],
            &["listing", "listingId"],
            &["listingId"],
            &["id"],
        ],
    )?;
    let id = normalize::canonical_id(&raw_id);
    if id.is_empty() {
        return None;
    }

    let mut summary = ListingSummary {
        id: id.clone(),
        url: format!("{base_url}/rooms/{id}"),
        ..Default::default()
    };

    let title = resolve_str(
        node,
        &[
            &["subtitle"],
            &["nameLocalized", "localizedStringWithTranslationPreference"],
            &["listing", "name"],
            &["name"],
        ],
    )
    .filter(|t| !normalize::is_generic_title(t))
    .or_else(|| {
        resolve_str(node, &[&["title"]]).filter(|t| !normalize::is_generic_title(t))
    });
    set_once(&mut summary.title, title);

    summary.price = resolve_price(node, nights);

    if let Some(localized) = resolve_str(node, &[&["avgRatingLocalized"], &["avgRatingA11yLabel"]]) {
        let (rating, reviews) = parse_rating_localized(&localized);
        set_once(&mut summary.rating, rating);
        set_once(&mut summary.reviews_count, reviews);
    }
    set_once(
        &mut summary.rating,
        resolve_f64(node, &[&["avgRating"], &["listing", "avgRating"], &["listing", "starRating"]]),
    );
    set_once(
        &mut summary.reviews_count,
        resolve_f64(node, &[&["reviewsCount"], &["listing", "reviewsCount"]]).map(|v| v as u32),
    );

    set_once(
        &mut summary.room_type,
        resolve_str(
            node,
            &[
                &["listing", "roomTypeCategory"],
                &["listing", "roomType"],
                &["roomTypeCategory"],
                &["roomType"],
                &["propertyType"],
            ],
        )
        .or_else(|| {
            resolve_str(node, &[&["title"]]).and_then(|t| room_type_from_title(&t))
        }),
    );

    set_once(
        &mut summary.thumbnail,
        first_picture(node).or_else(|| {
            resolve_str(node, &[&["listing", "pictureUrl"], &["pictureUrl"], &["thumbnail"]])
        }),
    );

    set_once(
        &mut summary.beds,
        resolve_f64(node, &[&["listing", "beds"], &["beds"]]),
    );
    set_once(
        &mut summary.bedrooms,
        resolve_f64(node, &[&["listing", "bedrooms"], &["bedrooms"]]),
    );
    set_once(
        &mut summary.bathrooms,
        resolve_f64(node, &[&["listing", "bathrooms"], &["bathrooms"]]),
    );
    set_once(
        &mut summary.person_capacity,
        resolve_f64(node, &[&["listing", "personCapacity"], &["personCapacity"], &["maxGuests"]])
            .map(|v| v as u32),
    );

    // Compact "2 bedrooms · 3 beds · 1 bath" lines fill whatever the
    // structured numeric fields left unset.
    let stats = parse_room_summary(&structured_content_text(node));
    set_once(&mut summary.beds, stats.beds);
    set_once(&mut summary.bedrooms, stats.bedrooms);
    set_once(&mut summary.bathrooms, stats.bathrooms);
    set_once(&mut summary.person_capacity, stats.person_capacity);

    set_once(
        &mut summary.location,
        resolve_str(
            node,
            &[
                &["listing", "city"],
                &["listing", "publicAddress"],
                &["city"],
                &["localizedCityName"],
            ],
        )
        .or_else(|| {
            resolve_str(node, &[&["title"]]).and_then(|t| location_from_title(&t))
        }),
    );

    Some(summary)
}

pub(crate) fn resolve_price(node: &Value, nights: Option<u32>) -> crate::records::Price {
    // Numeric amount first: pricingQuote carries a clean per-night value.
    if let Some(amount) = resolve_f64(node, &[&["pricingQuote", "price", "amount"]]) {
        let currency = resolve_str(
            node,
            &[
                &["pricingQuote", "price", "currency"],
                &["pricingQuote", "currency"],
            ],
        );
        return crate::records::Price {
            amount: Some(format_numeric_amount(amount)),
            currency,
            label: None,
        };
    }

    let qualifier = resolve_str(
        node,
        &[
            &["structuredDisplayPrice", "primaryLine", "qualifier"],
            &["pricingQuote", "structuredStayDisplayPrice", "primaryLine", "qualifier"],
        ],
    );
    let display = resolve_str(
        node,
        &[
            &["structuredDisplayPrice", "primaryLine", "price"],
            &["structuredDisplayPrice", "primaryLine", "discountedPrice"],
            &["pricingQuote", "structuredStayDisplayPrice", "primaryLine", "price"],
            &["price"],
            &["pricePerNight"],
        ],
    );
    let Some(display) = display else {
        return crate::records::Price::default();
    };

    // The qualifier ("night", "for 6 nights", "total") decides whether the
    // display amount needs dividing; feed it through with the price text.
    let combined = match qualifier {
        Some(q) => format!("{display} {q}"),
        None => display,
    };
    parse_price(&combined, nights)
}

fn format_numeric_amount(value: f64) -> String {
    if (value - value.round()).abs() < 1e-9 {
        format!("{}", value.round() as i64)
    } else {
        format!("{value}")
    }
}

/// Parse "4.98 (126)" style localized rating strings. "New" yields neither.
fn parse_rating_localized(raw: &str) -> (Option<f64>, Option<u32>) {
    let rating = raw.split([' ', '(']).next().and_then(|r| r.parse::<f64>().ok());
    let reviews = raw
        .split('(')
        .nth(1)
        .and_then(|part| part.trim_end_matches(')').parse::<u32>().ok());
    (rating, reviews)
}

fn first_picture(node: &Value) -> Option<String> {
    resolve(node, &[&["contextualPictures"], &["listing", "contextualPictures"]])
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .and_then(|pic| pic.get("picture"))
        .and_then(as_string)
}

fn structured_content_text(node: &Value) -> String {
    let mut parts = Vec::new();
    for path in [&["structuredContent", "primaryLine"], &["structuredContent", "secondaryLine"]] {
        if let Some(items) = resolve(node, &[path]).and_then(Value::as_array) {
            for item in items {
                if let Some(body) = item.get("body").and_then(as_string) {
                    parts.push(body);
                }
            }
        }
    }
    parts.join(" · ")
}

/// "Room in London" → "London"; used only when no structured location field
/// resolved.
fn location_from_title(title: &str) -> Option<String> {
    title
        .rfind(" in ")
        .map(|idx| title[idx + 4..].trim().to_string())
        .filter(|loc| !loc.is_empty())
}

fn room_type_from_title(title: &str) -> Option<String> {
    let head = title.split(" in ").next()?.trim();
    (!head.is_empty() && head.len() < 40 && normalize::is_generic_title(title))
        .then(|| head.to_string())
}

/// DOM fallback: every listing link on the page, deduplicated against the
/// structured pass with the same duplicate accounting.
fn dom_anchor_pass(
    html: &str,
    base_url: &str,
    seen_ids: &mut HashSet<String>,
    result: &mut SearchPageResult,
) {
    let document = Html::parse_document(html);
    for link in document.select(&SEL_ROOM_LINKS) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(id) = listing_id_from_href(href) else {
            continue;
        };
        if !seen_ids.insert(id.clone()) {
            result.duplicate_count += 1;
            continue;
        }
        let title = link
            .value()
            .attr("aria-label")
            .map(String::from)
            .or_else(|| {
                let text = link.text().collect::<String>().trim().to_string();
                (!text.is_empty()).then_some(text)
            })
            .filter(|t| !normalize::is_generic_title(t));
        result.listings.push(ListingSummary {
            id: id.clone(),
            url: format!("{base_url}/rooms/{id}"),
            title,
            ..Default::default()
        });
    }
}

pub fn listing_id_from_href(href: &str) -> Option<String> {
    let after = href.split("/rooms/").nth(1)?;
    let token = after
        .split(['?', '#', '/'])
        .next()
        .filter(|t| !t.is_empty())?;
    let id = normalize::canonical_id(token);
    id.chars().all(|c| c.is_ascii_digit()).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn page(script: &str) -> String {
        format!(
            r#"<html><head><script data-deferred-state="true" type="application/json">{script}</script></head><body></body></html>"#
        )
    }

    #[test]
    fn structured_pass_extracts_listing() {
        let encoded = STANDARD.encode("DemandStayListing:123456789");
        let html = page(&format!(
            r#"{{"niobeClientData":[["StaysSearch:q",{{"data":{{"results":{{
                "searchResults":[{{
                    "title":"Room in Paris",
                    "subtitle":"Cozy Studio near the Eiffel Tower",
                    "avgRatingLocalized":"4.9 (42)",
                    "demandStayListing":{{"id":"{encoded}"}},
                    "structuredDisplayPrice":{{"primaryLine":{{"price":"€ 85","qualifier":"night"}}}},
                    "contextualPictures":[{{"picture":"https://img/1.jpg"}}],
                    "structuredContent":{{"primaryLine":[{{"body":"2 bedrooms · 3 beds · 1 bath"}}]}}
                }}],
                "totalInventoryCount": 321
            }}}}}}]]}}"#
        ));
        let result = extract_search_page(&html, "https://www.airbnb.com", None);
        assert_eq!(result.listings.len(), 1);
        let listing = &result.listings[0];
        assert_eq!(listing.id, "123456789");
        assert_eq!(listing.title.as_deref(), Some("Cozy Studio near the Eiffel Tower"));
        assert_eq!(listing.price.amount.as_deref(), Some("85"));
        assert_eq!(listing.price.currency.as_deref(), Some("EUR"));
        assert_eq!(listing.rating, Some(4.9));
        assert_eq!(listing.reviews_count, Some(42));
        assert_eq!(listing.bedrooms, Some(2.0));
        assert_eq!(listing.beds, Some(3.0));
        assert_eq!(listing.location.as_deref(), Some("Paris"));
        assert_eq!(result.total_count, 321);
        assert_eq!(result.duplicate_count, 0);
    }

    #[test]
    fn in_page_duplicates_counted_and_dropped() {
        let html = page(
            r#"{"niobeClientData":[["q",{"results":[
                {"listing":{"id":"77","name":"First"},"structuredDisplayPrice":{"primaryLine":{"price":"$100"}}},
                {"listing":{"id":"77","name":"Again"},"structuredDisplayPrice":{"primaryLine":{"price":"$100"}}}
            ]}]]}"#,
        );
        let result = extract_search_page(&html, "https://x", None);
        assert_eq!(result.listings.len(), 1);
        assert_eq!(result.duplicate_count, 1);
    }

    #[test]
    fn dom_anchor_fallback_catches_missed_listings() {
        let html = r#"<html><body>
            <a href="/rooms/111?adults=2" aria-label="Stylish loft near Tower Bridge">x</a>
            <a href="/rooms/222">Second listing</a>
            <a href="/rooms/111">dup</a>
        </body></html>"#;
        let result = extract_search_page(html, "https://www.airbnb.com", None);
        assert_eq!(result.listings.len(), 2);
        assert_eq!(result.duplicate_count, 1);
        assert_eq!(result.listings[0].id, "111");
        assert_eq!(
            result.listings[0].title.as_deref(),
            Some("Stylish loft near Tower Bridge")
        );
        assert_eq!(result.listings[0].url, "https://www.airbnb.com/rooms/111");
        // No count field anywhere: falls back to the extracted batch size.
        assert_eq!(result.total_count, 2);
    }

    #[test]
    fn total_price_divided_by_stay_length() {
        let html = page(
            r#"{"niobeClientData":[["q",{"results":[
                {"listing":{"id":"5"},"structuredDisplayPrice":{"primaryLine":{"price":"$900 total","qualifier":"for 6 nights"}}}
            ]}]]}"#,
        );
        let result = extract_search_page(&html, "https://x", Some(6));
        assert_eq!(result.listings[0].price.amount.as_deref(), Some("150"));
    }

    #[test]
    fn generic_title_discarded() {
        let html = page(
            r#"{"niobeClientData":[["q",{"results":[
                {"listing":{"id":"9","name":"Room in London"},"structuredDisplayPrice":{"primaryLine":{"price":"$50"}},"title":"Room in London"}
            ]}]]}"#,
        );
        let result = extract_search_page(&html, "https://x", None);
        assert_eq!(result.listings[0].title, None);
        // The generic pattern still yields room type and location.
        assert_eq!(result.listings[0].room_type.as_deref(), Some("Room"));
        assert_eq!(result.listings[0].location.as_deref(), Some("London"));
    }

    #[test]
    fn numeric_pricing_quote_preferred() {
        let html = page(
            r#"{"niobeClientData":[["q",{"results":[
                {"listing":{"id":"3"},"pricingQuote":{"price":{"amount":120.0,"currency":"USD"}},"structuredDisplayPrice":{"primaryLine":{"price":"$999"}}}
            ]}]]}"#,
        );
        let result = extract_search_page(&html, "https://x", None);
        assert_eq!(result.listings[0].price.amount.as_deref(), Some("120"));
        assert_eq!(result.listings[0].price.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn listing_id_from_href_variants() {
        assert_eq!(listing_id_from_href("/rooms/12345?a=1"), Some("12345".into()));
        assert_eq!(listing_id_from_href("https://x/rooms/67/"), Some("67".into()));
        assert_eq!(listing_id_from_href("/search"), None);
        assert_eq!(listing_id_from_href("/rooms/plus"), None);
    }
}
