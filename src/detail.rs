//! Detail-page extraction.
//!
//! A prepared detail page (scrolled and expanded by the caller) carries two
//! independently-shaped embedded payloads plus the DOM. Fields merge
//! first-match-wins in that order: primary deferred payload, legacy
//! bootstrap payload, DOM reads. Failures here are non-fatal by design —
//! the worst case is the identity-only record.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::locator::{self, as_f64, as_string, first_with_key, resolve_str};
use crate::normalize::{self, parse_room_summary};
use crate::records::{set_once, Amenity, Coordinates, Host, ListingDetail, Price};
use crate::search;

static SEL_HTML_LANG: Lazy<Selector> = Lazy::new(|| Selector::parse("html[lang]").unwrap());
static SEL_OG_IMAGE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta[property='og:image']").unwrap());
static SEL_OG_DESCRIPTION: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta[property='og:description']").unwrap());

/// Extract one full listing record from a prepared detail page.
///
/// `known_price` is the price carried from the search page; it is
/// substituted when the detail page resolves no price at all. Any internal
/// failure degrades to the identity-only record instead of propagating.
pub fn extract_detail(
    html: &str,
    listing_id: &str,
    url: &str,
    known_price: Option<Price>,
    nights: Option<u32>,
    current_year: i32,
) -> ListingDetail {
    let mut detail = ListingDetail::identity_only(listing_id, url);

    for payload in locator::structured_payloads(html) {
        fill_from_payload(&mut detail, &payload, nights);
    }

    // Sanity filter before the DOM pass: a generic or redirect placeholder
    // is not this listing's title, and must not block the DOM fallback.
    if let Some(title) = &detail.summary.title {
        if normalize::is_placeholder_title(title) || normalize::is_generic_title(title) {
            detail.summary.title = None;
        }
    }

    fill_from_dom(&mut detail, html, current_year);

    if detail.summary.price.amount.is_none() {
        if let Some(price) = known_price {
            detail.summary.price = price;
        }
    }

    detail
}

fn fill_from_payload(detail: &mut ListingDetail, payload: &Value, nights: Option<u32>) {
    let s = &mut detail.summary;

    set_once(
        &mut s.title,
        first_with_key(payload, "listingTitle")
            .and_then(as_string)
            .or_else(|| {
                first_with_key(payload, "sharingConfig")
                    .and_then(|cfg| cfg.get("title"))
                    .and_then(as_string)
            }),
    );

    if s.price.amount.is_none() {
        if let Some(node) = first_with_key(payload, "structuredDisplayPrice") {
            // resolve_price expects the enclosing node, rebuild one level up.
            let wrapper = serde_json::json!({ "structuredDisplayPrice": node });
            let price = search::resolve_price(&wrapper, nights);
            if price.amount.is_some() {
                s.price = price;
            }
        } else if let Some(node) = first_with_key(payload, "pricingQuote") {
            let wrapper = serde_json::json!({ "pricingQuote": node });
            let price = search::resolve_price(&wrapper, nights);
            if price.amount.is_some() {
                s.price = price;
            }
        }
    }

    set_once(&mut s.rating, first_with_key(payload, "overallRating").and_then(as_f64));
    set_once(
        &mut s.reviews_count,
        first_with_key(payload, "reviewsCount")
            .and_then(as_f64)
            .map(|v| v as u32),
    );
    set_once(
        &mut s.room_type,
        first_with_key(payload, "roomTypeCategory")
            .and_then(as_string)
            .or_else(|| first_with_key(payload, "roomType").and_then(as_string)),
    );
    set_once(&mut s.person_capacity, first_with_key(payload, "personCapacity").and_then(as_f64).map(|v| v as u32));
    set_once(&mut s.location, first_with_key(payload, "listingLocation").and_then(as_string));

    set_once(
        &mut detail.description,
        first_with_key(payload, "htmlDescription")
            .and_then(|d| d.get("htmlText"))
            .and_then(as_string)
            .or_else(|| {
                first_with_key(payload, "sectionedDescription")
                    .and_then(|d| d.get("summary"))
                    .and_then(as_string)
            }),
    );
    set_once(&mut detail.sub_description, overview_line(payload));
    set_once(&mut detail.house_rules, house_rules(payload));

    if detail.images.is_empty() {
        detail.images = media_images(payload);
    }
    if detail.amenities.is_empty() {
        detail.amenities = amenities(payload);
    }
    if detail.host.is_none() {
        detail.host = host_card(payload);
    }
    if detail.coordinates.is_none() {
        detail.coordinates = coordinates(payload);
    }

    set_once(&mut detail.locale, resolve_str(payload, &[&["locale"], &["i18n", "locale"]]));
    set_once(
        &mut detail.currency,
        first_with_key(payload, "currency")
            .and_then(as_string)
            .filter(|c| c.len() == 3),
    );

    // The overview line doubles as the capacity source when numeric fields
    // never appeared.
    if let Some(line) = &detail.sub_description {
        let stats = parse_room_summary(line);
        set_once(&mut detail.summary.beds, stats.beds);
        set_once(&mut detail.summary.bedrooms, stats.bedrooms);
        set_once(&mut detail.summary.bathrooms, stats.bathrooms);
        set_once(&mut detail.summary.person_capacity, stats.person_capacity);
    }
}

/// "4 guests · 2 bedrooms · 3 beds · 1 bath" overview line from the
/// section list.
fn overview_line(payload: &Value) -> Option<String> {
    let section = section_by_id_prefix(payload, "OVERVIEW")?;
    let mut parts = Vec::new();
    if let Some(items) = section
        .get("detailItems")
        .or_else(|| section.get("overviewItems"))
        .and_then(Value::as_array)
    {
        for item in items {
            if let Some(title) = item.get("title").and_then(as_string) {
                parts.push(title);
            }
        }
    }
    if parts.is_empty() {
        return section.get("subtitle").and_then(as_string);
    }
    Some(parts.join(" · "))
}

fn house_rules(payload: &Value) -> Option<String> {
    if let Some(rules) = first_with_key(payload, "houseRules").and_then(as_string) {
        return Some(rules);
    }
    let sections = first_with_key(payload, "houseRulesSections").and_then(Value::as_array)?;
    let mut rules = Vec::new();
    for section in sections {
        if let Some(items) = section.get("items").and_then(Value::as_array) {
            for item in items {
                if let Some(title) = item.get("title").and_then(as_string) {
                    rules.push(title);
                }
            }
        }
    }
    (!rules.is_empty()).then(|| rules.join("; "))
}

fn media_images(payload: &Value) -> Vec<String> {
    let Some(items) = first_with_key(payload, "mediaItems").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            item.get("baseUrl")
                .or_else(|| item.get("picture"))
                .and_then(as_string)
        })
        .collect()
}

fn amenities(payload: &Value) -> Vec<Amenity> {
    let Some(groups) = first_with_key(payload, "seeAllAmenitiesGroups").and_then(Value::as_array)
    else {
        return Vec::new();
    };
    let mut amenities = Vec::new();
    for group in groups {
        let Some(items) = group.get("amenities").and_then(Value::as_array) else {
            continue;
        };
        for item in items {
            let Some(title) = item.get("title").and_then(as_string) else {
                continue;
            };
            let available = item
                .get("available")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            amenities.push(Amenity { title, available });
        }
    }
    amenities
}

/// Host card from the "meet your host" section. Field names drift, so every
/// one resolves through alternatives.
fn host_card(payload: &Value) -> Option<Host> {
    let card = first_with_key(payload, "cardData")?;
    let id = resolve_str(card, &[&["userId"], &["id"], &["hostId"]])
        .map(|raw| normalize::canonical_id(&raw));
    let host = Host {
        profile_url: id.as_deref().map(|id| format!("/users/show/{id}")),
        id,
        name: card.get("name").and_then(as_string),
        is_superhost: card.get("isSuperhost").and_then(Value::as_bool),
        years_hosting: card
            .get("timeAsHost")
            .and_then(|t| t.get("years"))
            .and_then(as_f64)
            .map(|v| v as u32),
        thumbnail: resolve_str(
            card,
            &[
                &["profilePictureUrl"],
                &["userProfilePicture", "baseUrl"],
                &["avatarUrl"],
            ],
        ),
    };
    (!host.is_empty()).then_some(host)
}

fn coordinates(payload: &Value) -> Option<Coordinates> {
    if let Some(node) = first_with_key(payload, "listingLat") {
        let latitude = as_f64(node)?;
        let longitude = first_with_key(payload, "listingLng").and_then(as_f64)?;
        return Some(Coordinates { latitude, longitude });
    }
    let coord = first_with_key(payload, "coordinate")?;
    Some(Coordinates {
        latitude: coord.get("latitude").and_then(as_f64)?,
        longitude: coord.get("longitude").and_then(as_f64)?,
    })
}

fn section_by_id_prefix<'a>(payload: &'a Value, prefix: &str) -> Option<&'a Value> {
    let matches = locator::find_matches(payload, &|node| {
        node.get("sectionId")
            .and_then(|v| v.as_str())
            .map(|id| id.starts_with(prefix))
            .unwrap_or(false)
    });
    let node = matches.into_iter().next()?;
    node.get("section").or(Some(node))
}

/// Final DOM pass: fills only what both payloads left unset.
fn fill_from_dom(detail: &mut ListingDetail, html: &str, current_year: i32) {
    set_once(&mut detail.summary.title, normalize::title_from_dom(html));

    let document = Html::parse_document(html);
    if detail.host.as_ref().map(|h| h.is_empty()).unwrap_or(true) {
        let host = normalize::host_from_dom(html, current_year);
        if !host.is_empty() {
            detail.host = Some(host);
        }
    }
    set_once(
        &mut detail.locale,
        document
            .select(&SEL_HTML_LANG)
            .next()
            .and_then(|el| el.value().attr("lang"))
            .map(String::from),
    );
    if detail.images.is_empty() {
        if let Some(og) = document
            .select(&SEL_OG_IMAGE)
            .next()
            .and_then(|el| el.value().attr("content"))
        {
            detail.images.push(og.to_string());
        }
    }
    if detail.sub_description.is_none() {
        set_once(
            &mut detail.sub_description,
            document
                .select(&SEL_OG_DESCRIPTION)
                .next()
                .and_then(|el| el.value().attr("content"))
                .map(String::from),
        );
        if let Some(line) = &detail.sub_description {
            let stats = parse_room_summary(line);
            set_once(&mut detail.summary.beds, stats.beds);
            set_once(&mut detail.summary.bedrooms, stats.bedrooms);
            set_once(&mut detail.summary.bathrooms, stats.bathrooms);
            set_once(&mut detail.summary.person_capacity, stats.person_capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail_page(deferred: &str, bootstrap: Option<&str>, body: &str) -> String {
        let bootstrap = bootstrap
            .map(|b| {
                format!(r#"<script id="__NEXT_DATA__" type="application/json">{b}</script>"#)
            })
            .unwrap_or_default();
        format!(
            r#"<html lang="en"><head>
            <script data-deferred-state="true" type="application/json">{deferred}</script>
            {bootstrap}
            </head><body>{body}</body></html>"#
        )
    }

    #[test]
    fn full_detail_extracted() {
        let deferred = r#"{"niobeClientData":[["PdpQuery:1",{"data":{"presentation":{"stayProductDetailPage":{"sections":{"sections":[
            {"sectionId":"TITLE_DEFAULT","section":{"listingTitle":"Stylish loft near Tower Bridge"}},
            {"sectionId":"OVERVIEW_DEFAULT_V2","section":{"detailItems":[{"title":"4 guests"},{"title":"2 bedrooms"},{"title":"3 beds"},{"title":"1 bath"}]}},
            {"sectionId":"DESCRIPTION_DEFAULT","section":{"htmlDescription":{"htmlText":"A bright loft."}}},
            {"sectionId":"AMENITIES_DEFAULT","section":{"seeAllAmenitiesGroups":[{"amenities":[{"title":"Wifi","available":true},{"title":"Pool","available":false}]}]}},
            {"sectionId":"PHOTO_TOUR_SCROLLABLE_MODAL","section":{"mediaItems":[{"baseUrl":"https://img/a.jpg"},{"baseUrl":"https://img/b.jpg"}]}},
            {"sectionId":"MEET_YOUR_HOST","section":{"cardData":{"name":"Marie","userId":"4242","isSuperhost":true,"timeAsHost":{"years":7},"profilePictureUrl":"https://img/host.jpg"}}},
            {"sectionId":"POLICIES_DEFAULT","section":{"houseRulesSections":[{"items":[{"title":"No smoking"},{"title":"No parties"}]}]}},
            {"sectionId":"BOOK_IT_SIDEBAR","section":{"structuredDisplayPrice":{"primaryLine":{"price":"$140","qualifier":"night"}}}}
        ]},"metadata":{"eventDataLogging":{"listingLat":51.5,"listingLng":-0.07}}}}}}]]}"#;
        let detail = extract_detail(
            &detail_page(deferred, None, ""),
            "123",
            "https://www.airbnb.com/rooms/123",
            None,
            None,
            2026,
        );
        assert_eq!(detail.summary.title.as_deref(), Some("Stylish loft near Tower Bridge"));
        assert_eq!(detail.summary.price.amount.as_deref(), Some("140"));
        assert_eq!(detail.description.as_deref(), Some("A bright loft."));
        assert_eq!(detail.sub_description.as_deref(), Some("4 guests · 2 bedrooms · 3 beds · 1 bath"));
        assert_eq!(detail.summary.person_capacity, Some(4));
        assert_eq!(detail.summary.bedrooms, Some(2.0));
        assert_eq!(detail.images.len(), 2);
        assert_eq!(detail.amenities.len(), 2);
        assert!(!detail.amenities[1].available);
        let host = detail.host.unwrap();
        assert_eq!(host.name.as_deref(), Some("Marie"));
        assert_eq!(host.id.as_deref(), Some("4242"));
        assert_eq!(host.is_superhost, Some(true));
        assert_eq!(host.years_hosting, Some(7));
        let coords = detail.coordinates.unwrap();
        assert!((coords.latitude - 51.5).abs() < f64::EPSILON);
        assert_eq!(detail.house_rules.as_deref(), Some("No smoking; No parties"));
        assert_eq!(detail.locale.as_deref(), Some("en"));
    }

    #[test]
    fn primary_payload_wins_over_bootstrap() {
        let deferred = r#"{"niobeClientData":[["q",{"sections":[{"sectionId":"TITLE_DEFAULT","section":{"listingTitle":"Primary title"}}]}]]}"#;
        let bootstrap = r#"{"props":{"listingTitle":"Bootstrap title","overallRating":4.5}}"#;
        let detail = extract_detail(
            &detail_page(deferred, Some(bootstrap), ""),
            "1",
            "u",
            None,
            None,
            2026,
        );
        assert_eq!(detail.summary.title.as_deref(), Some("Primary title"));
        // The bootstrap payload still fills what the primary one lacked.
        assert_eq!(detail.summary.rating, Some(4.5));
    }

    #[test]
    fn placeholder_title_discarded() {
        let deferred = r#"{"niobeClientData":[["q",{"listingTitle":"Vacation Rentals & Homes"}]]}"#;
        let detail = extract_detail(&detail_page(deferred, None, ""), "1", "u", None, None, 2026);
        assert_eq!(detail.summary.title, None);
    }

    #[test]
    fn known_price_substituted_when_unresolved() {
        let carried = Price {
            amount: Some("99".into()),
            currency: Some("USD".into()),
            label: None,
        };
        let detail = extract_detail(
            "<html><body></body></html>",
            "55",
            "https://x/rooms/55",
            Some(carried),
            None,
            2026,
        );
        assert_eq!(detail.summary.price.amount.as_deref(), Some("99"));
        assert_eq!(detail.summary.id, "55");
    }

    #[test]
    fn bare_page_yields_identity_only() {
        let detail = extract_detail("<html></html>", "7", "https://x/rooms/7", None, None, 2026);
        assert_eq!(detail.summary.id, "7");
        assert_eq!(detail.summary.url, "https://x/rooms/7");
        assert!(detail.summary.title.is_none());
        assert!(detail.images.is_empty());
    }

    #[test]
    fn dom_fallback_fills_missing_fields() {
        let html = r#"<html lang="fr"><head>
            <meta property="og:image" content="https://img/og.jpg">
            <meta property="og:description" content="2 guests · 1 bedroom · 1 bed · 1 bath">
        </head><body>
            <h1>Petite maison au bord de la mer</h1>
            <div><div><a href="/users/show/31"></a><span>Hosted by Luc</span><span>Joined 2020</span></div></div>
        </body></html>"#;
        let detail = extract_detail(html, "9", "u", None, None, 2026);
        assert_eq!(detail.summary.title.as_deref(), Some("Petite maison au bord de la mer"));
        assert_eq!(detail.images, vec!["https://img/og.jpg".to_string()]);
        assert_eq!(detail.locale.as_deref(), Some("fr"));
        assert_eq!(detail.summary.bedrooms, Some(1.0));
        let host = detail.host.unwrap();
        assert_eq!(host.name.as_deref(), Some("Luc"));
        assert_eq!(host.years_hosting, Some(6));
    }
}
