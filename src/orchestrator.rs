//! Crawl state machine: search-page scheduling, cross-shard dedup, the
//! two-tier price filter, pagination fallbacks, and billing triggers.
//!
//! Two task kinds flow through the queue. A search task visits one search
//! page of one price shard, filters and claims its listings, and decides
//! what runs next (detail tasks, child shards, or the next page). A detail
//! task visits one listing page and emits the merged record. Only a
//! metering failure aborts the run; everything else is scoped to its task.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Datelike;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};

use crate::browser::{self, PageSession};
use crate::config::{CrawlInput, BASE_URL};
use crate::error::CrawlError;
use crate::metering::{
    Meter, EVENT_DETAIL_EXTRAS, EVENT_DETAIL_HOST, EVENT_DETAIL_IMAGES, EVENT_DETAIL_REVIEWS,
    EVENT_DUPLICATE, EVENT_LISTING_PUSHED, EVENT_SKIPPED,
};
use crate::queue::{CrawlTask, TaskLabel, TaskPayload, TaskQueue};
use crate::records::{ListingSummary, ShardTask};
use crate::shard;
use crate::sink::Sink;
use crate::state::CrawlState;
use crate::{detail, search};

static SEL_NEXT_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[aria-label='Next'], a[aria-label='Next page']").unwrap());

const NEXT_CONTROL_SELECTOR: &str =
    "a[aria-label='Next'], button[aria-label='Next'], button[aria-label='Next page']";

/// Price-filter outcome for one listing against the global window and the
/// current shard's window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceDecision {
    Keep,
    /// Inside the global window but outside the shard that surfaced it.
    /// Kept anyway: the listing would otherwise cost a second visit from
    /// its home shard.
    KeepCrossShard,
    Skip,
}

pub struct Orchestrator {
    input: CrawlInput,
    queue: Arc<TaskQueue>,
    state: Arc<CrawlState>,
    meter: Arc<dyn Meter>,
    sink: Arc<dyn Sink>,
    nights: Option<u32>,
    current_year: i32,
}

impl Orchestrator {
    pub fn new(
        input: CrawlInput,
        queue: Arc<TaskQueue>,
        state: Arc<CrawlState>,
        meter: Arc<dyn Meter>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        let nights = input.nights();
        Orchestrator {
            input,
            queue,
            state,
            meter,
            sink,
            nights,
            current_year: chrono::Utc::now().year(),
        }
    }

    /// Fan the configured queries out into initial search tasks, one per
    /// price shard when sharding applies, and enqueue direct start URLs
    /// as-is under an unbounded shard.
    pub fn seed_initial_tasks(&self, shard_step: u32) {
        let min = self.input.min_price.unwrap_or(0.0) as u32;
        let shards: Vec<ShardTask> = match (self.input.enable_price_sharding, self.input.max_price) {
            (true, Some(max)) => shard::split_range(min, max as u32, shard_step)
                .into_iter()
                .map(|(lo, hi)| ShardTask::new(lo, hi))
                .collect(),
            (_, Some(max)) => vec![ShardTask::new(min, max as u32)],
            (_, None) => vec![ShardTask::unbounded(min)],
        };
        tracing::info!(
            queries = self.input.location_queries.len(),
            start_urls = self.input.start_urls.len(),
            shards = shards.len(),
            "seeding crawl"
        );

        for query in &self.input.location_queries {
            for shard in &shards {
                self.enqueue_search(self.input.search_url(query, shard), shard.clone());
            }
        }
        for url in &self.input.start_urls {
            let shard = match self.input.max_price {
                Some(max) => ShardTask::new(min, max as u32),
                None => ShardTask::unbounded(min),
            };
            self.enqueue_search(force_nightly_pricing(url), shard);
        }
    }

    /// Run one dequeued task to completion. Returns an error only for
    /// failures the worker must act on; task-scoped extraction problems are
    /// absorbed here.
    pub fn process_task(&self, session: &dyn PageSession, task: CrawlTask) -> Result<(), CrawlError> {
        match task.payload {
            TaskPayload::Search(shard) => self.run_search(session, &task.url, shard),
            TaskPayload::Detail { summary } => self.run_detail(session, &task.url, summary),
        }
    }

    fn run_search(
        &self,
        session: &dyn PageSession,
        url: &str,
        shard: ShardTask,
    ) -> Result<(), CrawlError> {
        if self.state.target_met(self.input.target()) {
            return Ok(());
        }
        tracing::info!(%url, min = shard.min_price, max = shard.max_price, "search page");

        let html = self.load_page(session, url, "search")?;
        let page = search::extract_search_page(&html, BASE_URL, self.nights);
        tracing::info!(
            listings = page.listings.len(),
            total = page.total_count,
            duplicates = page.duplicate_count,
            "search page extracted"
        );

        self.meter.charge(EVENT_DUPLICATE, page.duplicate_count)?;

        // Truncated shard: abandon this page entirely and recurse into two
        // narrower windows.
        if shard::should_bisect(&shard, page.total_count) {
            let (left, right) = shard::bisect(&shard);
            tracing::info!(
                total = page.total_count,
                left_max = left.max_price,
                right_min = right.min_price,
                "shard truncated, bisecting"
            );
            self.enqueue_search(self.shard_url(url, &left), left);
            self.enqueue_search(self.shard_url(url, &right), right);
            return Ok(());
        }

        if page.listings.is_empty() {
            tracing::warn!(%url, "zero-listing page, dead end");
            session.save_debug_snapshot("search_empty");
            return Ok(());
        }

        let mut skipped = 0u64;
        for summary in &page.listings {
            if self.state.target_met(self.input.target()) {
                break;
            }
            if self.state.is_seen(&summary.id) {
                skipped += 1;
                continue;
            }
            match self.price_decision(summary, &shard) {
                PriceDecision::Skip => {
                    skipped += 1;
                    continue;
                }
                PriceDecision::KeepCrossShard => {
                    tracing::debug!(id = %summary.id, "kept cross-shard listing");
                }
                PriceDecision::Keep => {}
            }
            // Reserve the id before any further work so a concurrent task
            // from an overlapping shard cannot take it too.
            if !self.state.claim(&summary.id) {
                skipped += 1;
                continue;
            }
            self.state.record_scraped();

            if self.input.fast_mode {
                self.emit(serde_json::json!(summary))?;
            } else {
                self.queue.enqueue(
                    CrawlTask {
                        url: self.input.detail_url(&summary.id),
                        label: TaskLabel::Detail,
                        payload: TaskPayload::Detail { summary: summary.clone() },
                    },
                    true,
                );
            }
        }
        self.meter.charge(EVENT_SKIPPED, skipped)?;

        if !self.state.target_met(self.input.target()) {
            let page_items = page.listings.len() as u64 + page.duplicate_count;
            self.paginate(session, url, &html, shard, page_items);
        }
        Ok(())
    }

    /// Three-way pagination fallback: next-link href, next-control click,
    /// then opaque-cursor synthesis. Exhausting all three ends the branch
    /// silently.
    fn paginate(
        &self,
        session: &dyn PageSession,
        url: &str,
        html: &str,
        shard: ShardTask,
        page_items: u64,
    ) {
        let document = Html::parse_document(html);
        if let Some(href) = document
            .select(&SEL_NEXT_LINK)
            .next()
            .and_then(|el| el.value().attr("href"))
        {
            let next = force_nightly_pricing(&absolute_url(href));
            tracing::debug!(%next, "pagination via next link");
            self.enqueue_search(next, shard);
            return;
        }

        match session.click_and_wait(NEXT_CONTROL_SELECTOR) {
            Ok(true) => {
                let next = session.current_url();
                tracing::debug!(%next, "pagination via next control");
                self.enqueue_search(next, shard);
                return;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(error = %err, "next-control activation failed");
            }
        }

        match synthesize_cursor(get_query_param(url, "cursor").as_deref(), page_items) {
            Some(cursor) => {
                let next = set_query_param(url, "cursor", &cursor);
                tracing::debug!(%next, "pagination via synthesized cursor");
                self.enqueue_search(next, shard);
            }
            None => {
                tracing::debug!(%url, "pagination exhausted");
            }
        }
    }

    fn run_detail(
        &self,
        session: &dyn PageSession,
        url: &str,
        summary: ListingSummary,
    ) -> Result<(), CrawlError> {
        if summary.id.is_empty() {
            return Ok(());
        }
        if self.state.push_target_met(self.input.target()) {
            return Ok(());
        }

        let html = match self.load_page(session, url, "detail") {
            Ok(html) => {
                session.prepare_detail_page();
                match session.content() {
                    Ok(prepared) => prepared,
                    Err(_) => html,
                }
            }
            Err(CrawlError::Metering(msg)) => return Err(CrawlError::Metering(msg)),
            Err(err) => {
                // Detail failures never abort the crawl; emit what the
                // search page knew.
                tracing::warn!(id = %summary.id, error = %err, "detail page unavailable");
                String::new()
            }
        };

        let known_price = (!summary.price.is_empty()).then(|| summary.price.clone());
        let mut record =
            detail::extract_detail(&html, &summary.id, url, known_price, self.nights, self.current_year);
        record.fill_from_summary(&summary);

        let value = self.assemble_detail(record);
        if self.emit(value)? {
            // Each enrichment category bills per enabled flag. Reviews have
            // no extra payload of their own; the rating and review count
            // ride on the base record whether or not the flag is set.
            self.meter.charge(EVENT_DETAIL_IMAGES, self.input.enrichment.images as u64)?;
            self.meter.charge(EVENT_DETAIL_REVIEWS, self.input.enrichment.reviews as u64)?;
            self.meter.charge(EVENT_DETAIL_EXTRAS, self.input.enrichment.details as u64)?;
            self.meter.charge(EVENT_DETAIL_HOST, self.input.enrichment.host_details as u64)?;
        }
        Ok(())
    }

    /// Enrichment-gated output assembly. Each category is attached only when
    /// its flag is enabled; routing data never reaches the record.
    fn assemble_detail(&self, record: crate::records::ListingDetail) -> serde_json::Value {
        let mut value = serde_json::json!(record);
        let Some(map) = value.as_object_mut() else {
            return value;
        };
        if !self.input.enrichment.images {
            map.remove("images");
        }
        if !self.input.enrichment.details {
            map.remove("description");
            map.remove("sub_description");
            map.remove("house_rules");
            map.remove("amenities");
        }
        if !self.input.enrichment.host_details {
            map.remove("host");
        }
        value
    }

    /// Emit one record and bill it. A sink failure drops the record with a
    /// warning and nothing is billed; the billing failure is the fatal one.
    /// Returns whether the record actually went out.
    fn emit(&self, value: serde_json::Value) -> Result<bool, CrawlError> {
        if let Err(err) = self.sink.push(&value) {
            tracing::warn!(error = %err, "record dropped, sink push failed");
            return Ok(false);
        }
        self.meter.charge(EVENT_LISTING_PUSHED, 1)?;
        self.state.record_pushed();
        Ok(true)
    }

    /// Navigate and read one page, recovering once from a block challenge by
    /// rotating the session. Navigation errors are tolerated: the page is
    /// read anyway and extraction decides what it got.
    fn load_page(
        &self,
        session: &dyn PageSession,
        url: &str,
        tag: &str,
    ) -> Result<String, CrawlError> {
        for attempt in 0..2 {
            if let Err(err) = session.navigate(url) {
                tracing::warn!(%url, error = %err, "navigation failed, reading content anyway");
            }
            let html = session
                .content()
                .map_err(|err| CrawlError::Navigation(err.to_string()))?;
            if !browser::looks_blocked(&html) {
                return Ok(html);
            }
            if attempt == 0 {
                tracing::warn!(%url, "block challenge detected, rotating session");
                session.save_debug_snapshot(&format!("blocked_{tag}"));
                session
                    .rotate()
                    .map_err(|err| CrawlError::Navigation(err.to_string()))?;
            }
        }
        Err(CrawlError::Blocked)
    }

    /// Two-tier filter: the global window is authoritative, the shard window
    /// only distinguishes a cross-shard keep. An unknown price is kept — the
    /// detail page may still resolve one.
    pub fn price_decision(&self, summary: &ListingSummary, shard: &ShardTask) -> PriceDecision {
        let Some(amount) = summary.price.amount_f64() else {
            return PriceDecision::Keep;
        };
        if self.input.min_price.map(|min| amount < min).unwrap_or(false)
            || self.input.max_price.map(|max| amount > max).unwrap_or(false)
        {
            return PriceDecision::Skip;
        }
        if amount < shard.min_price as f64 || amount > shard.max_price as f64 {
            return PriceDecision::KeepCrossShard;
        }
        PriceDecision::Keep
    }

    fn enqueue_search(&self, url: String, shard: ShardTask) {
        self.queue.enqueue(
            CrawlTask { url, label: TaskLabel::Search, payload: TaskPayload::Search(shard) },
            false,
        );
    }

    /// Current URL rewritten to a child shard's window, pagination reset.
    fn shard_url(&self, url: &str, shard: &ShardTask) -> String {
        let url = remove_query_param(url, "cursor");
        let url = set_query_param(&url, "price_min", &shard.min_price.to_string());
        set_query_param(&url, "price_max", &shard.max_price.to_string())
    }
}

/// Synthesized pagination cursor: the decoded item offset (default 0 when
/// the current cursor is absent or undecodable) advanced by the page's item
/// count, re-encoded in the site's base64-JSON shape.
pub(crate) fn synthesize_cursor(current: Option<&str>, page_items: u64) -> Option<String> {
    if page_items == 0 {
        return None;
    }
    let offset = current
        .and_then(|c| BASE64.decode(c).ok())
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
        .and_then(|v| v.get("items_offset").and_then(serde_json::Value::as_u64))
        .unwrap_or(0);
    let next = serde_json::json!({
        "section_offset": 0,
        "items_offset": offset + page_items,
        "version": 1,
    });
    Some(BASE64.encode(serde_json::to_vec(&next).ok()?))
}

/// Rewrite a pagination href so prices stay per-night across pages.
pub(crate) fn force_nightly_pricing(url: &str) -> String {
    set_query_param(url, "price_filter_input_type", "0")
}

fn absolute_url(href: &str) -> String {
    if href.starts_with('/') {
        format!("{BASE_URL}{href}")
    } else {
        href.to_string()
    }
}

pub(crate) fn get_query_param(url: &str, key: &str) -> Option<String> {
    let query = url.split('?').nth(1)?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(key) {
            return parts.next().map(|v| {
                urlencoding::decode(v).map(|d| d.into_owned()).unwrap_or_else(|_| v.to_string())
            });
        }
    }
    None
}

pub(crate) fn set_query_param(url: &str, key: &str, value: &str) -> String {
    let encoded = urlencoding::encode(value).into_owned();
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, query),
        None => return format!("{url}?{key}={encoded}"),
    };
    let mut pairs: Vec<String> = Vec::new();
    let mut replaced = false;
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        if pair.splitn(2, '=').next() == Some(key) {
            pairs.push(format!("{key}={encoded}"));
            replaced = true;
        } else {
            pairs.push(pair.to_string());
        }
    }
    if !replaced {
        pairs.push(format!("{key}={encoded}"));
    }
    format!("{base}?{}", pairs.join("&"))
}

pub(crate) fn remove_query_param(url: &str, key: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, query),
        None => return url.to_string(),
    };
    let pairs: Vec<&str> = query
        .split('&')
        .filter(|p| !p.is_empty() && p.splitn(2, '=').next() != Some(key))
        .collect();
    if pairs.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", pairs.join("&"))
    }
}
