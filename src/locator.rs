//! Schema-less search over embedded JSON payloads.
//!
//! The site ships its page state as JSON inside script tags. The shape is
//! undocumented and changes frequently, so nothing here deserializes into a
//! fixed schema: nodes are matched by field presence and fields are resolved
//! through ordered lists of alternative property paths, first-match-wins.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::Value;

/// Sentinel key wrapping per-query payload entries in deferred-state scripts.
pub const SENTINEL_KEY: &str = "niobeClientData";

/// Bound on tree-walk recursion. Payload trees are ~8 levels deep in
/// practice; the cap bounds cost and guards against pathological nesting.
pub const MAX_WALK_DEPTH: usize = 14;

/// Bound on total nodes visited per walk.
const MAX_VISITED_NODES: usize = 200_000;

static SEL_DEFERRED_SCRIPTS: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("script[data-deferred-state], script[id^='data-deferred-state']").unwrap()
});
static SEL_BOOTSTRAP_SCRIPT: Lazy<Selector> =
    Lazy::new(|| Selector::parse("script#__NEXT_DATA__").unwrap());

/// Collect every parseable structured payload from a rendered page, primary
/// deferred-state payloads first, then the legacy bootstrap block.
///
/// Deferred-state scripts wrap their data in `[query_key, payload]` pairs
/// under the sentinel key; those are unwrapped to the payload. Malformed
/// JSON in one script is skipped. An empty result is a normal signal to
/// fall back to DOM reads, not an error.
pub fn structured_payloads(html: &str) -> Vec<Value> {
    let document = Html::parse_document(html);
    let mut payloads = Vec::new();

    for script in document
        .select(&SEL_DEFERRED_SCRIPTS)
        .chain(document.select(&SEL_BOOTSTRAP_SCRIPT))
    {
        let text = script.text().collect::<String>();
        let parsed: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => continue,
        };

        match parsed.get(SENTINEL_KEY).and_then(Value::as_array) {
            Some(entries) => {
                for entry in entries {
                    if let Some(inner) = entry.as_array().and_then(|pair| pair.get(1)) {
                        payloads.push(inner.clone());
                    }
                }
            }
            None => payloads.push(parsed),
        }
    }

    payloads
}

/// Depth-first walk collecting every node the predicate accepts. Children of
/// an accepted node are not descended into — a record node never nests
/// another record of the same shape.
pub fn find_matches<'a>(root: &'a Value, is_match: &dyn Fn(&Value) -> bool) -> Vec<&'a Value> {
    let mut matches = Vec::new();
    let mut visited = 0usize;
    walk(root, is_match, 0, &mut visited, &mut matches);
    matches
}

fn walk<'a>(
    node: &'a Value,
    is_match: &dyn Fn(&Value) -> bool,
    depth: usize,
    visited: &mut usize,
    matches: &mut Vec<&'a Value>,
) {
    if depth > MAX_WALK_DEPTH || *visited > MAX_VISITED_NODES {
        return;
    }
    *visited += 1;

    if is_match(node) {
        matches.push(node);
        return;
    }

    match node {
        Value::Array(items) => {
            for item in items {
                walk(item, is_match, depth + 1, visited, matches);
            }
        }
        Value::Object(map) => {
            for value in map.values() {
                walk(value, is_match, depth + 1, visited, matches);
            }
        }
        _ => {}
    }
}

/// Resolve a field through an ordered list of alternative property paths.
/// The first path yielding a non-null value wins.
pub fn resolve<'a>(node: &'a Value, paths: &[&[&str]]) -> Option<&'a Value> {
    for path in paths {
        let mut current = node;
        let mut hit = true;
        for key in *path {
            match current.get(key) {
                Some(next) => current = next,
                None => {
                    hit = false;
                    break;
                }
            }
        }
        if hit && !current.is_null() {
            return Some(current);
        }
    }
    None
}

pub fn resolve_str(node: &Value, paths: &[&[&str]]) -> Option<String> {
    resolve(node, paths).and_then(as_string)
}

pub fn resolve_f64(node: &Value, paths: &[&[&str]]) -> Option<f64> {
    resolve(node, paths).and_then(as_f64)
}

/// String coercion: accepts JSON strings and numbers (ids come as either).
pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric coercion: accepts JSON numbers and numeric strings.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// First node carrying the given key, depth-first and depth-limited.
/// Returns the key's value. The duck-typed complement to [`resolve`]: use it
/// when the enclosing structure is unknown but the field name is stable.
pub fn first_with_key<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    find_by_key(root, key, 0)
}

fn find_by_key<'a>(node: &'a Value, key: &str, depth: usize) -> Option<&'a Value> {
    if depth > MAX_WALK_DEPTH {
        return None;
    }
    match node {
        Value::Object(map) => {
            if let Some(value) = map.get(key) {
                if !value.is_null() {
                    return Some(value);
                }
            }
            map.values().find_map(|v| find_by_key(v, key, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| find_by_key(v, key, depth + 1)),
        _ => None,
    }
}

/// First plausible result-count field in the tree, depth-limited and
/// short-circuited on the first hit.
pub fn first_count_field(root: &Value, keys: &[&str]) -> Option<u64> {
    find_count(root, keys, 0)
}

fn find_count(node: &Value, keys: &[&str], depth: usize) -> Option<u64> {
    if depth > MAX_WALK_DEPTH {
        return None;
    }
    match node {
        Value::Object(map) => {
            for key in keys {
                if let Some(count) = map.get(*key).and_then(as_f64) {
                    if count >= 0.0 && count < 10_000_000.0 {
                        return Some(count as u64);
                    }
                }
            }
            map.values().find_map(|v| find_count(v, keys, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| find_count(v, keys, depth + 1)),
        _ => None,
    }
}
