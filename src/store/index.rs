//! # Index
//!
//! The secondary index and range-query engine. Every indexable property of
//! a stored message produces sorted keys in the key-value store; queries
//! seed a range scan from the most selective criterion, post-filter the
//! remaining criteria in memory, union across filters, then sort and
//! paginate.
//!
//! Key families (`\u{0}`-joined, values always the message CID):
//!
//! - `IDX <sortProperty> <encodedSortValue> <messageCid>` — one per sort
//!   property carried by the message; seeds unfiltered scans in sort order.
//! - `EQ <property> <encodedValue> <encodedTimestamp> <messageCid>` — one
//!   per indexed property; seeds equality and range scans.
//! - `MSG <messageCid>` — the message's full index map, for post-filtering
//!   and for removing all of a message's keys on delete.

use serde_json::{Map, Value};

use crate::bad_request;
use crate::error::Result;
use crate::provider::KvStore;
use crate::store::{Cursor, Filter, Matcher, Query, block};
use crate::{Lower, Upper};

const SEP: char = '\u{0}';
const SORT_PROPERTIES: [&str; 3] = ["dateCreated", "datePublished", "messageTimestamp"];

/// The largest integer losslessly representable by the wire's number type.
/// Negative values are offset into this range so they sort before positives.
const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Insert index keys for a message. Replaces any existing keys for the same
/// CID.
///
/// # Errors
///
/// Returns `Error::BadRequest` when no index properties are provided.
pub async fn insert(
    owner: &str, message_cid: &str, indexes: &Map<String, Value>, store: &impl KvStore,
) -> Result<()> {
    if indexes.is_empty() {
        return Err(bad_request!("no index properties provided"));
    }

    // replace existing keys when re-indexing the same message
    delete(owner, message_cid, store).await?;

    for key in build_keys(message_cid, indexes) {
        store.put(owner, &key, message_cid.as_bytes()).await?;
    }
    store.put(owner, &msg_key(message_cid), &block::encode(indexes)?).await?;

    Ok(())
}

/// Remove all index keys for a message. A no-op when the message is not
/// indexed.
pub async fn delete(owner: &str, message_cid: &str, store: &impl KvStore) -> Result<()> {
    let Some(bytes) = store.get(owner, &msg_key(message_cid)).await? else {
        return Ok(());
    };
    let indexes: Map<String, Value> = block::decode(&bytes)?;

    for key in build_keys(message_cid, &indexes) {
        store.delete(owner, &key).await?;
    }
    store.delete(owner, &msg_key(message_cid)).await?;

    Ok(())
}

/// Evaluate a query, returning matching `(message_cid, indexes)` pairs in
/// sort order plus a cursor when the result set was truncated by `limit`.
pub async fn query(
    owner: &str, query: &Query, store: &impl KvStore,
) -> Result<(Vec<(String, Map<String, Value>)>, Option<Cursor>)> {
    let sort_property = query.sort.property();

    // union of each filter's matches, deduplicated by message CID
    let mut matched: Vec<(String, Map<String, Value>)> = vec![];
    for filter in &query.filters {
        for cid in seed_scan(owner, filter, sort_property, store).await? {
            if matched.iter().any(|(existing, _)| existing == &cid) {
                continue;
            }
            let Some(bytes) = store.get(owner, &msg_key(&cid)).await? else {
                continue;
            };
            let indexes: Map<String, Value> = block::decode(&bytes)?;
            if filter.is_match(&indexes) {
                matched.push((cid, indexes));
            }
        }
    }

    // stable sort on (sort value, message CID)
    matched.sort_by(|(cid_a, idx_a), (cid_b, idx_b)| {
        let value_a = idx_a.get(sort_property).map(encode_value).unwrap_or_default();
        let value_b = idx_b.get(sort_property).map(encode_value).unwrap_or_default();
        (value_a, cid_a).cmp(&(value_b, cid_b))
    });
    if !query.sort.is_ascending() {
        matched.reverse();
    }

    // drop entries at or before the cursor
    if let Some(cursor) = query.pagination.as_ref().and_then(|p| p.cursor.as_ref()) {
        let Some(cursor_value) = &cursor.value else {
            return Ok((vec![], None));
        };
        let cursor_key = (encode_value(cursor_value), cursor.message_cid.clone());

        matched.retain(|(cid, indexes)| {
            let value = indexes.get(sort_property).map(encode_value).unwrap_or_default();
            let entry_key = (value, cid.clone());
            if query.sort.is_ascending() { entry_key > cursor_key } else { entry_key < cursor_key }
        });
    }

    // truncate to limit, remembering where the next page starts
    let mut next_cursor = None;
    if let Some(limit) = query.pagination.as_ref().and_then(|p| p.limit) {
        if matched.len() > limit {
            matched.truncate(limit);
            if let Some((cid, indexes)) = matched.last() {
                next_cursor = Some(Cursor {
                    message_cid: cid.clone(),
                    value: indexes.get(sort_property).cloned(),
                });
            }
        }
    }

    Ok((matched, next_cursor))
}

// Properties in descending order of selectivity, used to pick the best
// equality criterion to seed from.
const SELECTIVITY: [&str; 8] = [
    "recordId", "permissionsGrantId", "contextId", "parentId", "attester", "protocolPath",
    "schema", "protocol",
];

// Low-cardinality flags that make poor scan seeds.
const FLAGS: [&str; 4] = ["interface", "method", "archived", "published"];

// Seed a range scan from the filter's most selective criterion: equality
// first, then a one-of set, then a range, falling back to a full scan in
// sort order.
async fn seed_scan(
    owner: &str, filter: &Filter, sort_property: &str, store: &impl KvStore,
) -> Result<Vec<String>> {
    let equality = SELECTIVITY
        .iter()
        .find_map(|p| match filter.criteria.get(*p) {
            Some(Matcher::Equal(value)) => Some((*p, value)),
            _ => None,
        })
        .or_else(|| {
            filter.criteria.iter().find_map(|(p, m)| match m {
                Matcher::Equal(value) if !FLAGS.contains(&p.as_str()) => Some((p.as_str(), value)),
                _ => None,
            })
        });
    if let Some((property, value)) = equality {
        let prefix = format!("EQ{SEP}{property}{SEP}{}{SEP}", encode_value(value));
        return scan(owner, &prefix, &upper_bound(&prefix), store).await;
    }

    let one_of = filter.criteria.iter().find_map(|(p, m)| match m {
        Matcher::OneOf(values) => Some((p, values)),
        _ => None,
    });
    if let Some((property, values)) = one_of {
        let mut cids = vec![];
        for value in values {
            let prefix = format!("EQ{SEP}{property}{SEP}{}{SEP}", encode_value(value));
            cids.extend(scan(owner, &prefix, &upper_bound(&prefix), store).await?);
        }
        return Ok(cids);
    }

    let range = filter.criteria.iter().find_map(|(p, m)| match m {
        Matcher::Range(range) => Some((p, range)),
        _ => None,
    });
    if let Some((property, range)) = range {
        let prefix = format!("EQ{SEP}{property}{SEP}");
        // bounds are loose: the post-filter enforces strictness
        let lower = match &range.lower {
            Some(Lower::Inclusive(value) | Lower::Exclusive(value)) => {
                format!("{prefix}{}", encode_value(value))
            }
            None => prefix.clone(),
        };
        let upper = match &range.upper {
            Some(Upper::Inclusive(value) | Upper::Exclusive(value)) => {
                format!("{prefix}{}{}", encode_value(value), '\u{1}')
            }
            None => upper_bound(&prefix),
        };
        return scan(owner, &lower, &upper, store).await;
    }

    // flags are a last resort before a full scan
    let flag = filter.criteria.iter().find_map(|(p, m)| match m {
        Matcher::Equal(value) => Some((p.as_str(), value)),
        _ => None,
    });
    if let Some((property, value)) = flag {
        let prefix = format!("EQ{SEP}{property}{SEP}{}{SEP}", encode_value(value));
        return scan(owner, &prefix, &upper_bound(&prefix), store).await;
    }

    // no criterion at all: walk the sort index
    let prefix = format!("IDX{SEP}{sort_property}{SEP}");
    scan(owner, &prefix, &upper_bound(&prefix), store).await
}

async fn scan(
    owner: &str, lower: &str, upper: &str, store: &impl KvStore,
) -> Result<Vec<String>> {
    let entries = store.range(owner, lower, upper).await?;
    Ok(entries
        .into_iter()
        .map(|(_, value)| String::from_utf8_lossy(&value).to_string())
        .collect())
}

fn build_keys(message_cid: &str, indexes: &Map<String, Value>) -> Vec<String> {
    let mut keys = vec![];

    for sort_property in SORT_PROPERTIES {
        let Some(sort_value) = indexes.get(sort_property) else {
            continue;
        };
        keys.push(format!(
            "IDX{SEP}{sort_property}{SEP}{}{SEP}{message_cid}",
            encode_value(sort_value)
        ));
    }

    let timestamp = indexes.get("messageTimestamp").map(encode_value).unwrap_or_default();
    for (property, value) in indexes {
        keys.push(format!(
            "EQ{SEP}{property}{SEP}{}{SEP}{timestamp}{SEP}{message_cid}",
            encode_value(value)
        ));
    }

    keys
}

fn msg_key(message_cid: &str) -> String {
    format!("MSG{SEP}{message_cid}")
}

// The exclusive upper bound for a prefix scan: the prefix with its trailing
// separator bumped one code point.
fn upper_bound(prefix: &str) -> String {
    let mut bound = prefix.strip_suffix(SEP).unwrap_or(prefix).to_string();
    bound.push('\u{1}');
    bound
}

/// Encode an index value to a lexicographically sortable string.
///
/// Numbers are fixed-width with a sign prefix (`!` for negatives offset by
/// [`MAX_SAFE_INTEGER`], positives zero-padded to 16 digits), booleans are
/// literal `true`/`false`, strings and dates encode as-is.
pub(crate) fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => encode_number(n),
        Value::Null => String::new(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn encode_number(n: &serde_json::Number) -> String {
    let value = n.as_i64().unwrap_or_else(|| {
        n.as_u64().map_or_else(
            || n.as_f64().unwrap_or_default().trunc() as i64,
            |u| i64::try_from(u).unwrap_or(MAX_SAFE_INTEGER),
        )
    });
    let value = value.clamp(-MAX_SAFE_INTEGER, MAX_SAFE_INTEGER);

    if value < 0 {
        format!("!{:0>16}", MAX_SAFE_INTEGER + value)
    } else {
        format!("{value:0>16}")
    }
}

/// Type-aware equality used by filter matching: a boolean never equals the
/// string spelling of a boolean, numbers compare numerically.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => encode_number(a) == encode_number(b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_encoding_orders() {
        let encoded: Vec<String> = [-25, -1, 0, 1, 10, 1_000_000]
            .iter()
            .map(|n| encode_number(&serde_json::Number::from(*n)))
            .collect();

        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn negative_numbers_sort_before_positive() {
        let neg = encode_number(&serde_json::Number::from(-1));
        let zero = encode_number(&serde_json::Number::from(0));
        assert!(neg.starts_with('!'));
        assert!(neg < zero);
    }

    #[test]
    fn boolean_and_string_distinct() {
        assert!(!values_equal(&Value::Bool(true), &Value::String("true".to_string())));
        assert!(values_equal(&Value::Bool(true), &Value::Bool(true)));
    }

    #[test]
    fn equality_does_not_match_prefix() {
        // the scan bound for `foo` must exclude keys encoding `foobar`
        let prefix = format!("EQ{SEP}schema{SEP}foo{SEP}");
        let upper = upper_bound(&prefix);
        let foobar_key = format!("EQ{SEP}schema{SEP}foobar{SEP}ts{SEP}cid");
        assert!(!(prefix.as_str() <= foobar_key.as_str() && foobar_key.as_str() < upper.as_str()));

        let foo_key = format!("EQ{SEP}schema{SEP}foo{SEP}ts{SEP}cid");
        assert!(prefix.as_str() <= foo_key.as_str() && foo_key.as_str() < upper.as_str());
    }
}
