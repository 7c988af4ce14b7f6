//! Reshaping of trend payloads keyed by timestamps.
//!
//! The periodic trend endpoints key their topics by the period they were reported for,
//! e.g. `{"trends": {"2010-05-14 16:45": [...]}, "as_of": 1273855566}`. Generic decoding
//! cannot see those keys, so the payload is first rewritten into a fixed shape:
//!
//! ```text
//! {"as_of": "<rfc3339>", "trends": [{..., "timestamp": "<rfc3339>"}, ...], "locations": [...]}
//! ```
//!
//! [`reshape`] is the only step that knows about dynamic keys. Everything after it is
//! plain `serde` decoding.

use crate::models::parse_timestamp;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

const TRENDS: &str = "trends";
const AS_OF: &str = "as_of";
const LOCATIONS: &str = "locations";
const TIMESTAMP: &str = "timestamp";

/// Rewrites any known trend payload into the fixed shape.
pub fn reshape(value: Value) -> Value {
    // Location trends arrive as a one-element array.
    let root = match value {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };

    let Value::Object(mut root) = root else {
        return root;
    };

    let as_of = root.remove(AS_OF).and_then(|v| timestamp_value(&v));
    let locations = root.remove(LOCATIONS).unwrap_or(Value::Array(Vec::new()));

    let trends = match root.remove(TRENDS) {
        Some(Value::Object(keyed)) => rehome(keyed),
        Some(Value::Array(items)) => items,
        Some(_) => Vec::new(),
        // Some variants put the dated keys at the top level.
        None => rehome(root),
    };

    let mut shaped = Map::new();
    shaped.insert(AS_OF.to_owned(), as_of.map_or(Value::Null, rfc3339));
    shaped.insert(TRENDS.to_owned(), Value::Array(trends));
    shaped.insert(LOCATIONS.to_owned(), locations);
    Value::Object(shaped)
}

/// Collects the children of every date-bearing key, stamping each with its period.
fn rehome(keyed: Map<String, Value>) -> Vec<Value> {
    let mut trends = Vec::new();
    for (key, children) in keyed {
        let Some(period) = parse_timestamp(&key) else {
            tracing::debug!(key = %key, "Ignoring non-timestamp key in trends payload");
            continue;
        };
        let children = match children {
            Value::Array(items) => items,
            single @ Value::Object(_) => vec![single],
            _ => continue,
        };
        for mut child in children {
            if let Value::Object(fields) = &mut child {
                fields.insert(TIMESTAMP.to_owned(), rfc3339(period));
            }
            trends.push(child);
        }
    }
    trends
}

fn timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

fn rfc3339(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339())
}
