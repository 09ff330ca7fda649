//! Tolerant decoding of the engine's `--json` search output.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

const LIST_KEYS: &[&str] = &["results", "items", "data"];
const PATH_KEYS: &[&str] = &["path", "filepath", "file"];
const DOC_ID_KEYS: &[&str] = &["docid", "doc_id", "id"];
const SNIPPET_KEYS: &[&str] = &["snippet", "text", "content", "title"];
const SCORE_KEY: &str = "score";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Decodes search records. Malformed output yields no records rather
/// than an error.
pub fn parse_search_results(output: &[u8]) -> Vec<SearchResult> {
    let text = String::from_utf8_lossy(output);
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let Ok(root) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };
    extract_items(&root)
        .iter()
        .filter_map(Value::as_object)
        .filter_map(parse_record)
        .collect()
}

fn extract_items(root: &Value) -> &[Value] {
    match root {
        Value::Array(items) => items,
        Value::Object(map) => LIST_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    }
}

fn parse_record(record: &Map<String, Value>) -> Option<SearchResult> {
    let path = first_text(record, PATH_KEYS);
    let doc_id = first_text(record, DOC_ID_KEYS);
    if path.is_none() && doc_id.is_none() {
        return None;
    }
    Some(SearchResult {
        path,
        doc_id,
        score: record.get(SCORE_KEY).map(coerce_score).unwrap_or_default(),
        snippet: first_text(record, SNIPPET_KEYS),
    })
}

fn first_text(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        let text = match record.get(*key)? {
            Value::String(text) => text.trim().to_string(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    })
}

fn coerce_score(value: &Value) -> f64 {
    match value {
        Value::Number(number) => number
            .as_f64()
            .or_else(|| number.to_string().parse().ok())
            .unwrap_or_default(),
        Value::String(text) => text.trim().parse().unwrap_or_default(),
        _ => 0.0,
    }
}
