//! Download-list import and export formats.
//!
//! Import accepts either JSON (an array, or an object with an `items`
//! array, of URL strings or item objects) or plain text with one entry per
//! line. Text lines split on `|` when present, otherwise on whitespace:
//! `url [filePath [queue [category]]]`; `#` and `//` lines are comments.
//!
//! Export writes one URL per line for `.txt` targets and a versioned JSON
//! document otherwise.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry parsed from an import list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportEntry {
    pub url: String,
    pub file_path: Option<String>,
    pub queue_name: Option<String>,
    pub category: Option<String>,
    pub start_paused: bool,
}

/// One row of a JSON export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportItem {
    pub url: String,
    pub file_path: String,
    pub queue_name: String,
    pub category: String,
    pub state: String,
    pub bytes_received: u64,
    pub bytes_total: u64,
}

#[derive(Debug, Serialize)]
struct ExportDocument<'a> {
    version: u32,
    items: &'a [ExportItem],
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn entry_from_json(value: &Value) -> Option<ImportEntry> {
    if let Some(url) = value.as_str() {
        let url = url.trim();
        if url.is_empty() {
            return None;
        }
        return Some(ImportEntry {
            url: url.to_string(),
            ..ImportEntry::default()
        });
    }
    let object = value.as_object()?;
    let url = non_empty(object.get("url").and_then(Value::as_str))?;
    Some(ImportEntry {
        url,
        file_path: non_empty(object.get("filePath").and_then(Value::as_str)),
        queue_name: non_empty(object.get("queueName").and_then(Value::as_str)),
        category: non_empty(object.get("category").and_then(Value::as_str)),
        start_paused: object
            .get("startPaused")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn entry_from_line(line: &str) -> Option<ImportEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
        return None;
    }
    let parts: Vec<&str> = if trimmed.contains('|') {
        trimmed.split('|').collect()
    } else {
        trimmed.split_whitespace().collect()
    };
    let url = non_empty(parts.first().copied())?;
    Some(ImportEntry {
        url,
        file_path: non_empty(parts.get(1).copied()),
        queue_name: non_empty(parts.get(2).copied()),
        category: non_empty(parts.get(3).copied()),
        start_paused: false,
    })
}

/// Parses an import list, JSON first, line format as fallback.
#[must_use]
pub fn parse_import(text: &str) -> Vec<ImportEntry> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        let items = match &value {
            Value::Array(items) => Some(items.as_slice()),
            Value::Object(object) => object.get("items").and_then(Value::as_array).map(Vec::as_slice),
            _ => None,
        };
        if let Some(items) = items {
            return items.iter().filter_map(entry_from_json).collect();
        }
    }
    text.lines().filter_map(entry_from_line).collect()
}

/// Renders an export document. `.txt` targets get bare URLs, everything
/// else the JSON form.
#[must_use]
pub fn render_export(as_text: bool, items: &[ExportItem]) -> String {
    if as_text {
        let mut out = String::new();
        for item in items {
            out.push_str(&item.url);
            out.push('\n');
        }
        return out;
    }
    serde_json::to_string_pretty(&ExportDocument { version: 1, items })
        .unwrap_or_else(|_| String::from("{}"))
}
