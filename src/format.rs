use serde_json::Value;
use teloxide::utils::markdown;

use crate::api::Record;

/// Prefix of every formatted field line.
pub const MARKER: &str = "👉";

/// Uppercase the first character and lowercase the rest.
fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "N/A".to_string(),
        other => other.to_string(),
    }
}

fn format_with(record: &Record, escape: impl Fn(&str) -> String) -> String {
    record
        .iter()
        .map(|(key, value)| {
            format!(
                "{} {}: {}",
                MARKER,
                escape(&capitalize(key)),
                escape(&display_value(value))
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One `👉 Key: value` line per field, in record order.
pub fn format_record(record: &Record) -> String {
    format_with(record, str::to_string)
}

/// Same layout as [`format_record`] with keys and values escaped for MarkdownV2.
pub fn format_record_markdown(record: &Record) -> String {
    format_with(record, markdown::escape)
}

/// Format up to `limit` records, separated by a blank line.
pub fn format_records(records: &[Record], limit: usize) -> String {
    records
        .iter()
        .take(limit)
        .map(format_record_markdown)
        .collect::<Vec<_>>()
        .join("\n\n")
}
