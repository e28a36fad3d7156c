//! Properties-file parsing and rendering.

use chrono::Utc;
use std::collections::BTreeMap;

/// Parse properties text into an ordered map.
///
/// `key=value` per line; blank lines and `#`/`!` comment lines are
/// ignored; keys and values are trimmed.
#[must_use]
pub fn parse(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Render a map as properties text with a generation-timestamp header.
#[must_use]
pub fn render(values: &BTreeMap<String, String>) -> String {
    let mut out = format!("# Generated by gantry at {}\n", Utc::now().to_rfc3339());
    for (key, value) in values {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}
