//! Trivial key/value manifest reader.
//!
//! Bundles carry a `plugin.ini` at the archive root, one `key=value` per
//! line. Blank lines and lines starting with `#` or `!` are ignored.

/// Manifest file name inside a bundle.
pub const MANIFEST_NAME: &str = "plugin.ini";

/// Parse `key=value` lines, preserving order.
///
/// Lines without `=` are skipped. Keys and values are trimmed.
#[must_use]
pub fn parse_properties(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Split a comma-separated manifest value into trimmed, non-empty items.
#[must_use]
pub fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_and_trims() {
        let props = parse_properties("a = 1\n\n# comment\n! also comment\nb=two\nmalformed\n");
        assert_eq!(
            props,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string()),
            ]
        );
    }

    #[test]
    fn list_splitting() {
        let raw = "a, b,,c ".to_string();
        assert_eq!(split_list(Some(&raw)), vec!["a", "b", "c"]);
        assert!(split_list(None).is_empty());
    }
}
