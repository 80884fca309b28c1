//! Inline fact markers.
//!
//! A unit declares a fact as `[[key: value]]` and cites one as `[[key]]`.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

static DEFINITION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[\s*([A-Za-z0-9_.-]+)\s*:\s*([^\]]+?)\s*\]\]")
        .expect("DEFINITION_PATTERN regex should compile")
});

static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[\s*([A-Za-z0-9_.-]+)\s*\]\]").expect("REFERENCE_PATTERN regex should compile")
});

/// Every `(key, value)` declaration, in order of appearance.
pub fn extract_definitions(text: &str) -> Vec<(String, String)> {
    DEFINITION_PATTERN
        .captures_iter(text)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Keys declared in the text.
pub fn defined_keys(text: &str) -> BTreeSet<String> {
    extract_definitions(text).into_iter().map(|(k, _)| k).collect()
}

/// Keys cited (not declared) in the text.
pub fn extract_references(text: &str) -> BTreeSet<String> {
    REFERENCE_PATTERN
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Number of fact markers of either form.
pub fn count_markers(text: &str) -> usize {
    DEFINITION_PATTERN.find_iter(text).count() + REFERENCE_PATTERN.find_iter(text).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definitions_and_references() {
        let text = "Peak power is [[peak_power: 3.2 W]] and efficiency [[eff:42%]]; see [[bandwidth]].";
        let defs = extract_definitions(text);
        assert_eq!(
            defs,
            vec![
                ("peak_power".to_string(), "3.2 W".to_string()),
                ("eff".to_string(), "42%".to_string())
            ]
        );
        let refs = extract_references(text);
        assert_eq!(refs.len(), 1);
        assert!(refs.contains("bandwidth"));
        assert_eq!(count_markers(text), 3);
    }

    #[test]
    fn test_definition_is_not_reference() {
        assert!(extract_references("[[a: 1]]").is_empty());
        assert!(defined_keys("[[a]]").is_empty());
    }
}
