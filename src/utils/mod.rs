//! Utility functions shared across channels

pub mod regex;

use self::regex::RegexPatterns;

/// Strip zero-width/invisible control characters (zero-width space, joiner,
/// non-joiner, BOM). Some relay platforms inject these into message text and
/// they break downstream input matching.
pub fn strip_zero_width(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}'))
        .collect()
}

/// Extract a screen name from feed-source input. The leading `@` is optional;
/// empty remaining input is rejected.
pub fn extract_screen_name(input: &str) -> Option<&str> {
    RegexPatterns::screen_name()
        .captures(input.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|name| !name.is_empty())
}
