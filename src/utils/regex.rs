use regex::Regex;
use std::sync::LazyLock;

/// Compiled regex patterns that are reused across the codebase
pub struct RegexPatterns;

impl RegexPatterns {
    /// Regex for matching markdown bold (**text**)
    pub fn markdown_bold() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"\*\*(.+?)\*\*").expect("Failed to compile markdown bold regex")
        });
        &RE
    }

    /// Regex for matching markdown italic (*text* or _text_)
    pub fn markdown_italic() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?:\*([^*\n]+)\*|\b_([^_\n]+)_\b)")
                .expect("Failed to compile markdown italic regex")
        });
        &RE
    }

    /// Regex for matching markdown code (`code`)
    pub fn markdown_code() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"`([^`]+)`").expect("Failed to compile markdown code regex")
        });
        &RE
    }

    /// Regex for matching markdown links ([text](url))
    pub fn markdown_link() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("Failed to compile markdown link regex")
        });
        &RE
    }

    /// Regex for matching markdown heading markers at line start
    pub fn markdown_heading() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?m)^#{1,6}\s+").expect("Failed to compile markdown heading regex")
        });
        &RE
    }

    /// Regex for extracting a feed-source screen name, with an optional
    /// leading `@`.
    pub fn screen_name() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^@?(\w+)$").expect("Failed to compile screen name regex")
        });
        &RE
    }
}
