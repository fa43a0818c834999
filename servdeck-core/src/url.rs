//! Server URL detection in process output.

use once_cell::sync::Lazy;
use regex::Regex;

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s]+").expect("url pattern is valid"));

/// First http(s) URL in a line of output. Any URL counts, so unrelated log
/// lines that mention one are false positives.
pub fn find_url(line: &str) -> Option<&str> {
    URL_PATTERN.find(line).map(|m| m.as_str())
}
