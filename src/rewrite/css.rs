//! CSS reference rewriting
//!
//! Handles `url(...)` tokens and quoted `@import` rules in standalone CSS
//! documents, `<style>` blocks, and inline `style=` attributes.
//! `@import url(...)` is covered by the `url(` scanner.

use url::Url;

use super::urls::rewrite_url_value;

/// Rewrite every resolvable reference in a CSS document
pub fn rewrite_css_text(css: &str, base: &Url, gateway_base: &str) -> String {
    let bytes = css.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(css.len() + 64);
    let mut i = 0;

    while i < bytes.len() {
        if matches_ignore_case(bytes, i, b"url(") {
            if let Some(close) = find_byte(bytes, i + 4, b')') {
                let inner = css[i + 4..close]
                    .trim()
                    .trim_matches(|c| c == '"' || c == '\'')
                    .trim();

                match rewrite_url_value(inner, base, gateway_base) {
                    Some(rewritten) => {
                        out.extend_from_slice(b"url(\"");
                        out.extend_from_slice(rewritten.as_bytes());
                        out.extend_from_slice(b"\")");
                    }
                    None => out.extend_from_slice(&bytes[i..=close]),
                }
                i = close + 1;
                continue;
            }
        } else if matches_ignore_case(bytes, i, b"@import") {
            let mut j = i + 7;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j < bytes.len() && (bytes[j] == b'"' || bytes[j] == b'\'') {
                if let Some(end) = find_byte(bytes, j + 1, bytes[j]) {
                    let inner = &css[j + 1..end];
                    match rewrite_url_value(inner, base, gateway_base) {
                        Some(rewritten) => {
                            out.extend_from_slice(b"@import \"");
                            out.extend_from_slice(rewritten.as_bytes());
                            out.push(b'"');
                        }
                        None => out.extend_from_slice(&bytes[i..=end]),
                    }
                    i = end + 1;
                    continue;
                }
            }
            // `@import url(...)` falls through to the url( scanner.
        }

        out.push(bytes[i]);
        i += 1;
    }

    // Splices happen at ASCII boundaries, so the output stays valid UTF-8.
    String::from_utf8(out).unwrap_or_else(|_| css.to_string())
}

fn matches_ignore_case(haystack: &[u8], at: usize, needle: &[u8]) -> bool {
    haystack.len() >= at + needle.len()
        && haystack[at..at + needle.len()].eq_ignore_ascii_case(needle)
}

fn find_byte(haystack: &[u8], from: usize, needle: u8) -> Option<usize> {
    haystack[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|pos| from + pos)
}
