//! Proxied-URL encoding and reference resolution
//!
//! Every rewritable reference is resolved to an absolute URL and encoded
//! into a gateway-relative link. Emitted links always carry the URL-safe
//! unpadded base64 form; the decoder additionally accepts a plain absolute
//! URL as a caller convenience.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use url::Url;

use crate::error::{GatehouseError, Result};

/// Tag/attribute table driving the HTML rewrite pass
pub const REWRITE_ATTRS: &[(&str, &[&str])] = &[
    ("a", &["href"]),
    ("link", &["href"]),
    ("script", &["src"]),
    ("img", &["src", "srcset"]),
    ("iframe", &["src"]),
    ("form", &["action"]),
    ("video", &["src", "poster"]),
    ("audio", &["src"]),
    ("source", &["src", "srcset"]),
    ("embed", &["src"]),
    ("object", &["data"]),
];

/// Schemes that are never routed through the gateway
const PASSTHROUGH_SCHEMES: &[&str] = &[
    "data:",
    "mailto:",
    "tel:",
    "javascript:",
    "about:",
    "blob:",
];

/// Encode an absolute target URL as a gateway-relative proxy link
pub fn encode_proxy_url(target: &Url, gateway_base: &str) -> String {
    format!(
        "{}?url={}",
        gateway_base,
        URL_SAFE_NO_PAD.encode(target.as_str())
    )
}

/// Decode the `url=` parameter of a gateway link back to the exact target
pub fn decode_proxy_target(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GatehouseError::InvalidTargetUrl("empty url".into()));
    }

    // Caller convenience: a plain absolute URL is accepted as-is.
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(Url::parse(trimmed)?);
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed.trim_end_matches('='))
        .or_else(|_| STANDARD.decode(trimmed))
        .map_err(|_| {
            GatehouseError::InvalidTargetUrl("url parameter is not valid base64".into())
        })?;

    let decoded = String::from_utf8(bytes)
        .map_err(|_| GatehouseError::InvalidTargetUrl("decoded url is not UTF-8".into()))?;

    let url = Url::parse(&decoded)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(GatehouseError::InvalidTargetUrl(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }
    Ok(url)
}

/// Resolve a raw reference into an absolute URL eligible for rewriting.
///
/// Returns `None` for references that must be left untouched: special
/// schemes, fragment-only links, empty values, and links that are already
/// gateway-relative (which makes a second rewrite pass a no-op).
pub fn resolve_candidate(raw: &str, base: &Url, gateway_base: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let lower = trimmed.to_ascii_lowercase();
    if PASSTHROUGH_SCHEMES.iter().any(|s| lower.starts_with(s)) {
        return None;
    }

    // Already routed through the gateway.
    if trimmed.starts_with(gateway_base) {
        return None;
    }

    // Protocol-relative references resolve against https.
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Url::parse(&format!("https://{}", rest)).ok();
    }

    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Url::parse(trimmed).ok();
    }

    base.join(trimmed)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
}

/// Rewrite a single attribute value, or `None` when it stays untouched
pub fn rewrite_url_value(raw: &str, base: &Url, gateway_base: &str) -> Option<String> {
    resolve_candidate(raw, base, gateway_base).map(|url| encode_proxy_url(&url, gateway_base))
}

/// Rewrite a `srcset` attribute, preserving width/density descriptors
pub fn rewrite_srcset(srcset: &str, base: &Url, gateway_base: &str) -> String {
    srcset
        .split(',')
        .map(|part| {
            let part = part.trim();
            let (candidate, descriptor) = match part.rsplit_once(' ') {
                Some((url, desc)) => (url.trim(), Some(desc.trim())),
                None => (part, None),
            };

            let rewritten = rewrite_url_value(candidate, base, gateway_base)
                .unwrap_or_else(|| candidate.to_string());

            match descriptor {
                Some(desc) => format!("{} {}", rewritten, desc),
                None => rewritten,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const GW: &str = "/proxy";

    fn base() -> Url {
        Url::parse("https://a.test/dir/page.html").unwrap()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let target = Url::parse("https://a.test/b.png").unwrap();
        let encoded = encode_proxy_url(&target, GW);
        assert!(encoded.starts_with("/proxy?url="));

        let param = encoded.strip_prefix("/proxy?url=").unwrap();
        let decoded = decode_proxy_target(param).unwrap();
        assert_eq!(decoded.as_str(), "https://a.test/b.png");
    }

    #[test]
    fn test_decode_accepts_plain_absolute_url() {
        let decoded = decode_proxy_target("https://a.test/x?q=1").unwrap();
        assert_eq!(decoded.as_str(), "https://a.test/x?q=1");
    }

    #[test]
    fn test_decode_accepts_padded_standard_base64() {
        let padded = STANDARD.encode("https://a.test/b.png");
        let decoded = decode_proxy_target(&padded).unwrap();
        assert_eq!(decoded.as_str(), "https://a.test/b.png");
    }

    #[test]
    fn test_decode_rejects_garbage_and_bad_schemes() {
        assert!(decode_proxy_target("").is_err());
        assert!(decode_proxy_target("!!!not-base64!!!").is_err());

        let ftp = URL_SAFE_NO_PAD.encode("ftp://a.test/file");
        assert!(decode_proxy_target(&ftp).is_err());
    }

    #[test]
    fn test_resolve_absolute_url() {
        let resolved = resolve_candidate("https://x.test/p", &base(), GW).unwrap();
        assert_eq!(resolved.as_str(), "https://x.test/p");
    }

    #[test]
    fn test_resolve_protocol_relative_assumes_https() {
        let resolved = resolve_candidate("//cdn.test/i.png", &base(), GW).unwrap();
        assert_eq!(resolved.as_str(), "https://cdn.test/i.png");
    }

    #[test]
    fn test_resolve_relative_against_base() {
        let resolved = resolve_candidate("./img/x.png", &base(), GW).unwrap();
        assert_eq!(resolved.as_str(), "https://a.test/dir/img/x.png");

        let resolved = resolve_candidate("style.css", &base(), GW).unwrap();
        assert_eq!(resolved.as_str(), "https://a.test/dir/style.css");

        let resolved = resolve_candidate("/root.css", &base(), GW).unwrap();
        assert_eq!(resolved.as_str(), "https://a.test/root.css");
    }

    #[test]
    fn test_special_schemes_and_fragments_untouched() {
        for raw in [
            "data:image/png;base64,AAAA",
            "mailto:someone@example.test",
            "tel:+15551234567",
            "javascript:void(0)",
            "about:blank",
            "blob:https://a.test/uuid",
            "#section-2",
            "",
            "   ",
        ] {
            assert!(
                resolve_candidate(raw, &base(), GW).is_none(),
                "expected {:?} to be untouched",
                raw
            );
        }
    }

    #[test]
    fn test_already_gateway_relative_untouched() {
        let already = "/proxy?url=aHR0cHM6Ly9hLnRlc3QvYi5wbmc";
        assert!(resolve_candidate(already, &base(), GW).is_none());
    }

    #[test]
    fn test_rewrite_url_value_encodes_target() {
        let rewritten = rewrite_url_value("https://x.test/p", &base(), GW).unwrap();
        let param = rewritten.strip_prefix("/proxy?url=").unwrap();
        assert_eq!(
            decode_proxy_target(param).unwrap().as_str(),
            "https://x.test/p"
        );
    }

    #[test]
    fn test_rewrite_srcset_preserves_descriptors() {
        let srcset = "small.png 480w, large.png 2x, https://cdn.test/x.png";
        let rewritten = rewrite_srcset(srcset, &base(), GW);

        let parts: Vec<&str> = rewritten.split(", ").collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with("/proxy?url="));
        assert!(parts[0].ends_with(" 480w"));
        assert!(parts[1].ends_with(" 2x"));
        assert!(parts[2].starts_with("/proxy?url="));

        let first = parts[0].strip_suffix(" 480w").unwrap();
        let param = first.strip_prefix("/proxy?url=").unwrap();
        assert_eq!(
            decode_proxy_target(param).unwrap().as_str(),
            "https://a.test/dir/small.png"
        );
    }
}
