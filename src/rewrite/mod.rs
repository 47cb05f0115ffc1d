//! Content rewrite pipeline
//!
//! Transforms fetched HTML/CSS so every embedded resource reference routes
//! back through the gateway, and injects the behavior-override script.

mod css;
mod html;
mod inject;
mod urls;

pub use css::rewrite_css_text;
pub use html::ContentRewriter;
pub use inject::{build_override_script, OVERRIDE_SCRIPT_ID};
pub use urls::{decode_proxy_target, encode_proxy_url, resolve_candidate, rewrite_url_value};
