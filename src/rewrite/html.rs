//! Streaming HTML rewrite pass
//!
//! One `lol_html` pass over the document: rewrites the attribute table into
//! gateway-relative links, routes inline and block CSS through the CSS
//! rewriter, applies the cosmetic substitution table, and injects the
//! override script as the first child of `<head>`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use lol_html::html_content::ContentType;
use lol_html::{element, text, HtmlRewriter, Settings};
use url::Url;

use crate::config::SpoofConfig;
use crate::error::{GatehouseError, Result};

use super::css::rewrite_css_text;
use super::inject::{build_override_script, OVERRIDE_SCRIPT_ID};
use super::urls::{rewrite_srcset, rewrite_url_value, REWRITE_ATTRS};

/// Rewrites fetched documents so embedded references route back through
/// the gateway
pub struct ContentRewriter {
    gateway_base: String,
    substitutions: Vec<(String, String)>,
    override_script: String,
}

impl ContentRewriter {
    pub fn new(gateway_base: String, spoof: &SpoofConfig) -> Self {
        Self {
            gateway_base,
            substitutions: spoof.substitutions.clone(),
            override_script: build_override_script(spoof),
        }
    }

    pub fn gateway_base(&self) -> &str {
        &self.gateway_base
    }

    /// Rewrite an HTML document against its base URL.
    ///
    /// Re-running the pass over its own output is a no-op: gateway-relative
    /// links are recognized and skipped, and the override script's marker
    /// id suppresses a second injection.
    pub fn rewrite_html(&self, html: &str, base: &Url) -> Result<String> {
        let already_injected = html.contains(&format!("id=\"{}\"", OVERRIDE_SCRIPT_ID));
        let injected = Rc::new(Cell::new(already_injected));

        let mut output: Vec<u8> = Vec::with_capacity(html.len() + self.override_script.len());
        let mut handlers = Vec::new();

        // Cosmetic substitutions run first so later handlers win any
        // overlap on style content.
        if !self.substitutions.is_empty() {
            let subs = self.substitutions.clone();
            handlers.push(text!("*", move |chunk| {
                let replaced = apply_substitutions(chunk.as_str(), &subs);
                if replaced != chunk.as_str() {
                    chunk.replace(&replaced, ContentType::Html);
                }
                Ok(())
            }));

            let subs = self.substitutions.clone();
            handlers.push(element!("meta[content]", move |el| {
                if let Some(content) = el.get_attribute("content") {
                    let replaced = apply_substitutions(&content, &subs);
                    if replaced != content {
                        el.set_attribute("content", &replaced)?;
                    }
                }
                Ok(())
            }));
        }

        // Attribute table: tag -> attributes carrying resource references.
        for &(tag, attrs) in REWRITE_ATTRS {
            let base = base.clone();
            let gateway_base = self.gateway_base.clone();
            handlers.push(element!(tag, move |el| {
                for &attr in attrs {
                    let Some(value) = el.get_attribute(attr) else {
                        continue;
                    };
                    let replacement = if attr == "srcset" {
                        let rewritten = rewrite_srcset(&value, &base, &gateway_base);
                        (rewritten != value).then_some(rewritten)
                    } else {
                        rewrite_url_value(&value, &base, &gateway_base)
                    };
                    if let Some(replacement) = replacement {
                        el.set_attribute(attr, &replacement)?;
                    }
                }
                Ok(())
            }));
        }

        // Inline style attributes.
        {
            let base = base.clone();
            let gateway_base = self.gateway_base.clone();
            handlers.push(element!("[style]", move |el| {
                if let Some(style) = el.get_attribute("style") {
                    let rewritten = rewrite_css_text(&style, &base, &gateway_base);
                    if rewritten != style {
                        el.set_attribute("style", &rewritten)?;
                    }
                }
                Ok(())
            }));
        }

        // <style> blocks: buffer chunks, rewrite once the node is complete.
        {
            let base = base.clone();
            let gateway_base = self.gateway_base.clone();
            let buffer = Rc::new(RefCell::new(String::new()));
            handlers.push(text!("style", move |chunk| {
                buffer.borrow_mut().push_str(chunk.as_str());
                if chunk.last_in_text_node() {
                    let css = std::mem::take(&mut *buffer.borrow_mut());
                    chunk.replace(
                        &rewrite_css_text(&css, &base, &gateway_base),
                        ContentType::Html,
                    );
                } else {
                    chunk.remove();
                }
                Ok(())
            }));
        }

        // Override script becomes the first child of <head> so it runs
        // before any page script.
        {
            let injected = injected.clone();
            let script = self.override_script.clone();
            handlers.push(element!("head", move |el| {
                if !injected.get() {
                    el.prepend(&script, ContentType::Html);
                    injected.set(true);
                }
                Ok(())
            }));
        }

        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: handlers,
                ..Settings::default()
            },
            |chunk: &[u8]| output.extend_from_slice(chunk),
        );

        rewriter
            .write(html.as_bytes())
            .map_err(|e| GatehouseError::RewriteFailure(e.to_string()))?;
        rewriter
            .end()
            .map_err(|e| GatehouseError::RewriteFailure(e.to_string()))?;

        let mut result = String::from_utf8(output)
            .map_err(|e| GatehouseError::RewriteFailure(e.to_string()))?;

        // Documents without a <head> get one synthesized for the script.
        if !injected.get() {
            result = inject_without_head(&result, &self.override_script);
        }

        Ok(result)
    }

    /// Rewrite a standalone CSS document
    pub fn rewrite_css(&self, css: &str, base: &Url) -> String {
        rewrite_css_text(css, base, &self.gateway_base)
    }
}

fn apply_substitutions(text: &str, substitutions: &[(String, String)]) -> String {
    let mut out = text.to_string();
    for (from, to) in substitutions {
        if out.contains(from.as_str()) {
            out = out.replace(from.as_str(), to);
        }
    }
    out
}

fn inject_without_head(html: &str, script: &str) -> String {
    let lower = html.to_ascii_lowercase();
    if let Some(pos) = lower.find("<html") {
        if let Some(end) = lower[pos..].find('>') {
            let at = pos + end + 1;
            return format!("{}<head>{}</head>{}", &html[..at], script, &html[at..]);
        }
    }
    format!("<head>{}</head>{}", script, html)
}
