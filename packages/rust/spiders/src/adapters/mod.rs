//! Site adapters: URL classification and per-site content extraction.
//!
//! Adapters are tried in priority order; [`GenericAdapter`] is the last
//! fallback and accepts any `http`/`https` URL.

mod generic;
mod wechat;

use scraper::Html;
use url::Url;
use wise_shared::{Result, WiseError};

pub use generic::GenericAdapter;
pub use wechat::WechatAdapter;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Title and content HTML pulled out of a fetched page.
#[derive(Debug, Clone, Default)]
pub struct Extracted {
    pub title: Option<String>,
    /// Content HTML with page chrome stripped.
    pub html: String,
}

/// Site-specific content extraction.
pub trait SpiderAdapter: Send + Sync {
    /// Whether this adapter handles `url`.
    fn identify(&self, url: &Url) -> bool;

    /// Extract the article title and body from a parsed page.
    fn extract(&self, doc: &Html) -> Extracted;

    /// Stable adapter name, persisted as the classification of a URL.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Holds registered adapters in priority order.
pub struct SpiderRegistry {
    adapters: Vec<Box<dyn SpiderAdapter>>,
}

impl SpiderRegistry {
    /// Create a registry with all built-in adapters (site-specific first, generic last).
    pub fn new() -> Self {
        Self {
            adapters: vec![Box::new(WechatAdapter), Box::new(GenericAdapter)],
        }
    }

    /// Find the adapter for a raw URL string.
    ///
    /// Fails with a validation error for malformed URLs and for URLs no
    /// adapter accepts.
    pub fn classify(&self, raw: &str) -> Result<&dyn SpiderAdapter> {
        let url = Url::parse(raw.trim())
            .map_err(|e| WiseError::validation(format!("invalid url '{raw}': {e}")))?;
        self.resolve(&url)
    }

    /// Find the adapter for a parsed URL.
    pub fn resolve(&self, url: &Url) -> Result<&dyn SpiderAdapter> {
        self.adapters
            .iter()
            .find(|adapter| adapter.identify(url))
            .map(|adapter| adapter.as_ref())
            .ok_or_else(|| WiseError::validation(format!("unsupported url: {url}")))
    }
}

impl Default for SpiderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Collect the trimmed text of the first element matching `selector`.
pub(crate) fn first_text(doc: &Html, selector: &scraper::Selector) -> Option<String> {
    doc.select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wechat_urls_classified_first() {
        let registry = SpiderRegistry::new();
        let adapter = registry
            .classify("https://mp.weixin.qq.com/s/abc123")
            .expect("classify");
        assert_eq!(adapter.name(), "wechat");
    }

    #[test]
    fn other_http_urls_fall_back_to_generic() {
        let registry = SpiderRegistry::new();
        let adapter = registry.classify("https://blog.example.com/post").unwrap();
        assert_eq!(adapter.name(), "generic");
    }

    #[test]
    fn unsupported_and_invalid_urls_rejected() {
        let registry = SpiderRegistry::new();
        let err = registry.classify("ftp://files.example.com/a.txt").err().unwrap();
        assert!(err.to_string().contains("unsupported url"));

        let err = registry.classify("not a url").err().unwrap();
        assert!(err.to_string().contains("invalid url"));
    }
}
