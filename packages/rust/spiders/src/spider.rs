//! HTTP fetching and article extraction.

use std::time::Duration;

use reqwest::Client;
use scraper::Html;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use url::Url;
use wise_shared::{Result, WiseError};

use crate::adapters::SpiderRegistry;
use crate::markdown::{count_words, to_markdown};

/// User-Agent string sent with every request.
const USER_AGENT: &str = concat!("wise/", env!("CARGO_PKG_VERSION"));

/// A fetched and extracted article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub url: String,
    /// Name of the adapter that extracted the page.
    pub spider: String,
    pub title: String,
    pub markdown: String,
    pub word_count: usize,
    /// SHA-256 of the raw response body.
    pub content_hash: String,
}

/// Fetches pages and extracts their content with the matching adapter.
pub struct Spider {
    client: Client,
    registry: SpiderRegistry,
}

impl Spider {
    /// Create a spider whose requests time out after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(request_timeout)
            .build()
            .map_err(|e| WiseError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            registry: SpiderRegistry::new(),
        })
    }

    pub fn registry(&self) -> &SpiderRegistry {
        &self.registry
    }

    /// Name of the adapter that would handle `url`.
    pub fn classify(&self, url: &str) -> Result<String> {
        Ok(self.registry.classify(url)?.name().to_string())
    }

    /// Fetch `url` and extract its title and Markdown content.
    #[instrument(skip(self))]
    pub async fn fetch(&self, url: &str) -> Result<Article> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| WiseError::validation(format!("invalid url '{url}': {e}")))?;
        let adapter = self.registry.resolve(&parsed)?;

        let response = self
            .client
            .get(parsed.as_str())
            .send()
            .await
            .map_err(|e| WiseError::Network(format!("{parsed}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WiseError::Network(format!("{parsed}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| WiseError::Network(format!("{parsed}: body read failed: {e}")))?;

        let content_hash = compute_hash(&body);
        let extracted = {
            let doc = Html::parse_document(&body);
            adapter.extract(&doc)
        };

        if extracted.html.trim().is_empty() {
            return Err(WiseError::parse(format!("{parsed}: no content found")));
        }

        let markdown = to_markdown(&extracted.html)?;
        let title = extracted.title.unwrap_or_else(|| "Untitled".to_string());
        let word_count = count_words(&markdown);

        debug!(spider = adapter.name(), %title, word_count, "page extracted");

        Ok(Article {
            url: parsed.to_string(),
            spider: adapter.name().to_string(),
            title,
            markdown,
            word_count,
            content_hash,
        })
    }
}

/// Compute a SHA-256 hash of content.
fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
