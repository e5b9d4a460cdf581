//! Generic (fallback) adapter for arbitrary web pages.
//!
//! Finds the main content area with simple readability heuristics and
//! strips navigation chrome.

use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

use super::{Extracted, SpiderAdapter, first_text};

static CONTENT_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    ["article", "main", r#"[role="main"]"#, ".content", "body"]
        .into_iter()
        .map(|s| Selector::parse(s).expect("valid selector"))
        .collect()
});
static H1_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1").expect("valid selector"));
static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid selector"));
static CHROME_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("nav, header, footer, aside, script, style, noscript, .sidebar, .nav")
        .expect("valid selector")
});

pub struct GenericAdapter;

impl SpiderAdapter for GenericAdapter {
    fn identify(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    fn extract(&self, doc: &Html) -> Extracted {
        let title = first_text(doc, &H1_SEL).or_else(|| first_text(doc, &TITLE_SEL));

        let html = CONTENT_SELECTORS
            .iter()
            .find_map(|sel| doc.select(sel).next())
            .map(|el| strip_chrome(&el.inner_html()))
            .unwrap_or_default();

        Extracted { title, html }
    }

    fn name(&self) -> &str {
        "generic"
    }
}

/// Remove navigation, header/footer and script elements from an HTML fragment.
fn strip_chrome(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let mut result = html.to_string();
    for el in doc.select(&CHROME_SEL) {
        result = result.replace(&el.html(), "");
    }
    result
}
