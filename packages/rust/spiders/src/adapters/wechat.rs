//! WeChat official-account articles (`https://mp.weixin.qq.com/...`).

use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

use super::{Extracted, SpiderAdapter, first_text};

static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".rich_media_title, #activity-name").expect("valid selector"));
static CONTENT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".rich_media_content, #js_content").expect("valid selector"));

pub struct WechatAdapter;

impl SpiderAdapter for WechatAdapter {
    fn identify(&self, url: &Url) -> bool {
        url.scheme() == "https" && url.host_str() == Some("mp.weixin.qq.com")
    }

    fn extract(&self, doc: &Html) -> Extracted {
        let html = doc
            .select(&CONTENT_SEL)
            .next()
            .map(|el| el.inner_html())
            .unwrap_or_default();

        Extracted {
            title: first_text(doc, &TITLE_SEL),
            html,
        }
    }

    fn name(&self) -> &str {
        "wechat"
    }
}
