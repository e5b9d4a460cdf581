//! URL classification, page fetching and content extraction for Wise pipelines.
//!
//! This crate provides:
//! - [`adapters`]: site-specific extractors and the [`SpiderRegistry`] that picks one per URL
//! - [`Spider`]: HTTP fetch + extraction + Markdown conversion
//! - [`markdown`]: HTML-to-Markdown conversion and paragraph chunking

pub mod adapters;
pub mod markdown;
pub mod spider;

pub use adapters::{Extracted, GenericAdapter, SpiderAdapter, SpiderRegistry, WechatAdapter};
pub use markdown::{Chunk, count_words, split_paragraphs, to_markdown};
pub use spider::{Article, Spider};
