//! Built-in pipelines shipped with the service.

pub mod url_mark;

pub use url_mark::{URL_MARK, UrlMarkArgs, url_mark_executor};
