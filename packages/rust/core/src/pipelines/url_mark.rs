//! `url_mark`: capture a submitted URL as Markdown chunks.
//!
//! `start` validates the arguments, `check` classifies the URL with the
//! spider registry, `read` fetches and converts the page, and `split` cuts
//! the Markdown into paragraph-bounded chunks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use wise_shared::{Result, UrlMarkConfig, WiseError};
use wise_spiders::{Article, Chunk, Spider, split_paragraphs};
use wise_storage::PipelineStore;

use crate::context::TaskContext;
use crate::executor::PipelineExecutor;
use crate::state_machine::{StateMachine, StepHandler, StepOutcome};

/// Task type of the URL capture pipeline.
pub const URL_MARK: &str = "url_mark";

/// Upper bound on characters per chunk produced by `split`.
pub const MAX_CHUNK_CHARS: usize = 1200;

/// Submission arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlMarkArgs {
    pub url: String,
}

/// Output of `check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutput {
    pub url: String,
    /// Adapter that will read the page.
    pub spider: String,
}

/// Output of `split`, the final result of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitOutput {
    pub url: String,
    pub title: String,
    pub content_hash: String,
    pub total_words: usize,
    pub chunks: Vec<Chunk>,
}

fn parse<T: for<'de> Deserialize<'de>>(state: &str, input: &str) -> Result<T> {
    serde_json::from_str(input)
        .map_err(|e| WiseError::step(state, format!("malformed input: {e}")))
}

struct Start;

#[async_trait]
impl StepHandler for Start {
    async fn handle(&self, _ctx: &TaskContext, input: &str) -> Result<StepOutcome> {
        let args: UrlMarkArgs = serde_json::from_str(input)?;
        if args.url.trim().is_empty() {
            return Err(WiseError::validation("url must not be empty"));
        }
        StepOutcome::next_json(&args)
    }
}

struct Check {
    spider: Arc<Spider>,
}

#[async_trait]
impl StepHandler for Check {
    async fn handle(&self, _ctx: &TaskContext, input: &str) -> Result<StepOutcome> {
        let args: UrlMarkArgs = parse("check", input)?;
        let spider = self
            .spider
            .classify(&args.url)
            .map_err(|e| WiseError::step("check", e.to_string()))?;
        StepOutcome::next_json(&CheckOutput {
            url: args.url,
            spider,
        })
    }
}

struct Read {
    spider: Arc<Spider>,
}

#[async_trait]
impl StepHandler for Read {
    async fn handle(&self, ctx: &TaskContext, input: &str) -> Result<StepOutcome> {
        let checked: CheckOutput = parse("read", input)?;
        let article = ctx.run_until(self.spider.fetch(&checked.url)).await?;
        info!(tid = ctx.tid(), title = %article.title, words = article.word_count, "article read");
        StepOutcome::next_json(&article)
    }
}

struct Split {
    max_chars: usize,
}

#[async_trait]
impl StepHandler for Split {
    async fn handle(&self, _ctx: &TaskContext, input: &str) -> Result<StepOutcome> {
        let article: Article = parse("split", input)?;
        let chunks = split_paragraphs(&article.markdown, self.max_chars);
        StepOutcome::done_json(&SplitOutput {
            url: article.url,
            title: article.title,
            content_hash: article.content_hash,
            total_words: chunks.iter().map(|c| c.word_count).sum(),
            chunks,
        })
    }
}

/// Build the `url_mark` executor with its retry policy from `config`.
pub fn url_mark_executor(
    store: Arc<dyn PipelineStore>,
    spider: Arc<Spider>,
    config: &UrlMarkConfig,
) -> PipelineExecutor {
    let mut machine = StateMachine::new(store);
    machine
        .register_state("start", "Start", Start)
        .register_state(
            "check",
            "Check",
            Check {
                spider: spider.clone(),
            },
        )
        .register_state("read", "Read", Read { spider })
        .register_state(
            "split",
            "Split",
            Split {
                max_chars: MAX_CHUNK_CHARS,
            },
        );

    PipelineExecutor::new(URL_MARK, machine)
        .with_retry_policy(config.max_retries, config.retry_interval)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use wise_shared::{StepStatus, TaskStatus};
    use wise_storage::{StepStore, TaskStore};

    use super::*;
    use crate::executor::TaskExecutor;
    use crate::test_support::test_store;

    fn config() -> UrlMarkConfig {
        UrlMarkConfig {
            max_retries: 2,
            retry_interval: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
        }
    }

    async fn executor() -> PipelineExecutor {
        let spider = Arc::new(Spider::new(Duration::from_secs(5)).unwrap());
        url_mark_executor(test_store().await, spider, &config())
    }

    #[tokio::test]
    async fn registers_four_states_in_order() {
        let exec = executor().await;
        let codes: Vec<&str> = exec.machine().states().iter().map(|s| s.code.as_str()).collect();
        assert_eq!(codes, vec!["start", "check", "read", "split"]);
        assert_eq!(exec.task_type(), URL_MARK);
        assert_eq!(exec.max_retries(), 2);
    }

    #[tokio::test]
    async fn captures_page_end_to_end() {
        let server = MockServer::start().await;
        let page = r#"<html><body><article>
            <h1>Field Notes</h1>
            <p>First paragraph about durable queues.</p>
            <p>Second paragraph about retries.</p>
        </article></body></html>"#;
        Mock::given(method("GET"))
            .and(path("/notes"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;

        let exec = executor().await;
        let url = format!("{}/notes", server.uri());
        let task = exec.create_task(&json!({ "url": url }), "notes").await.unwrap();
        exec.execute(&TaskContext::detached(&task.tid), &task)
            .await
            .unwrap();

        let store = exec.machine().store();
        let steps = store.steps_by_task(&task.tid).await.unwrap();
        assert!(steps.iter().all(|s| s.status == StepStatus::Success));

        let check: CheckOutput = serde_json::from_str(&steps[1].result).unwrap();
        assert_eq!(check.spider, "generic");

        let stored = store.get_task(&task.tid).await.unwrap().unwrap();
        assert_eq!(stored.current_state, "split");
        assert_eq!(stored.current_step, 4);
        let output: SplitOutput = serde_json::from_str(&stored.result).unwrap();
        assert_eq!(output.title, "Field Notes");
        assert!(!output.chunks.is_empty());
        assert!(output.chunks[0].text.contains("durable queues"));
        assert!(output.total_words > 5);
    }

    #[tokio::test]
    async fn unsupported_url_fails_check() {
        let exec = executor().await;
        let task = exec
            .create_task(&json!({ "url": "ftp://example.com/file" }), "ftp")
            .await
            .unwrap();
        let err = exec
            .execute(&TaskContext::detached(&task.tid), &task)
            .await
            .unwrap_err();
        assert!(matches!(err, WiseError::StepExecution { ref state, .. } if state == "check"));
        assert!(!err.is_fatal());

        let steps = exec.machine().store().steps_by_task(&task.tid).await.unwrap();
        assert_eq!(steps[1].status, StepStatus::Failed);
        assert_eq!(steps[2].status, StepStatus::Init);
    }

    #[tokio::test]
    async fn fetch_failure_is_retryable_and_resumes_at_read() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let exec = executor().await;
        let url = format!("{}/down", server.uri());
        let task = exec.create_task(&json!({ "url": url }), "down").await.unwrap();
        let err = exec
            .execute(&TaskContext::detached(&task.tid), &task)
            .await
            .unwrap_err();
        assert!(matches!(err, WiseError::StepExecution { ref state, .. } if state == "read"));

        let stored = exec.machine().store().get_task(&task.tid).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Init);
        assert_eq!(stored.current_state, "check");
    }

    #[tokio::test]
    async fn malformed_params_are_fatal() {
        let exec = executor().await;
        let task = exec.create_task(&json!({ "link": "x" }), "bad").await.unwrap();
        let err = exec
            .execute(&TaskContext::detached(&task.tid), &task)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn empty_url_fails_without_retry() {
        let exec = executor().await;
        let task = exec.create_task(&json!({ "url": "  " }), "blank").await.unwrap();
        let err = exec
            .execute(&TaskContext::detached(&task.tid), &task)
            .await
            .unwrap_err();
        assert!(matches!(err, WiseError::Validation { .. }));
        assert!(err.is_fatal());

        let steps = exec.machine().store().steps_by_task(&task.tid).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[1].status, StepStatus::Init);
    }
}
