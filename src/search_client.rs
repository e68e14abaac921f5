//! HTTP [`SearchIndex`] client for a Meilisearch-style REST engine.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | search (paged / facet) | `POST /indexes/{uid}/search` |
//! | upsert | `POST /indexes/{uid}/documents?primaryKey=id` |
//! | delete by ids | `POST /indexes/{uid}/documents/delete-batch` |
//! | delete by filter | `POST /indexes/{uid}/documents/delete` |
//! | task status | `GET /tasks/{taskUid}` |
//!
//! Writes are asynchronous on the engine side: a 2xx reply only means the
//! write was enqueued as a task. Every write polls its task until it
//! reaches `succeeded`, and a `failed` or `canceled` task (or one still
//! pending after `task-timeout-secs`) is an error, so callers never record
//! a hash for a write the engine rejected.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (other) → fail immediately
//! - Network errors → retry
//!
//! Delays double from `backoff_base` (1s by default) up to 32× the base.
//!
//! The engine numbers pages from 1. [`Page::wire_number`] and
//! [`Page::from_wire`] are the only conversions between that and the
//! 0-based pages used everywhere else.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use notesync_core::filter::Filter;
use notesync_core::search::{FacetCounts, Page, SearchIndex, SearchPage};
use notesync_core::IndexRecord;

use crate::config::SearchConfig;

pub struct HttpSearchIndex {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
    backoff_base: Duration,
    task_poll: Duration,
    task_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    status: String,
    #[serde(default)]
    error: Option<TaskError>,
}

#[derive(Debug, Deserialize)]
struct TaskError {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<Map<String, Value>>,
    #[serde(default)]
    total_hits: Option<u64>,
    #[serde(default)]
    estimated_total_hits: Option<u64>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    hits_per_page: Option<usize>,
    #[serde(default)]
    facet_distribution: Option<FacetCounts>,
}

impl HttpSearchIndex {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var).with_context(|| format!("{} not set", var))?,
            ),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            backoff_base: Duration::from_secs(1),
            task_poll: Duration::from_millis(config.task_poll_ms),
            task_timeout: Duration::from_secs(config.task_timeout_secs),
        })
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::POST, path, Some(body)).await
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.send(Method::GET, path, None).await
    }

    /// POST a write and wait for the task it enqueues to finish.
    async fn write(&self, path: &str, body: &Value) -> Result<()> {
        let reply = self.post(path, body).await?;
        match reply.get("taskUid").and_then(Value::as_u64) {
            Some(uid) => self.wait_for_task(uid).await,
            // Engines that apply writes synchronously return no task.
            None => Ok(()),
        }
    }

    async fn wait_for_task(&self, uid: u64) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.task_timeout;
        loop {
            let reply = self.get(&format!("/tasks/{}", uid)).await?;
            let task: TaskResponse =
                serde_json::from_value(reply).context("Invalid task response")?;
            match task.status.as_str() {
                "succeeded" => return Ok(()),
                "failed" | "canceled" => {
                    let (message, code) = match task.error {
                        Some(e) => (e.message, e.code.unwrap_or_default()),
                        None => (String::new(), String::new()),
                    };
                    bail!(
                        "search engine task {} {}: {} {}",
                        uid,
                        task.status,
                        code,
                        message
                    );
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "search engine task {} still {} after {:?}",
                    uid,
                    task.status,
                    self.task_timeout
                );
            }
            debug!(task = uid, status = %task.status, "waiting for search engine task");
            tokio::time::sleep(self.task_poll).await;
        }
    }

    /// Send a request with retry/backoff and return the JSON reply.
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(5));
                debug!(%url, attempt, ?delay, "retrying search engine request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let text = response.text().await?;
                        if text.trim().is_empty() {
                            return Ok(Value::Null);
                        }
                        return serde_json::from_str(&text)
                            .with_context(|| format!("Invalid JSON from {}", url));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(%url, %status, attempt, "search engine transient error");
                        last_err = Some(anyhow::anyhow!(
                            "search engine error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    bail!("search engine error {}: {}", status, body_text);
                }
                Err(e) => {
                    warn!(%url, attempt, error = %e, "search engine unreachable");
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("search request failed after retries")))
    }
}

fn search_body(query: &str, filter: Option<&Filter>) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("q".to_string(), Value::String(query.to_string()));
    if let Some(f) = filter {
        let rendered = f.render();
        if !rendered.is_empty() {
            body.insert("filter".to_string(), Value::String(rendered));
        }
    }
    body
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn search_facet(
        &self,
        index: &str,
        query: &str,
        filter: Option<&Filter>,
        facets: &[&str],
    ) -> Result<FacetCounts> {
        let mut body = search_body(query, filter);
        body.insert("facets".to_string(), json!(facets));
        body.insert("limit".to_string(), json!(0));

        let reply = self
            .post(&format!("/indexes/{}/search", index), &Value::Object(body))
            .await?;
        let parsed: SearchResponse =
            serde_json::from_value(reply).context("Invalid search response")?;
        Ok(parsed.facet_distribution.unwrap_or_default())
    }

    async fn search_paged(
        &self,
        index: &str,
        query: &str,
        filter: Option<&Filter>,
        page: Page,
    ) -> Result<SearchPage> {
        let mut body = search_body(query, filter);
        body.insert("page".to_string(), json!(page.wire_number()));
        body.insert("hitsPerPage".to_string(), json!(page.size));

        let reply = self
            .post(&format!("/indexes/{}/search", index), &Value::Object(body))
            .await?;
        let parsed: SearchResponse =
            serde_json::from_value(reply).context("Invalid search response")?;

        let page = match parsed.page {
            Some(number) => Page::from_wire(number, parsed.hits_per_page.unwrap_or(page.size)),
            None => page,
        };
        let total_hits = parsed
            .total_hits
            .or(parsed.estimated_total_hits)
            .unwrap_or(parsed.hits.len() as u64);
        Ok(SearchPage {
            hits: parsed.hits,
            total_hits,
            page,
        })
    }

    async fn upsert_batch(&self, index: &str, records: &[IndexRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let docs: Vec<Value> = records
            .iter()
            .map(|r| Value::Object(r.to_document()))
            .collect();
        self.write(
            &format!("/indexes/{}/documents?primaryKey=id", index),
            &Value::Array(docs),
        )
        .await
        .with_context(|| format!("Failed to upsert {} records into {}", records.len(), index))?;
        Ok(())
    }

    async fn delete_batch(&self, index: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.write(
            &format!("/indexes/{}/documents/delete-batch", index),
            &json!(ids),
        )
        .await
        .with_context(|| format!("Failed to delete {} records from {}", ids.len(), index))?;
        Ok(())
    }

    async fn delete_by_filter(&self, index: &str, filter: &Filter) -> Result<()> {
        let rendered = filter.render();
        if rendered.is_empty() {
            bail!("refusing to delete from {} with an empty filter", index);
        }
        self.write(
            &format!("/indexes/{}/documents/delete", index),
            &json!({ "filter": rendered }),
        )
        .await
        .with_context(|| format!("Failed to delete from {} by filter", index))?;
        Ok(())
    }
}
