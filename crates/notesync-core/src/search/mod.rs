//! Search engine abstraction.
//!
//! The [`SearchIndex`] trait covers faceted and paged queries plus batched
//! writes. Filters are always passed as typed [`Filter`] values and
//! rendered (with escaping) at the engine boundary.
//!
//! Paging is 0-based everywhere inside notesync. [`Page::wire_number`] is
//! the one place a 1-based engine page number is produced.

pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::filter::Filter;
use crate::models::IndexRecord;

/// Facet name → (value → count).
pub type FacetCounts = BTreeMap<String, BTreeMap<String, u64>>;

/// A 0-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub index: usize,
    pub size: usize,
}

impl Page {
    pub fn new(index: usize, size: usize) -> Self {
        Self { index, size }
    }

    pub fn first(size: usize) -> Self {
        Self { index: 0, size }
    }

    /// Items to skip before this page.
    pub fn offset(&self) -> usize {
        self.index * self.size
    }

    /// The engine's 1-based page number.
    pub fn wire_number(&self) -> usize {
        self.index + 1
    }

    /// Inverse of [`wire_number`](Page::wire_number); page 0 on the wire clamps to the first page.
    pub fn from_wire(number: usize, size: usize) -> Self {
        Self {
            index: number.saturating_sub(1),
            size,
        }
    }
}

/// One page of hits.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub hits: Vec<Map<String, Value>>,
    pub total_hits: u64,
    pub page: Page,
}

impl SearchPage {
    pub fn ids(&self) -> Vec<String> {
        self.hits
            .iter()
            .filter_map(|h| h.get("id").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

/// Abstract search engine client.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`search_facet`](SearchIndex::search_facet) | Facet value counts for a query |
/// | [`search_paged`](SearchIndex::search_paged) | Paged hits for a query |
/// | [`upsert_batch`](SearchIndex::upsert_batch) | Insert or replace records |
/// | [`delete_batch`](SearchIndex::delete_batch) | Delete records by id |
/// | [`delete_by_filter`](SearchIndex::delete_by_filter) | Delete every record matching a filter |
/// | [`existing_ids`](SearchIndex::existing_ids) | Which of the given ids are present |
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn search_facet(
        &self,
        index: &str,
        query: &str,
        filter: Option<&Filter>,
        facets: &[&str],
    ) -> Result<FacetCounts>;

    async fn search_paged(
        &self,
        index: &str,
        query: &str,
        filter: Option<&Filter>,
        page: Page,
    ) -> Result<SearchPage>;

    async fn upsert_batch(&self, index: &str, records: &[IndexRecord]) -> Result<()>;

    async fn delete_batch(&self, index: &str, ids: &[String]) -> Result<()>;

    async fn delete_by_filter(&self, index: &str, filter: &Filter) -> Result<()>;

    async fn existing_ids(&self, index: &str, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = Filter::is_in("id", ids.iter().cloned());
        let page = self
            .search_paged(index, "", Some(&filter), Page::first(ids.len()))
            .await?;
        Ok(page.ids())
    }
}
