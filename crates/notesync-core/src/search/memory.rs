//! In-memory [`SearchIndex`] for tests and local runs.
//!
//! Filters are rendered to the engine grammar and parsed back before
//! evaluation, so escaping behaves as it would against a remote engine.
//! Every upsert/delete call bumps a write counter.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::filter::{self, Filter};
use crate::models::IndexRecord;

use super::{FacetCounts, Page, SearchIndex, SearchPage};

type Documents = BTreeMap<String, Map<String, Value>>;

pub struct InMemorySearchIndex {
    indexes: RwLock<HashMap<String, Documents>>,
    writes: AtomicU64,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of write calls (upserts and deletes) received so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Map<String, Value>> {
        self.indexes
            .read()
            .ok()
            .and_then(|idx| idx.get(index).and_then(|docs| docs.get(id).cloned()))
    }

    pub fn count(&self, index: &str) -> usize {
        self.indexes
            .read()
            .map(|idx| idx.get(index).map(|d| d.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn matching(
        &self,
        index: &str,
        query: &str,
        filter: Option<&Filter>,
    ) -> Result<Vec<Map<String, Value>>> {
        let parsed = match filter {
            Some(f) => {
                let rendered = f.render();
                if rendered.is_empty() {
                    None
                } else {
                    Some(filter::parse(&rendered)?)
                }
            }
            None => None,
        };
        let needle = query.trim().to_lowercase();
        let indexes = self
            .indexes
            .read()
            .map_err(|_| anyhow!("search index lock poisoned"))?;
        let Some(docs) = indexes.get(index) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .values()
            .filter(|d| parsed.as_ref().map_or(true, |f| f.matches(d)))
            .filter(|d| needle.is_empty() || text_matches(d, &needle))
            .cloned()
            .collect())
    }
}

impl Default for InMemorySearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn text_matches(doc: &Map<String, Value>, needle: &str) -> bool {
    doc.values().any(|v| match v {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(items) => items
            .iter()
            .any(|i| i.as_str().is_some_and(|s| s.to_lowercase().contains(needle))),
        _ => false,
    })
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn search_facet(
        &self,
        index: &str,
        query: &str,
        filter: Option<&Filter>,
        facets: &[&str],
    ) -> Result<FacetCounts> {
        let hits = self.matching(index, query, filter)?;
        let mut counts = FacetCounts::new();
        for facet in facets {
            let entry = counts.entry(facet.to_string()).or_default();
            for hit in &hits {
                let values: Vec<String> = match hit.get(*facet) {
                    Some(Value::Array(items)) => items.iter().map(facet_value).collect(),
                    Some(Value::Null) | None => Vec::new(),
                    Some(v) => vec![facet_value(v)],
                };
                for v in values {
                    *entry.entry(v).or_insert(0) += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn search_paged(
        &self,
        index: &str,
        query: &str,
        filter: Option<&Filter>,
        page: Page,
    ) -> Result<SearchPage> {
        let hits = self.matching(index, query, filter)?;
        let total_hits = hits.len() as u64;
        Ok(SearchPage {
            hits: hits
                .into_iter()
                .skip(page.offset())
                .take(page.size)
                .collect(),
            total_hits,
            page,
        })
    }

    async fn upsert_batch(&self, index: &str, records: &[IndexRecord]) -> Result<()> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| anyhow!("search index lock poisoned"))?;
        let docs = indexes.entry(index.to_string()).or_default();
        for r in records {
            docs.insert(r.id.clone(), r.to_document());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_batch(&self, index: &str, ids: &[String]) -> Result<()> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| anyhow!("search index lock poisoned"))?;
        if let Some(docs) = indexes.get_mut(index) {
            for id in ids {
                docs.remove(id);
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_by_filter(&self, index: &str, filter: &Filter) -> Result<()> {
        let parsed = filter::parse(&filter.render())?;
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| anyhow!("search index lock poisoned"))?;
        if let Some(docs) = indexes.get_mut(index) {
            docs.retain(|_, d| !parsed.matches(d));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn facet_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, body: Value) -> IndexRecord {
        IndexRecord {
            id: id.to_string(),
            body: body.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_escaped_filter_matches_literally() {
        let index = InMemorySearchIndex::new();
        index
            .upsert_batch(
                "notes",
                &[
                    record("1", json!({"ownerId": "o'brien"})),
                    record("2", json!({"ownerId": "a\\b"})),
                    record("3", json!({"ownerId": "x' OR 'a' = 'a"})),
                ],
            )
            .await
            .unwrap();

        let page = index
            .search_paged("notes", "", Some(&Filter::eq("ownerId", "o'brien")), Page::first(10))
            .await
            .unwrap();
        assert_eq!(page.ids(), vec!["1"]);

        let page = index
            .search_paged("notes", "", Some(&Filter::eq("ownerId", "a\\b")), Page::first(10))
            .await
            .unwrap();
        assert_eq!(page.ids(), vec!["2"]);

        let page = index
            .search_paged("notes", "", Some(&Filter::eq("ownerId", "x' OR 'a' = 'a")), Page::first(10))
            .await
            .unwrap();
        assert_eq!(page.ids(), vec!["3"]);
    }

    #[tokio::test]
    async fn test_paging_and_facets() {
        let index = InMemorySearchIndex::new();
        let records: Vec<IndexRecord> = (0..5)
            .map(|i| record(&format!("n{}", i), json!({"tags": ["a", format!("t{}", i % 2)]})))
            .collect();
        index.upsert_batch("notes", &records).await.unwrap();

        let page = index
            .search_paged("notes", "", None, Page::new(1, 2))
            .await
            .unwrap();
        assert_eq!(page.total_hits, 5);
        assert_eq!(page.ids(), vec!["n2", "n3"]);

        let facets = index
            .search_facet("notes", "", None, &["tags"])
            .await
            .unwrap();
        assert_eq!(facets["tags"]["a"], 5);
        assert_eq!(facets["tags"]["t0"], 3);
        assert_eq!(facets["tags"]["t1"], 2);
    }

    #[tokio::test]
    async fn test_delete_by_filter_and_existing_ids() {
        let index = InMemorySearchIndex::new();
        index
            .upsert_batch(
                "notes",
                &[
                    record("1", json!({"ownerId": "u1"})),
                    record("2", json!({"ownerId": "u2"})),
                ],
            )
            .await
            .unwrap();

        let ids = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        assert_eq!(index.existing_ids("notes", &ids).await.unwrap(), vec!["1", "2"]);

        index
            .delete_by_filter("notes", &Filter::eq("ownerId", "u1"))
            .await
            .unwrap();
        assert_eq!(index.existing_ids("notes", &ids).await.unwrap(), vec!["2"]);
        assert_eq!(index.writes(), 2);
    }
}
