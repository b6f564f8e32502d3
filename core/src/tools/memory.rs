//! In-process memory store
//!
//! Keeps memories for the lifetime of the runtime and ranks search results
//! by how many query terms a memory (or its tags) contains.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{MemoryEntry, MemoryStore};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<Vec<MemoryEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn score(entry: &MemoryEntry, terms: &[String]) -> usize {
    let content = entry.content.to_lowercase();
    terms
        .iter()
        .filter(|term| {
            content.contains(term.as_str()) || entry.tags.iter().any(|tag| tag.to_lowercase() == **term)
        })
        .count()
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn add(&self, content: &str, tags: Vec<String>) -> Result<String> {
        let content = content.trim();
        if content.is_empty() {
            bail!("Memory content must not be empty");
        }
        let id = Uuid::new_v4().to_string();
        self.entries.write().push(MemoryEntry {
            id: id.clone(),
            content: content.to_string(),
            tags,
        });
        Ok(id)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let entries = self.entries.read();
        let mut ranked: Vec<(usize, usize, &MemoryEntry)> = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (score(entry, &terms), index, entry))
            .filter(|(score, _, _)| *score > 0)
            .collect();
        // Best score first; newer memories win ties.
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|(_, _, entry)| entry.clone())
            .collect())
    }
}
