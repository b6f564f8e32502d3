//! Conversation history
//!
//! Append-only message log. Every entry carries a `<meta>historyId:N</meta>`
//! prefix so the model (and commands) can address it later.
//!
//! # Storage
//!
//! When opened from a path the log is written to that file as JSON after
//! every mutation (temp file + rename). Reloading seeds the id counter from
//! the largest id found so new ids never collide.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

lazy_static! {
    static ref META_RE: Regex = Regex::new(r"^<meta>([^<]*)</meta>").expect("valid regex");
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history IO failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("history file {path} is corrupted: {source}")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Role of message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Metadata embedded at the front of an entry's content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMeta {
    pub history_id: u64,
    pub extra: Vec<(String, String)>,
}

impl HistoryMeta {
    pub fn new(history_id: u64) -> Self {
        Self {
            history_id,
            extra: Vec::new(),
        }
    }

    pub fn render(&self) -> String {
        let mut tag = format!("<meta>historyId:{}", self.history_id);
        for (key, value) in &self.extra {
            tag.push_str(&format!(",{}:{}", key, value));
        }
        tag.push_str("</meta>");
        tag
    }

    /// Extract the leading tag, returning it with the remaining text
    pub fn extract(content: &str) -> Option<(Self, &str)> {
        let captures = META_RE.captures(content)?;
        let whole = captures.get(0)?;
        let mut history_id = None;
        let mut extra = Vec::new();
        for pair in captures.get(1)?.as_str().split(',') {
            let Some((key, value)) = pair.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key == "historyId" {
                history_id = value.parse().ok();
            } else {
                extra.push((key.to_string(), value.to_string()));
            }
        }
        Some((
            Self {
                history_id: history_id?,
                extra,
            },
            &content[whole.end()..],
        ))
    }
}

/// Strip a leading metadata tag, if present
pub fn strip_meta(content: &str) -> &str {
    match META_RE.find(content) {
        Some(tag) => &content[tag.end()..],
        None => content,
    }
}

/// Single entry in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationItem {
    pub fn meta(&self) -> Option<HistoryMeta> {
        HistoryMeta::extract(&self.content).map(|(meta, _)| meta)
    }

    pub fn history_id(&self) -> Option<u64> {
        self.meta().map(|meta| meta.history_id)
    }

    /// Content without its metadata tag
    pub fn text(&self) -> &str {
        strip_meta(&self.content)
    }
}

/// Append-only, addressable message log
#[derive(Debug, Default)]
pub struct ConversationHistory {
    items: Vec<ConversationItem>,
    next_id: u64,
    path: Option<PathBuf>,
}

impl ConversationHistory {
    /// Log that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            items: Vec::new(),
            next_id: 1,
            path: None,
        }
    }

    /// Open (or start) a log persisted at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let items: Vec<ConversationItem> = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| HistoryError::Corrupted {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(HistoryError::Io { path, source }),
        };

        let max_id = items.iter().filter_map(ConversationItem::history_id).max().unwrap_or(0);
        info!(path = %path.display(), entries = items.len(), max_id, "loaded history");
        Ok(Self {
            items,
            next_id: max_id + 1,
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn items(&self) -> &[ConversationItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last(&self) -> Option<&ConversationItem> {
        self.items.last()
    }

    /// Append a message, returning its fresh history id
    pub async fn append(&mut self, role: Role, content: &str) -> Result<u64, HistoryError> {
        self.append_with(role, content, Vec::new()).await
    }

    /// Append a message with extra metadata pairs
    pub async fn append_with(
        &mut self,
        role: Role,
        content: &str,
        extra: Vec<(String, String)>,
    ) -> Result<u64, HistoryError> {
        let history_id = self.next_id.max(1);
        self.next_id = history_id + 1;

        let meta = HistoryMeta { history_id, extra };
        self.items.push(ConversationItem {
            role,
            content: format!("{}{}", meta.render(), content),
            timestamp: Utc::now(),
        });
        debug!(history_id, role = role.as_str(), "appended history entry");

        self.persist().await?;
        Ok(history_id)
    }

    pub fn get_by_history_id(&self, history_id: u64) -> Option<&ConversationItem> {
        self.items
            .iter()
            .find(|item| item.history_id() == Some(history_id))
    }

    /// Drop every entry whose id is listed; returns how many went
    pub async fn delete_by_ids(&mut self, ids: &[u64]) -> Result<usize, HistoryError> {
        let before = self.items.len();
        self.items
            .retain(|item| item.history_id().map_or(true, |id| !ids.contains(&id)));
        let removed = before - self.items.len();
        if removed > 0 {
            info!(removed, "deleted history entries");
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Keep the first entry, drop an even-sized slice after it.
    ///
    /// Removing an even count keeps user/assistant alternation intact.
    pub async fn truncate_half(&mut self) -> Result<usize, HistoryError> {
        let remove = (self.items.len() / 4) * 2;
        if remove == 0 {
            return Ok(0);
        }
        self.items.drain(1..1 + remove);
        info!(removed = remove, remaining = self.items.len(), "truncated history");
        self.persist().await?;
        Ok(remove)
    }

    async fn persist(&self) -> Result<(), HistoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| HistoryError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(&self.items).map_err(|source| HistoryError::Corrupted {
            path: path.clone(),
            source,
        })?;
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, json).await.map_err(io_err)?;
        tokio::fs::rename(&temp, path).await.map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn alternating(count: usize) -> ConversationHistory {
        let mut history = ConversationHistory::in_memory();
        for i in 0..count {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            history.append(role, &format!("message {}", i)).await.unwrap();
        }
        history
    }

    #[test]
    fn test_meta_roundtrip_and_strip() {
        let meta = HistoryMeta {
            history_id: 42,
            extra: vec![("kind".to_string(), "summary".to_string())],
        };
        let content = format!("{}hello", meta.render());
        assert_eq!(content, "<meta>historyId:42,kind:summary</meta>hello");

        let (parsed, rest) = HistoryMeta::extract(&content).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(rest, "hello");
        assert_eq!(strip_meta(&content), "hello");
        assert_eq!(strip_meta("no tag"), "no tag");
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_ids() {
        let mut history = ConversationHistory::in_memory();
        let first = history.append(Role::User, "task").await.unwrap();
        let second = history.append(Role::Assistant, "reply").await.unwrap();
        assert!(second > first);

        let item = history.get_by_history_id(second).unwrap();
        assert_eq!(item.role, Role::Assistant);
        assert_eq!(item.text(), "reply");
        assert!(history.get_by_history_id(99).is_none());
    }

    #[tokio::test]
    async fn test_delete_by_ids() {
        let mut history = alternating(5).await;
        let removed = history.delete_by_ids(&[2, 3, 40]).await.unwrap();
        assert_eq!(removed, 2);

        let ids: Vec<u64> = history.items().iter().filter_map(ConversationItem::history_id).collect();
        assert_eq!(ids, vec![1, 4, 5]);
    }

    #[tokio::test]
    async fn test_truncate_half_keeps_first_and_alternation() {
        for count in [1usize, 2, 3, 4, 7, 10, 13] {
            let mut history = alternating(count).await;
            let removed = history.truncate_half().await.unwrap();
            assert_eq!(removed, (count / 4) * 2);
            assert_eq!(history.len(), count - removed);

            let items = history.items();
            assert_eq!(items[0].text(), "message 0");
            for pair in items.windows(2) {
                assert_ne!(pair[0].role, pair[1].role, "alternation broken for {count}");
            }
        }
    }

    #[tokio::test]
    async fn test_reload_seeds_counter() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.json");

        {
            let mut history = ConversationHistory::open(&path).await.unwrap();
            history.append(Role::User, "one").await.unwrap();
            history.append(Role::Assistant, "two").await.unwrap();
            history.append(Role::User, "three").await.unwrap();
            history.delete_by_ids(&[1]).await.unwrap();
        }

        let mut reloaded = ConversationHistory::open(&path).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        let next = reloaded.append(Role::Assistant, "four").await.unwrap();
        assert_eq!(next, 4);
    }

    #[tokio::test]
    async fn test_corrupted_file_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = ConversationHistory::open(&path).await.unwrap_err();
        assert!(matches!(err, HistoryError::Corrupted { .. }));
    }
}
