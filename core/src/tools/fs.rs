//! Filesystem collaborator - read, write and search files under a root

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{DownloadProgress, FileOps, ProgressFn, SearchMatch};

const MAX_FILE_SIZE: u64 = 10_000_000; // 10MB max read
const MAX_SEARCH_MATCHES: usize = 200;
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target"];

/// File operations relative to a working directory
#[derive(Debug, Clone)]
pub struct LocalFileOps {
    root: PathBuf,
    http_client: reqwest::Client,
}

impl LocalFileOps {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Files (and directories, when `include_dirs`) below `start`
    async fn walk(&self, start: &Path, recursive: bool, include_dirs: bool) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut pending = vec![start.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("Cannot list directory {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    let name = entry.file_name();
                    if SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                        continue;
                    }
                    if include_dirs {
                        found.push(path.clone());
                    }
                    if recursive {
                        pending.push(path);
                    }
                } else {
                    found.push(path);
                }
            }
        }

        found.sort();
        Ok(found)
    }
}

#[async_trait]
impl FileOps for LocalFileOps {
    async fn read(&self, path: &str) -> Result<String> {
        let full = self.resolve(path);
        if full.is_dir() {
            bail!("'{}' is a directory, not a file", path);
        }

        let metadata = tokio::fs::metadata(&full)
            .await
            .with_context(|| format!("Cannot access file {}", path))?;
        if metadata.len() > MAX_FILE_SIZE {
            bail!("File too large: {} bytes (max {})", metadata.len(), MAX_FILE_SIZE);
        }

        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Error reading file {}", path))
    }

    async fn create(&self, path: &str, content: &str) -> Result<String> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Cannot create directory")?;
        }
        tokio::fs::write(&full, content)
            .await
            .with_context(|| format!("Error writing file {}", path))?;
        Ok(format!("File written successfully: {}", path))
    }

    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        let full = self.resolve(path);
        let entries = self.walk(&full, recursive, true).await?;
        Ok(entries
            .iter()
            .map(|entry| {
                let shown = self.display(entry);
                if entry.is_dir() {
                    format!("{}/", shown)
                } else {
                    shown
                }
            })
            .collect())
    }

    async fn search(&self, path: &str, pattern: &str) -> Result<Vec<SearchMatch>> {
        let regex = Regex::new(pattern).with_context(|| format!("Invalid search pattern '{}'", pattern))?;
        let full = self.resolve(path);
        let files = if full.is_file() {
            vec![full]
        } else {
            self.walk(&full, true, false).await?
        };

        let mut matches = Vec::new();
        for file in files {
            // Binary or unreadable files are not searchable.
            let Ok(content) = tokio::fs::read_to_string(&file).await else {
                continue;
            };
            for (index, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(SearchMatch {
                        path: self.display(&file),
                        line: index + 1,
                        text: line.trim().to_string(),
                    });
                    if matches.len() >= MAX_SEARCH_MATCHES {
                        return Ok(matches);
                    }
                }
            }
        }
        Ok(matches)
    }

    async fn edit(&self, path: &str, search: &str, replace: &str) -> Result<String> {
        if search.is_empty() {
            bail!("Search text must not be empty");
        }
        let original = self.read(path).await?;
        if !original.contains(search) {
            bail!("Search text not found in {}", path);
        }
        let updated = original.replacen(search, replace, 1);
        tokio::fs::write(self.resolve(path), updated)
            .await
            .with_context(|| format!("Error writing file {}", path))?;
        Ok(format!("Edited {}", path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<String> {
        let target = self.resolve(to);
        if target.exists() {
            bail!("Target '{}' already exists", to);
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.resolve(from), &target)
            .await
            .with_context(|| format!("Cannot rename {} to {}", from, to))?;
        Ok(format!("Renamed {} to {}", from, to))
    }

    async fn download(&self, url: &str, path: &str, progress: Option<ProgressFn>) -> Result<String> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?;
        if !response.status().is_success() {
            bail!("Download failed with status: {}", response.status());
        }

        let total = response.content_length();
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&full)
            .await
            .with_context(|| format!("Cannot create {}", path))?;

        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read chunk")?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(report) = &progress {
                report(DownloadProgress { downloaded, total });
            }
        }
        file.flush().await?;

        debug!(url, path, bytes = downloaded, "download finished");
        Ok(format!("Downloaded {} bytes to {}", downloaded, path))
    }
}
