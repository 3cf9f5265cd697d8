use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::PrimitiveDateTime;

const SHARD_NAME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]_[month]_[day] [hour].[minute].[second]");

/// A timestamp-named directory of bundle files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shard {
    pub name: String,
    pub path: PathBuf,
    #[serde(skip)]
    pub captured_at: Option<PrimitiveDateTime>,
}

/// Parse a shard directory name such as `2020_06_01 00.00.00`.
#[must_use]
pub fn parse_shard_timestamp(name: &str) -> Option<PrimitiveDateTime> {
    PrimitiveDateTime::parse(name, SHARD_NAME_FORMAT).ok()
}

/// Newest shard first. Undated shards follow every dated one, by name.
fn compare_shards(a: &Shard, b: &Shard) -> Ordering {
    match (a.captured_at, b.captured_at) {
        (Some(left), Some(right)) => right.cmp(&left).then_with(|| a.name.cmp(&b.name)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.name.cmp(&b.name),
    }
}

#[derive(Debug, Clone)]
pub struct ShardScheduler {
    root: PathBuf,
}

impl ShardScheduler {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shard directories under the backup root in processing order.
    ///
    /// # Errors
    /// Returns an error when the root is missing or cannot be listed.
    pub fn shards(&self) -> Result<Vec<Shard>> {
        if !self.root.is_dir() {
            return Err(anyhow!("backup root is not a directory: {}", self.root.display()));
        }

        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to list backup root {}", self.root.display()))?;
        let mut shards = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("skipping unreadable entry in {}: {}", self.root.display(), err);
                    continue;
                }
            };
            match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => {}
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!("skipping {}: {}", entry.path().display(), err);
                    continue;
                }
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let captured_at = parse_shard_timestamp(&name);
            if captured_at.is_none() {
                tracing::debug!("shard name {} has no capture timestamp", name);
            }
            shards.push(Shard { name, path: entry.path(), captured_at });
        }

        shards.sort_by(compare_shards);
        Ok(shards)
    }

    /// Bundle files inside one shard, by name.
    ///
    /// # Errors
    /// Returns an error when the shard directory cannot be listed.
    pub fn files(shard: &Shard) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&shard.path)
            .with_context(|| format!("failed to list shard {}", shard.path.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("skipping unreadable entry in {}: {}", shard.path.display(), err);
                    continue;
                }
            };
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            match entry.file_type() {
                Ok(file_type) if file_type.is_file() => files.push(entry.path()),
                Ok(_) => {}
                Err(err) => tracing::warn!("skipping {}: {}", entry.path().display(), err),
            }
        }

        files.sort();
        Ok(files)
    }
}

/// File names already persisted during this run.
#[derive(Debug, Clone, Default)]
pub struct RunCheckpoint {
    done: BTreeSet<String>,
}

impl RunCheckpoint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_done(&self, file_name: &str) -> bool {
        self.done.contains(file_name)
    }

    /// Returns `false` when the name was already marked.
    pub fn mark_done(&mut self, file_name: &str) -> bool {
        self.done.insert(file_name.to_string())
    }

    pub fn seed<I, S>(&mut self, file_names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.done.extend(file_names.into_iter().map(Into::into));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.done.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }
}
