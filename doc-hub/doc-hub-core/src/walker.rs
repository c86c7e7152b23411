//! Read-only traversal of the document tree.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

use crate::error::{IoContext, Result, StoreError};
use crate::index::{Index, Record};
use crate::naming::join_key;

/// Path marker used for the tree root in directory listings.
pub const ROOT_MARKER: &str = "/";

/// One row of a listing or search result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entry {
    File { path: String, record: Record },
    Directory { name: String, path: String },
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::File { record, .. } => &record.display_name,
            Entry::Directory { name, .. } => name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Entry::File { path, .. } | Entry::Directory { path, .. } => path,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Entry::Directory { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    Name,
    Created,
    Modified,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "name" => Ok(SortKey::Name),
            "created" | "upload_time" => Ok(SortKey::Created),
            "modified" | "edit_time" => Ok(SortKey::Modified),
            other => Err(format!("unknown sort key {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub sort: SortKey,
    pub order: SortOrder,
    /// Case-insensitive filter on file display names.
    pub filter: Option<String>,
}

pub struct TreeWalker {
    root: PathBuf,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map_or(true, |name| name.starts_with('.'))
}

impl TreeWalker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }

    fn walk(&self) -> Result<impl Iterator<Item = DirEntry> + '_> {
        if !self.root.is_dir() {
            return Err(StoreError::NotFound(self.root.display().to_string()));
        }
        Ok(WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable tree entry");
                    None
                }
            }))
    }

    /// Every directory in the tree, the root included as [`ROOT_MARKER`].
    pub fn list_directories(&self) -> Result<Vec<String>> {
        let mut dirs: Vec<String> = self
            .walk()?
            .filter(|e| e.file_type().is_dir())
            .filter_map(|e| self.relative(e.path()))
            .map(|rel| if rel.is_empty() { ROOT_MARKER.to_string() } else { rel })
            .collect();
        dirs.sort();
        dirs.dedup();
        Ok(dirs)
    }

    /// Root-relative keys of every regular file in the tree.
    pub fn files(&self) -> Result<Vec<String>> {
        Ok(self
            .walk()?
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| self.relative(e.path()))
            .collect())
    }

    /// Matches `keyword` case-insensitively against directory names and file
    /// display names across the whole tree.
    pub fn search(&self, index: &Index, keyword: &str, now: i64) -> Result<Vec<Entry>> {
        let needle = keyword.trim().to_lowercase();
        let mut hits = Vec::new();
        for entry in self.walk()? {
            if entry.depth() == 0 {
                continue;
            }
            let Some(path) = self.relative(entry.path()) else {
                continue;
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.to_lowercase().contains(&needle) {
                    hits.push(Entry::Directory { name, path });
                }
            } else if file_type.is_file() {
                let record = index.resolve(&path, now);
                if record.display_name.to_lowercase().contains(&needle) {
                    hits.push(Entry::File { path, record });
                }
            }
        }
        Ok(hits)
    }

    /// Children of one directory: directories first by name, then files in the
    /// requested order.
    pub fn list(&self, index: &Index, dir: &str, options: &ListOptions, now: i64) -> Result<Vec<Entry>> {
        let abs = self.root.join(dir);
        if !abs.is_dir() {
            return Err(StoreError::NotFound(dir.to_string()));
        }
        let needle = options.filter.as_deref().map(|f| f.trim().to_lowercase());

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in fs::read_dir(&abs).at(abs.display())? {
            let entry = entry.at(abs.display())?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().at(entry.path().display())?;
            let path = join_key(dir, &name);
            if file_type.is_dir() {
                dirs.push(Entry::Directory { name, path });
            } else if file_type.is_file() {
                let record = index.resolve(&path, now);
                if let Some(needle) = &needle {
                    if !record.display_name.to_lowercase().contains(needle.as_str()) {
                        continue;
                    }
                }
                files.push((path, record));
            }
        }

        dirs.sort_by_key(|e| e.name().to_lowercase());
        files.sort_by(|(_, a), (_, b)| {
            let ordering = compare(a, b, options.sort);
            match options.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });
        dirs.extend(files.into_iter().map(|(path, record)| Entry::File { path, record }));
        Ok(dirs)
    }
}

fn compare(a: &Record, b: &Record, key: SortKey) -> Ordering {
    let by_name = || a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase());
    match key {
        SortKey::Name => by_name(),
        SortKey::Created => a.created_at.cmp(&b.created_at).then_with(by_name),
        SortKey::Modified => a.modified_at.cmp(&b.modified_at).then_with(by_name),
    }
}
