//! The document store: keeps the sidecar index consistent with the document
//! tree across every mutation.
//!
//! Each mutating operation runs under the index lock. The filesystem step
//! always comes first; the index is only touched once it succeeded, and if
//! persisting the index fails afterwards a reversible filesystem step is undone
//! so the two never drift apart.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::access::{authorize, Action};
use crate::config::StoreConfig;
use crate::error::{IoContext, Result, StoreError};
use crate::index::{Index, IndexFile, IndexGuard, Owner, Record};
use crate::naming::{
    check_name, extension_of, join_key, normalize_document_name, split_key, validate_relative_path,
};
use crate::render::{self, RenderResult};
use crate::walker::{Entry, ListOptions, TreeWalker};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One file of an upload request.
#[derive(Clone, Debug)]
pub struct Upload {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug)]
pub struct ItemError {
    pub item: String,
    pub error: StoreError,
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.item, self.error)
    }
}

/// Outcome of a batch operation. Failed items never stop the batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub success_count: usize,
    pub errors: Vec<ItemError>,
}

impl BatchReport {
    fn record(&mut self, item: &str, result: Result<()>) {
        match result {
            Ok(()) => self.success_count += 1,
            Err(error) => {
                warn!(item, %error, "batch item skipped");
                self.errors.push(ItemError {
                    item: item.to_string(),
                    error,
                });
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A document's metadata together with its text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    pub path: String,
    pub record: Record,
    pub content: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records dropped because their file is gone.
    pub orphaned: usize,
    /// Default records added for files without one.
    pub untracked: usize,
    /// Legacy file-name keys moved to the full path of their file.
    pub migrated: usize,
}

/// Converts line endings to `\n` and strips trailing whitespace from every line.
pub fn normalize_text(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

fn occupied(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn write_new(path: &Path, bytes: &[u8], key: &str) -> Result<()> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(StoreError::NameConflict(key.to_string()))
        }
        Err(e) => return Err(StoreError::io(key, e)),
    };
    if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(StoreError::io(key, e));
    }
    Ok(())
}

fn write_replace(path: &Path, bytes: &[u8], key: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).at(key)?;
    tmp.write_all(bytes).at(key)?;
    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions()).at(key)?;
    }
    tmp.as_file().sync_all().at(key)?;
    tmp.persist(path).map_err(|e| StoreError::io(key, e.error))?;
    Ok(())
}

/// Rebuilds an argument error so it can be reported against every item of a
/// batch.
fn replicate(error: &StoreError) -> StoreError {
    match error {
        StoreError::NotFound(s) => StoreError::NotFound(s.clone()),
        StoreError::NameConflict(s) => StoreError::NameConflict(s.clone()),
        StoreError::InvalidName(s) => StoreError::InvalidName(s.clone()),
        StoreError::Unauthorized { action, target } => StoreError::Unauthorized {
            action: *action,
            target: target.clone(),
        },
        StoreError::DirectoryNotEmpty(s) => StoreError::DirectoryNotEmpty(s.clone()),
        StoreError::InvalidMove(s) => StoreError::InvalidMove(s.clone()),
        StoreError::Io { path, source } => {
            StoreError::io(path, io::Error::new(source.kind(), source.to_string()))
        }
    }
}

/// Persists the index; on failure restores the in-memory copy and runs `undo`
/// to revert the filesystem step.
fn commit_or_undo(index: &mut IndexGuard<'_>, before: Index, undo: impl FnOnce()) -> Result<()> {
    if let Err(e) = index.commit() {
        **index = before;
        undo();
        return Err(e);
    }
    Ok(())
}

/// Moves records keyed by a bare file name with no file at the root onto every
/// untracked file below the root that carries that name. Returns how many
/// records were written.
fn migrate_legacy_keys(index: &mut Index, files: &HashSet<String>) -> usize {
    let legacy: Vec<String> = index
        .iter()
        .map(|(key, _)| key)
        .filter(|key| !key.contains('/') && !files.contains(key.as_str()))
        .cloned()
        .collect();
    if legacy.is_empty() {
        return 0;
    }

    let mut by_name: HashMap<&str, Vec<&String>> = HashMap::new();
    for path in files.iter().filter(|p| p.contains('/') && !index.contains(p)) {
        by_name.entry(split_key(path).1).or_default().push(path);
    }

    let mut migrated = 0;
    for key in legacy {
        let Some(paths) = by_name.get(key.as_str()) else {
            continue;
        };
        if let Some(record) = index.remove(&key) {
            for path in paths {
                index.put((*path).clone(), record.clone());
                migrated += 1;
            }
        }
    }
    migrated
}

fn with_extension(name: &str, ext: Option<&str>) -> String {
    match ext {
        Some(ext) if !name.ends_with(&format!(".{ext}")) => format!("{name}.{ext}"),
        _ => name.to_string(),
    }
}

pub struct DocumentStore {
    root: PathBuf,
    index: IndexFile,
    walker: TreeWalker,
}

impl DocumentStore {
    /// Opens the store described by `config`, creating the document tree if
    /// it does not exist yet. Records a legacy sidecar keyed by bare file name
    /// are moved to full paths before anything is served.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.upload_dir).at(config.upload_dir.display())?;
        let store = Self::new(&config.upload_dir, &config.index_path);
        store.adopt_legacy_keys()?;
        Ok(store)
    }

    fn adopt_legacy_keys(&self) -> Result<usize> {
        let mut index = self.index.lock()?;
        if !index.iter().any(|(key, _)| !key.contains('/')) {
            return Ok(0);
        }
        let files: HashSet<String> = self.walker.files()?.into_iter().collect();
        let migrated = migrate_legacy_keys(&mut index, &files);
        if migrated > 0 {
            index.commit()?;
            info!(migrated, "legacy index keys moved to full paths");
        }
        Ok(migrated)
    }

    pub fn new(root: impl Into<PathBuf>, index_path: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            walker: TreeWalker::new(root.clone()),
            index: IndexFile::new(index_path),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_file(&self) -> &IndexFile {
        &self.index
    }

    fn existing_dir(&self, dir: &str) -> Result<(String, PathBuf)> {
        let dir = validate_relative_path(dir)?;
        let abs = if dir.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&dir)
        };
        if !abs.is_dir() {
            return Err(StoreError::NotFound(if dir.is_empty() { "/".into() } else { dir }));
        }
        Ok((dir, abs))
    }

    fn file_key(&self, path: &str) -> Result<String> {
        let key = validate_relative_path(path)?;
        if key.is_empty() {
            return Err(StoreError::InvalidName(path.to_string()));
        }
        Ok(key)
    }

    fn existing_file(&self, path: &str) -> Result<(String, PathBuf)> {
        let key = self.file_key(path)?;
        let abs = self.root.join(&key);
        if !abs.is_file() {
            return Err(StoreError::NotFound(key));
        }
        Ok((key, abs))
    }

    fn check(record: &Record, token: Option<&str>, action: Action, key: &str) -> Result<()> {
        if authorize(record, token, action).is_allowed() {
            Ok(())
        } else {
            Err(StoreError::Unauthorized {
                action,
                target: key.to_string(),
            })
        }
    }

    /// Creates an empty document. Names without a previewable extension get
    /// `.md` appended.
    pub fn create(&self, dir: &str, name: &str, owner: Owner) -> Result<Record> {
        let name = normalize_document_name(name);
        check_name(&name)?;
        let (dir, abs_dir) = self.existing_dir(dir)?;
        let key = join_key(&dir, &name);
        let path = abs_dir.join(&name);

        let mut index = self.index.lock()?;
        write_new(&path, b"", &key)?;
        let before = Index::clone(&index);
        let record = Record::new(&name, owner, now());
        index.put(key.clone(), record.clone());
        commit_or_undo(&mut index, before, || {
            let _ = fs::remove_file(&path);
        })?;
        info!(path = %key, "document created");
        Ok(record)
    }

    /// Stores every upload independently; a bad item is reported and skipped.
    pub fn upload_batch(&self, dir: &str, files: &[Upload], owner: &Owner) -> BatchReport {
        let mut report = BatchReport::default();
        let target = self.existing_dir(dir);
        let mut index = match self.index.lock() {
            Ok(index) => index,
            Err(e) => {
                for file in files {
                    report.record(&file.name, Err(replicate(&e)));
                }
                return report;
            }
        };
        let now = now();
        for file in files {
            let result = match &target {
                Ok((dir, abs_dir)) => self.upload_one(&mut index, dir, abs_dir, file, owner, now),
                Err(e) => Err(replicate(e)),
            };
            report.record(&file.name, result);
        }
        info!(dir, stored = report.success_count, failed = report.errors.len(), "upload finished");
        report
    }

    fn upload_one(
        &self,
        index: &mut IndexGuard<'_>,
        dir: &str,
        abs_dir: &Path,
        file: &Upload,
        owner: &Owner,
        now: i64,
    ) -> Result<()> {
        check_name(&file.name)?;
        let key = join_key(dir, &file.name);
        let path = abs_dir.join(&file.name);
        write_new(&path, &file.bytes, &key)?;
        let before = (**index).clone();
        index.put(key, Record::new(&file.name, owner.clone(), now));
        commit_or_undo(index, before, || {
            let _ = fs::remove_file(&path);
        })
    }

    /// Replaces a document's text.
    pub fn update(&self, path: &str, content: &str, token: Option<&str>) -> Result<Record> {
        let key = self.file_key(path)?;
        let abs = self.root.join(&key);

        let mut index = self.index.lock()?;
        if !abs.is_file() {
            return Err(StoreError::NotFound(key));
        }
        let now = now();
        let mut record = index.resolve(&key, now);
        Self::check(&record, token, Action::Edit, &key)?;

        write_replace(&abs, normalize_text(content).as_bytes(), &key)?;
        record.touch(now);
        index.put(key.clone(), record.clone());
        index.commit()?;
        info!(path = %key, "document updated");
        Ok(record)
    }

    /// Renames a file or directory inside `dir`. A file keeps its extension;
    /// the new key is returned.
    pub fn rename(
        &self,
        dir: &str,
        old_name: &str,
        new_name: &str,
        kind: EntryKind,
        token: Option<&str>,
    ) -> Result<String> {
        check_name(old_name)?;
        let new_name = match kind {
            EntryKind::File => with_extension(new_name.trim(), extension_of(old_name)),
            EntryKind::Directory => new_name.trim().to_string(),
        };
        check_name(&new_name)?;
        let (dir, abs_dir) = self.existing_dir(dir)?;
        let old_key = join_key(&dir, old_name);
        let new_key = join_key(&dir, &new_name);
        let src = abs_dir.join(old_name);
        let dest = abs_dir.join(&new_name);

        let mut index = self.index.lock()?;
        let exists = match kind {
            EntryKind::File => src.is_file(),
            EntryKind::Directory => src.is_dir(),
        };
        if !exists {
            return Err(StoreError::NotFound(old_key));
        }
        if occupied(&dest) {
            return Err(StoreError::NameConflict(new_key));
        }

        let now = now();
        let before = Index::clone(&index);
        match kind {
            EntryKind::File => {
                let mut record = index.resolve(&old_key, now);
                Self::check(&record, token, Action::Rename, &old_key)?;
                fs::rename(&src, &dest).at(&old_key)?;
                index.remove(&old_key);
                record.stored_name = new_name.clone();
                record.display_name = new_name.clone();
                record.touch(now);
                index.put(new_key.clone(), record);
            }
            EntryKind::Directory => {
                fs::rename(&src, &dest).at(&old_key)?;
                if index.rekey_prefix(&old_key, &new_key, None) == 0 {
                    info!(from = %old_key, to = %new_key, "directory renamed");
                    return Ok(new_key);
                }
            }
        }
        commit_or_undo(&mut index, before, || {
            let _ = fs::rename(&dest, &src);
        })?;
        info!(from = %old_key, to = %new_key, "renamed");
        Ok(new_key)
    }

    /// Moves the named entries of `current_dir` into `target_dir`. Personal
    /// documents are never moved.
    pub fn move_batch<S: AsRef<str>>(&self, items: &[S], target_dir: &str, current_dir: &str) -> BatchReport {
        let mut report = BatchReport::default();
        let dirs = self
            .existing_dir(current_dir)
            .and_then(|src| Ok((src, self.existing_dir(target_dir)?)));
        let mut index = match self.index.lock() {
            Ok(index) => index,
            Err(e) => {
                for item in items {
                    report.record(item.as_ref(), Err(replicate(&e)));
                }
                return report;
            }
        };
        let now = now();
        for item in items {
            let name = item.as_ref();
            let result = match &dirs {
                Ok((src, dst)) => self.move_one(&mut index, src, dst, name, now),
                Err(e) => Err(replicate(e)),
            };
            report.record(name, result);
        }
        info!(target_dir, moved = report.success_count, failed = report.errors.len(), "move finished");
        report
    }

    fn move_one(
        &self,
        index: &mut IndexGuard<'_>,
        (src_dir, src_abs): &(String, PathBuf),
        (dst_dir, dst_abs): &(String, PathBuf),
        name: &str,
        now: i64,
    ) -> Result<()> {
        check_name(name)?;
        let src_key = join_key(src_dir, name);
        let dst_key = join_key(dst_dir, name);
        let src = src_abs.join(name);
        let dest = dst_abs.join(name);
        let meta = match fs::symlink_metadata(&src) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound(src_key)),
            Err(e) => return Err(StoreError::io(&src_key, e)),
        };

        let before = (**index).clone();
        if meta.is_dir() {
            if *dst_dir == src_key || dst_dir.starts_with(&format!("{src_key}/")) {
                return Err(StoreError::InvalidMove(src_key));
            }
            if occupied(&dest) {
                return Err(StoreError::NameConflict(dst_key));
            }
            fs::rename(&src, &dest).at(&src_key)?;
            if index.rekey_prefix(&src_key, &dst_key, Some(now)) == 0 {
                return Ok(());
            }
        } else {
            let mut record = index.resolve(&src_key, now);
            Self::check(&record, None, Action::Move, &src_key)?;
            if occupied(&dest) {
                return Err(StoreError::NameConflict(dst_key));
            }
            fs::rename(&src, &dest).at(&src_key)?;
            index.remove(&src_key);
            record.created_at = record.created_at.max(now);
            record.touch(now);
            index.put(dst_key, record);
        }
        commit_or_undo(index, before, || {
            let _ = fs::rename(&dest, &src);
        })
    }

    /// Deletes root-relative paths. Directories go recursively together with
    /// every record below them; files need delete permission.
    pub fn delete_batch<S: AsRef<str>>(&self, items: &[S], token: Option<&str>) -> BatchReport {
        let mut report = BatchReport::default();
        let mut index = match self.index.lock() {
            Ok(index) => index,
            Err(e) => {
                for item in items {
                    report.record(item.as_ref(), Err(replicate(&e)));
                }
                return report;
            }
        };
        for item in items {
            let item = item.as_ref();
            let result = self.delete_one(&mut index, item, token);
            report.record(item, result);
        }
        info!(deleted = report.success_count, failed = report.errors.len(), "delete finished");
        report
    }

    /// Deletes a single file.
    pub fn delete_file(&self, path: &str, token: Option<&str>) -> Result<()> {
        let (key, _) = self.existing_file(path)?;
        let mut index = self.index.lock()?;
        self.delete_one(&mut index, &key, token)
    }

    fn delete_one(&self, index: &mut IndexGuard<'_>, path: &str, token: Option<&str>) -> Result<()> {
        let key = self.file_key(path)?;
        let abs = self.root.join(&key);
        let meta = match fs::symlink_metadata(&abs) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound(key)),
            Err(e) => return Err(StoreError::io(&key, e)),
        };
        if meta.is_dir() {
            return self.remove_tree(index, &key, &abs);
        }

        let record = index.resolve(&key, now());
        Self::check(&record, token, Action::Delete, &key)?;
        fs::remove_file(&abs).at(&key)?;
        if index.remove(&key).is_some() {
            index.commit()?;
        }
        info!(path = %key, "document deleted");
        Ok(())
    }

    fn remove_tree(&self, index: &mut IndexGuard<'_>, key: &str, abs: &Path) -> Result<()> {
        let removed = fs::remove_dir_all(abs);
        let purged = match removed {
            Ok(()) => index.purge_prefix(key),
            Err(_) => self.purge_missing(index, key),
        };
        if purged > 0 {
            index.commit()?;
        }
        removed.at(key)?;
        info!(path = %key, purged, "directory removed");
        Ok(())
    }

    /// Drops the records below `dir` whose file is gone, for a removal that
    /// stopped partway.
    fn purge_missing(&self, index: &mut Index, dir: &str) -> usize {
        let gone: Vec<String> = index
            .keys_under(dir)
            .into_iter()
            .filter(|key| !self.root.join(key).exists())
            .collect();
        for key in &gone {
            index.remove(key);
        }
        gone.len()
    }

    /// Removes a directory and everything below it.
    pub fn remove_dir_recursive(&self, path: &str) -> Result<()> {
        let (key, abs) = self.existing_dir(path)?;
        if key.is_empty() {
            return Err(StoreError::InvalidName(path.to_string()));
        }
        let mut index = self.index.lock()?;
        self.remove_tree(&mut index, &key, &abs)
    }

    pub fn mkdir(&self, dir: &str, name: &str) -> Result<String> {
        let name = name.trim();
        check_name(name)?;
        let (dir, abs_dir) = self.existing_dir(dir)?;
        let key = join_key(&dir, name);
        match fs::create_dir(abs_dir.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::NameConflict(key))
            }
            Err(e) => return Err(StoreError::io(&key, e)),
        }
        info!(path = %key, "directory created");
        Ok(key)
    }

    /// Removes `name` from `dir` only if it is an empty directory.
    pub fn remove_empty_dir(&self, dir: &str, name: &str) -> Result<()> {
        check_name(name)?;
        let (dir, abs_dir) = self.existing_dir(dir)?;
        let key = join_key(&dir, name);
        let abs = abs_dir.join(name);
        if !abs.is_dir() {
            return Err(StoreError::NotFound(key));
        }
        if fs::read_dir(&abs).at(&key)?.next().is_some() {
            return Err(StoreError::DirectoryNotEmpty(key));
        }
        fs::remove_dir(&abs).at(&key)?;
        info!(path = %key, "directory removed");
        Ok(())
    }

    /// Metadata of a document, synthesized if the index has no entry.
    pub fn metadata(&self, path: &str) -> Result<Record> {
        let (key, _) = self.existing_file(path)?;
        Ok(self.index.load()?.resolve(&key, now()))
    }

    pub fn read(&self, path: &str, token: Option<&str>) -> Result<Document> {
        let (key, abs) = self.existing_file(path)?;
        let record = self.index.load()?.resolve(&key, now());
        Self::check(&record, token, Action::ViewContent, &key)?;
        let bytes = fs::read(&abs).at(&key)?;
        Ok(Document {
            content: String::from_utf8_lossy(&bytes).into_owned(),
            path: key,
            record,
        })
    }

    pub fn download(&self, path: &str, token: Option<&str>) -> Result<Vec<u8>> {
        let (key, abs) = self.existing_file(path)?;
        let record = self.index.load()?.resolve(&key, now());
        Self::check(&record, token, Action::ViewContent, &key)?;
        fs::read(&abs).at(&key)
    }

    /// Renders a document by its extension.
    pub fn preview(&self, path: &str, token: Option<&str>) -> Result<RenderResult> {
        let document = self.read(path, token)?;
        let ext = extension_of(split_key(&document.path).1).unwrap_or_default();
        Ok(render::render(&document.content, ext))
    }

    pub fn list(&self, dir: &str, options: &ListOptions) -> Result<Vec<Entry>> {
        let dir = validate_relative_path(dir)?;
        self.walker.list(&self.index.load()?, &dir, options, now())
    }

    pub fn search(&self, keyword: &str) -> Result<Vec<Entry>> {
        self.walker.search(&self.index.load()?, keyword, now())
    }

    pub fn directories(&self) -> Result<Vec<String>> {
        self.walker.list_directories()
    }

    /// Brings the index in line with the tree: drops records without a file,
    /// adds default records for untracked files, and moves legacy keys that
    /// are a bare file name to the path of the one file carrying that name.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let mut index = self.index.lock()?;
        let files: HashSet<String> = self.walker.files()?.into_iter().collect();
        let mut report = ReconcileReport {
            migrated: migrate_legacy_keys(&mut index, &files),
            ..ReconcileReport::default()
        };

        let orphans: Vec<String> = index
            .iter()
            .filter(|(key, _)| !files.contains(key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        for orphan in &orphans {
            index.remove(orphan);
        }
        report.orphaned = orphans.len();

        let mut untracked: Vec<&String> = files.iter().filter(|f| !index.contains(f)).collect();
        untracked.sort();
        let now = now();
        for path in untracked {
            index.put(path.clone(), Record::new(split_key(path).1, Owner::Shared, now));
            report.untracked += 1;
        }

        if report != ReconcileReport::default() {
            index.commit()?;
        }
        info!(
            orphaned = report.orphaned,
            untracked = report.untracked,
            migrated = report.migrated,
            "index reconciled"
        );
        Ok(report)
    }
}
