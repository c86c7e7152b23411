//! The metadata sidecar: one JSON file mapping each document's root-relative
//! path to its [`Record`].
//!
//! Reads take a snapshot with [`IndexFile::load`]. Writers go through
//! [`IndexFile::lock`], which serializes every read-modify-write sequence in the
//! process and persists with an atomic rename, so a concurrent reader sees
//! either the old or the new file, never a torn one.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tempfile::NamedTempFile;

use crate::error::{IoContext, Result, StoreError};
use crate::naming::split_key;

/// Who may see and change a document.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub enum Owner {
    #[default]
    Shared,
    Restricted(String),
}

impl Owner {
    /// Builds an owner from the upload/create form fields: a personal document
    /// with a blank token falls back to shared.
    pub fn from_request(personal: bool, token: &str) -> Self {
        let token = token.trim();
        if personal && !token.is_empty() {
            Owner::Restricted(token.to_string())
        } else {
            Owner::Shared
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Owner::Shared)
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Shared => f.write_str("Shared"),
            Owner::Restricted(_) => f.write_str("Restricted(..)"),
        }
    }
}

impl Serialize for Owner {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Tagged<'a> {
            restricted: &'a str,
        }
        match self {
            Owner::Shared => serializer.serialize_str("shared"),
            Owner::Restricted(token) => Tagged { restricted: token }.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Owner {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Tagged { restricted: String },
            // legacy sidecars store the bare token
            Plain(String),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Tagged { restricted } => Owner::Restricted(restricted),
            Repr::Plain(s) if s == "shared" || s.is_empty() => Owner::Shared,
            Repr::Plain(s) => Owner::Restricted(s),
        })
    }
}

/// Metadata for one stored document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub stored_name: String,
    #[serde(alias = "original_name")]
    pub display_name: String,
    #[serde(default)]
    pub owner: Owner,
    #[serde(alias = "upload_time", deserialize_with = "timestamp")]
    pub created_at: i64,
    #[serde(alias = "edit_time", deserialize_with = "timestamp")]
    pub modified_at: i64,
}

impl Record {
    pub fn new(name: &str, owner: Owner, now: i64) -> Self {
        Self {
            stored_name: name.to_string(),
            display_name: name.to_string(),
            owner,
            created_at: now,
            modified_at: now,
        }
    }

    /// Records a content or location change. Never moves time backwards.
    pub fn touch(&mut self, now: i64) {
        self.modified_at = self.modified_at.max(now);
    }

    pub fn is_restricted(&self) -> bool {
        !self.owner.is_shared()
    }
}

/// Accepts integer seconds or the decimal strings legacy sidecars wrote.
fn timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Int(i64),
        Text(String),
    }
    match Repr::deserialize(deserializer)? {
        Repr::Int(v) => Ok(v),
        Repr::Text(s) if s.trim().is_empty() => Ok(0),
        Repr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// In-memory view of the sidecar.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Index {
    records: BTreeMap<String, Record>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn put(&mut self, key: impl Into<String>, record: Record) {
        self.records.insert(key.into(), record);
    }

    pub fn remove(&mut self, key: &str) -> Option<Record> {
        self.records.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.records.iter()
    }

    /// The stored record for `key`, or the default a file without an entry is
    /// treated as: shared, named after itself, timestamped `now`. The default
    /// is not inserted.
    pub fn resolve(&self, key: &str, now: i64) -> Record {
        match self.records.get(key) {
            Some(record) => record.clone(),
            None => Record::new(split_key(key).1, Owner::Shared, now),
        }
    }

    /// Keys of every record stored below directory `dir`.
    pub fn keys_under(&self, dir: &str) -> Vec<String> {
        if dir.is_empty() {
            return Vec::new();
        }
        let prefix = format!("{dir}/");
        self.records
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Moves every record below `old_dir` to the same relative position below
    /// `new_dir`. When `touch` is set both timestamps are bumped to it.
    pub fn rekey_prefix(&mut self, old_dir: &str, new_dir: &str, touch: Option<i64>) -> usize {
        let keys = self.keys_under(old_dir);
        for key in &keys {
            if let Some(mut record) = self.records.remove(key) {
                if let Some(now) = touch {
                    record.created_at = record.created_at.max(now);
                    record.touch(now);
                }
                let rest = &key[old_dir.len() + 1..];
                self.records.insert(format!("{new_dir}/{rest}"), record);
            }
        }
        keys.len()
    }

    /// Drops every record below `dir`.
    pub fn purge_prefix(&mut self, dir: &str) -> usize {
        let keys = self.keys_under(dir);
        for key in &keys {
            self.records.remove(key);
        }
        keys.len()
    }

    fn fill_stored_names(&mut self) {
        for (key, record) in self.records.iter_mut() {
            if record.stored_name.is_empty() {
                record.stored_name = split_key(key).1.to_string();
            }
        }
    }
}

/// The sidecar on disk plus the lock that serializes its writers.
pub struct IndexFile {
    path: PathBuf,
    lock: Mutex<()>,
    #[cfg(test)]
    fail_saves: std::sync::atomic::AtomicBool,
}

impl IndexFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            #[cfg(test)]
            fail_saves: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Makes every following save fail until switched off again.
    #[cfg(test)]
    pub(crate) fn fail_saves(&self, on: bool) {
        self.fail_saves.store(on, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn saves_blocked(&self) -> bool {
        self.fail_saves.load(std::sync::atomic::Ordering::SeqCst)
    }

    #[cfg(not(test))]
    fn saves_blocked(&self) -> bool {
        false
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the sidecar. A missing or blank file is an empty index.
    pub fn load(&self) -> Result<Index> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Index::new()),
            Err(e) => return Err(StoreError::io(self.path.display(), e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Index::new());
        }
        let mut index: Index = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::io(self.path.display(), io::Error::new(io::ErrorKind::InvalidData, e)))?;
        index.fill_stored_names();
        tracing::debug!(path = %self.path.display(), entries = index.len(), "index loaded");
        Ok(index)
    }

    /// Writes the whole index to a temporary file next to the sidecar and
    /// renames it into place.
    pub fn save(&self, index: &Index) -> Result<()> {
        if self.saves_blocked() {
            return Err(StoreError::io(self.path.display(), io::Error::other("saves disabled")));
        }
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).at(dir.display())?;

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        index
            .serialize(&mut ser)
            .map_err(|e| StoreError::io(self.path.display(), e.into()))?;

        let mut tmp = NamedTempFile::new_in(dir).at(dir.display())?;
        tmp.write_all(&buf).at(tmp.path().display())?;
        tmp.as_file().sync_all().at(tmp.path().display())?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::io(self.path.display(), e.error))?;
        tracing::debug!(path = %self.path.display(), entries = index.len(), "index saved");
        Ok(())
    }

    /// Takes the writer lock and loads the current index under it.
    pub fn lock(&self) -> Result<IndexGuard<'_>> {
        let guard = self.lock.lock();
        let index = self.load()?;
        Ok(IndexGuard {
            file: self,
            index,
            _guard: guard,
        })
    }
}

/// Exclusive access to the index for one read-modify-write sequence. Changes
/// reach disk only through [`IndexGuard::commit`].
pub struct IndexGuard<'a> {
    file: &'a IndexFile,
    index: Index,
    _guard: MutexGuard<'a, ()>,
}

impl IndexGuard<'_> {
    pub fn commit(&self) -> Result<()> {
        self.file.save(&self.index)
    }
}

impl Deref for IndexGuard<'_> {
    type Target = Index;

    fn deref(&self) -> &Index {
        &self.index
    }
}

impl DerefMut for IndexGuard<'_> {
    fn deref_mut(&mut self) -> &mut Index {
        &mut self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sidecar() -> (tempfile::TempDir, IndexFile) {
        let tempdir = tempfile::tempdir().unwrap();
        let file = IndexFile::new(tempdir.path().join("metadata.json"));
        (tempdir, file)
    }

    #[test]
    fn missing_file_is_empty() {
        let (_dir, file) = sidecar();
        assert!(file.load().unwrap().is_empty());
    }

    #[test]
    fn save_load_roundtrip() {
        let (_dir, file) = sidecar();
        let mut index = Index::new();
        let mut diary = Record::new("日记.md", Owner::Restricted("alice".into()), 1_700_000_000);
        diary.display_name = "我的日记 ✍️.md".into();
        index.put("personal/日记.md", diary);
        index.put("notes.md", Record::new("notes.md", Owner::Shared, 1_700_000_100));
        file.save(&index).unwrap();

        assert_eq!(file.load().unwrap(), index);
        let raw = std::fs::read_to_string(file.path()).unwrap();
        assert!(raw.contains("我的日记"));
        assert!(raw.contains("\"restricted\": \"alice\""));
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let (dir, file) = sidecar();
        file.save(&Index::new()).unwrap();
        file.save(&Index::new()).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("metadata.json")]);
    }

    #[test]
    fn reads_legacy_sidecar() {
        let (_dir, file) = sidecar();
        std::fs::write(
            file.path(),
            r#"{
                "1700000000_plan.md": {
                    "original_name": "plan.md",
                    "upload_time": "1700000000",
                    "edit_time": "1700000500",
                    "owner": "bob"
                },
                "open.md": {
                    "original_name": "open.md",
                    "upload_time": "1700000000",
                    "edit_time": "1700000000",
                    "owner": "shared"
                }
            }"#,
        )
        .unwrap();
        let index = file.load().unwrap();
        let plan = index.get("1700000000_plan.md").unwrap();
        assert_eq!(plan.stored_name, "1700000000_plan.md");
        assert_eq!(plan.display_name, "plan.md");
        assert_eq!(plan.owner, Owner::Restricted("bob".into()));
        assert_eq!(plan.created_at, 1_700_000_000);
        assert_eq!(plan.modified_at, 1_700_000_500);
        assert_eq!(index.get("open.md").unwrap().owner, Owner::Shared);
    }

    #[test]
    fn corrupt_sidecar_is_an_io_failure() {
        let (_dir, file) = sidecar();
        std::fs::write(file.path(), "{ not json").unwrap();
        let err = file.load().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IoFailure);
    }

    #[test]
    fn resolve_synthesizes_without_inserting() {
        let index = Index::new();
        let record = index.resolve("a/b/c.md", 42);
        assert_eq!(record.stored_name, "c.md");
        assert_eq!(record.display_name, "c.md");
        assert_eq!(record.owner, Owner::Shared);
        assert_eq!((record.created_at, record.modified_at), (42, 42));
        assert!(index.is_empty());
    }

    #[test]
    fn prefix_operations_only_touch_descendants() {
        let mut index = Index::new();
        for key in ["a/x.md", "a/b/y.md", "ab/z.md", "a.md"] {
            index.put(key, Record::new(split_key(key).1, Owner::Shared, 1));
        }
        assert_eq!(index.keys_under("a"), vec!["a/b/y.md", "a/x.md"]);

        assert_eq!(index.rekey_prefix("a", "m/a", Some(5)), 2);
        assert!(index.contains("m/a/x.md"));
        assert!(index.contains("m/a/b/y.md"));
        assert_eq!(index.get("m/a/x.md").unwrap().modified_at, 5);
        assert!(index.contains("ab/z.md"));

        assert_eq!(index.purge_prefix("m"), 2);
        assert_eq!(index.len(), 2);
        assert_eq!(index.purge_prefix(""), 0);
    }

    #[test]
    fn owner_debug_hides_token() {
        let owner = Owner::Restricted("secret".into());
        assert!(!format!("{owner:?}").contains("secret"));
    }

    #[test]
    fn owner_from_request() {
        assert_eq!(Owner::from_request(false, "alice"), Owner::Shared);
        assert_eq!(Owner::from_request(true, "  "), Owner::Shared);
        assert_eq!(Owner::from_request(true, " alice "), Owner::Restricted("alice".into()));
    }

    #[test]
    fn touch_never_goes_backwards() {
        let mut record = Record::new("a.md", Owner::Shared, 100);
        record.touch(50);
        assert_eq!(record.modified_at, 100);
        record.touch(150);
        assert_eq!(record.modified_at, 150);
    }
}
