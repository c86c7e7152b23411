use std::path::{Path, PathBuf};

pub const UPLOAD_DIR_NAME: &str = "upload_folder";
pub const INDEX_FILE_NAME: &str = "metadata.json";

/// Where the store keeps its documents and its sidecar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub home: PathBuf,
    pub upload_dir: PathBuf,
    pub index_path: PathBuf,
}

impl StoreConfig {
    /// Lays the tree and the sidecar out side by side under `home`.
    pub fn new(home: impl AsRef<Path>) -> Self {
        let home = home.as_ref().to_path_buf();
        Self {
            upload_dir: home.join(UPLOAD_DIR_NAME),
            index_path: home.join(INDEX_FILE_NAME),
            home,
        }
    }

    /// Reads `DOC_HUB_HOME` (default `.`), then applies the
    /// `DOC_HUB_UPLOAD_DIR` and `DOC_HUB_INDEX` overrides.
    pub fn from_env() -> Self {
        let home = std::env::var("DOC_HUB_HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(home).with_overrides(
            std::env::var("DOC_HUB_UPLOAD_DIR").ok(),
            std::env::var("DOC_HUB_INDEX").ok(),
        )
    }

    pub fn with_overrides(mut self, upload_dir: Option<String>, index_path: Option<String>) -> Self {
        if let Some(dir) = upload_dir.filter(|s| !s.is_empty()) {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(path) = index_path.filter(|s| !s.is_empty()) {
            self.index_path = PathBuf::from(path);
        }
        self
    }
}
