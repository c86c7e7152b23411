pub mod access;
pub mod config;
pub mod error;
pub mod index;
pub mod naming;
pub mod render;
pub mod store;
pub mod walker;

pub use access::{authorize, Action, Decision};
pub use config::StoreConfig;
pub use error::{ErrorKind, Result, StoreError};
pub use index::{Index, IndexFile, Owner, Record};
pub use render::{OutlineEntry, RenderResult};
pub use store::{BatchReport, Document, DocumentStore, EntryKind, ItemError, ReconcileReport, Upload};
pub use walker::{Entry, ListOptions, SortKey, SortOrder};
