//! Command-line front end for the doc-hub document store.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use doc_hub_core::{
    BatchReport, DocumentStore, Entry, EntryKind, ListOptions, Owner, Record, RenderResult,
    SortKey, SortOrder, StoreConfig, Upload,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "doc-hub")]
#[command(about = "Shared document workspace with personal documents")]
struct Cli {
    /// Directory holding the document tree and its index
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Caller token used for personal documents
    #[arg(long, global = true, env = "DOC_HUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every directory
    Dirs,

    /// List one directory
    Ls {
        #[arg(default_value = "/")]
        dir: String,

        /// name, created or modified
        #[arg(short, long, default_value = "name")]
        sort: SortKey,

        #[arg(long)]
        desc: bool,

        /// Only files whose name contains this text
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Search names across the whole tree
    Search { keyword: String },

    /// Show a document's metadata
    Show { path: String },

    /// Print a document's content
    Cat { path: String },

    /// Render a document to HTML
    Preview { path: String },

    /// Create an empty document
    Create {
        dir: String,
        name: String,

        /// Restrict the document to the caller token
        #[arg(long)]
        personal: bool,
    },

    /// Upload local files into a directory
    Upload {
        dir: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long)]
        personal: bool,
    },

    /// Replace a document's content from a file, or stdin with `-`
    Edit { path: String, source: String },

    /// Rename a document, or a directory with --dir
    Rename {
        dir: String,
        old: String,
        new: String,

        #[arg(long = "dir")]
        directory: bool,
    },

    /// Move entries of one directory into another
    Mv {
        target: String,
        #[arg(required = true)]
        items: Vec<String>,

        /// Directory the items currently live in
        #[arg(long, default_value = "/")]
        from: String,
    },

    /// Delete documents, or directories with everything in them
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Create a directory
    Mkdir { dir: String, name: String },

    /// Remove an empty directory
    Rmdir { dir: String, name: String },

    /// Repair the index against the document tree
    Reconcile,
}

/// Environment first; `--home` replaces `DOC_HUB_HOME` but keeps the other overrides.
fn load_config(home: Option<PathBuf>) -> StoreConfig {
    match home {
        Some(home) => StoreConfig::new(home).with_overrides(
            std::env::var("DOC_HUB_UPLOAD_DIR").ok(),
            std::env::var("DOC_HUB_INDEX").ok(),
        ),
        None => StoreConfig::from_env(),
    }
}

/// A listing row as shown to users. Owner tokens never leave the store.
#[derive(Serialize, Debug, PartialEq, Eq)]
struct Row {
    kind: &'static str,
    path: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    personal: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modified: Option<String>,
}

fn format_time(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn file_row(path: &str, record: &Record) -> Row {
    Row {
        kind: "file",
        path: path.to_string(),
        name: record.display_name.clone(),
        personal: Some(record.is_restricted()),
        created: Some(format_time(record.created_at)),
        modified: Some(format_time(record.modified_at)),
    }
}

impl From<&Entry> for Row {
    fn from(entry: &Entry) -> Self {
        match entry {
            Entry::File { path, record } => file_row(path, record),
            Entry::Directory { name, path } => Row {
                kind: "dir",
                path: path.clone(),
                name: name.clone(),
                personal: None,
                created: None,
                modified: None,
            },
        }
    }
}

fn print_rows(rows: &[Row], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
        return Ok(());
    }
    for row in rows {
        match (&row.modified, row.personal) {
            (Some(modified), Some(personal)) => println!(
                "{:<40} {}{}",
                row.path,
                modified,
                if personal { "  personal" } else { "" }
            ),
            _ => println!("{}/", row.path),
        }
    }
    Ok(())
}

fn finish_batch(action: &str, report: BatchReport) -> Result<()> {
    println!("{action}: {} succeeded", report.success_count);
    for error in &report.errors {
        eprintln!("  {error}");
    }
    if !report.is_complete() {
        bail!("{action}: {} item(s) failed", report.errors.len());
    }
    Ok(())
}

fn owner_for(personal: bool, token: Option<&str>) -> Result<Owner> {
    if personal && token.map_or(true, |t| t.trim().is_empty()) {
        bail!("a personal document needs --token");
    }
    Ok(Owner::from_request(personal, token.unwrap_or_default()))
}

fn read_source(source: &str) -> Result<String> {
    if source == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(source).with_context(|| format!("reading {source}"))
}

fn run(cli: Cli, store: &DocumentStore) -> Result<()> {
    let token = cli.token.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let json = cli.json;
    match cli.command {
        Commands::Dirs => {
            for dir in store.directories()? {
                println!("{dir}");
            }
        }
        Commands::Ls { dir, sort, desc, filter } => {
            let options = ListOptions {
                sort,
                order: if desc { SortOrder::Desc } else { SortOrder::Asc },
                filter,
            };
            let rows: Vec<Row> = store.list(&dir, &options)?.iter().map(Row::from).collect();
            print_rows(&rows, json)?;
        }
        Commands::Search { keyword } => {
            let rows: Vec<Row> = store.search(&keyword)?.iter().map(Row::from).collect();
            print_rows(&rows, json)?;
        }
        Commands::Show { path } => {
            let record = store.metadata(&path)?;
            print_rows(&[file_row(&path, &record)], json)?;
        }
        Commands::Cat { path } => {
            print!("{}", store.read(&path, token)?.content);
        }
        Commands::Preview { path } => match store.preview(&path, token)? {
            RenderResult::Unsupported => bail!("{path} cannot be previewed"),
            RenderResult::Markdown { html, outline } if json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&RenderResult::Markdown { html, outline })?
                );
            }
            RenderResult::Markdown { html, .. } | RenderResult::Highlighted { html } => {
                println!("{html}");
            }
        },
        Commands::Create { dir, name, personal } => {
            let owner = owner_for(personal, token)?;
            let record = store.create(&dir, &name, owner)?;
            println!("created {}", record.stored_name);
        }
        Commands::Upload { dir, files, personal } => {
            let owner = owner_for(personal, token)?;
            let mut uploads = Vec::with_capacity(files.len());
            for file in &files {
                let name = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("{} has no usable file name", file.display()))?;
                let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
                uploads.push(Upload::new(name, bytes));
            }
            finish_batch("upload", store.upload_batch(&dir, &uploads, &owner))?;
        }
        Commands::Edit { path, source } => {
            let content = read_source(&source)?;
            store.update(&path, &content, token)?;
            println!("saved {path}");
        }
        Commands::Rename { dir, old, new, directory } => {
            let kind = if directory { EntryKind::Directory } else { EntryKind::File };
            let key = store.rename(&dir, &old, &new, kind, token)?;
            println!("renamed to {key}");
        }
        Commands::Mv { target, items, from } => {
            finish_batch("move", store.move_batch(&items, &target, &from))?;
        }
        Commands::Rm { paths } => {
            finish_batch("delete", store.delete_batch(&paths, token))?;
        }
        Commands::Mkdir { dir, name } => {
            println!("created {}/", store.mkdir(&dir, &name)?);
        }
        Commands::Rmdir { dir, name } => {
            store.remove_empty_dir(&dir, &name)?;
            println!("removed {name}/");
        }
        Commands::Reconcile => {
            let report = store.reconcile()?;
            println!(
                "orphaned {}, untracked {}, migrated {}",
                report.orphaned, report.untracked, report.migrated
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.home.clone());
    let store = DocumentStore::open(&config)
        .with_context(|| format!("opening store at {}", config.upload_dir.display()))?;
    info!(root = %config.upload_dir.display(), index = %config.index_path.display(), "store ready");

    run(cli, &store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing_flags() {
        let cli = Cli::try_parse_from(["doc-hub", "ls", "Projects", "--sort", "edit_time", "--desc"]).unwrap();
        match cli.command {
            Commands::Ls { dir, sort, desc, filter } => {
                assert_eq!(dir, "Projects");
                assert_eq!(sort, SortKey::Modified);
                assert!(desc);
                assert!(filter.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "doc-hub", "mv", "archive", "a.md", "b.md", "--from", "inbox", "--home", "/tmp/hub",
            "--token", "alice",
        ])
        .unwrap();
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/hub")));
        assert_eq!(cli.token.as_deref(), Some("alice"));
        match cli.command {
            Commands::Mv { target, items, from } => {
                assert_eq!(target, "archive");
                assert_eq!(items, ["a.md", "b.md"]);
                assert_eq!(from, "inbox");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_sort_and_missing_items() {
        assert!(Cli::try_parse_from(["doc-hub", "ls", "--sort", "size"]).is_err());
        assert!(Cli::try_parse_from(["doc-hub", "rm"]).is_err());
    }

    #[test]
    fn personal_documents_need_a_token() {
        assert!(owner_for(true, None).is_err());
        assert!(owner_for(true, Some("  ")).is_err());
        assert_eq!(owner_for(true, Some("alice")).unwrap(), Owner::Restricted("alice".into()));
        assert_eq!(owner_for(false, Some("alice")).unwrap(), Owner::Shared);
    }

    #[test]
    fn rows_hide_owner_tokens() {
        let record = Record::new("diary.md", Owner::Restricted("alice".into()), 0);
        let row = file_row("diary.md", &record);
        assert_eq!(row.personal, Some(true));
        assert_eq!(row.created.as_deref(), Some("1970-01-01 00:00:00"));
        let json = serde_json::to_string(&row).unwrap();
        assert!(!json.contains("alice"));
    }

    #[test]
    fn commands_run_against_a_store() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(&StoreConfig::new(tempdir.path())).unwrap();
        let cli = |args: &[&str]| {
            let mut argv = vec!["doc-hub"];
            argv.extend_from_slice(args);
            Cli::try_parse_from(argv).unwrap()
        };
        run(cli(&["mkdir", "/", "notes"]), &store).unwrap();
        run(cli(&["create", "notes", "todo", "--personal", "--token", "alice"]), &store).unwrap();
        assert!(run(cli(&["cat", "notes/todo.md", "--token", "bob"]), &store).is_err());
        assert!(run(cli(&["rm", "notes/todo.md"]), &store).is_err());
        run(cli(&["rm", "notes"]), &store).unwrap();
        assert!(store.index_file().load().unwrap().is_empty());
    }

    #[test]
    fn padded_tokens_match_the_owner() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(&StoreConfig::new(tempdir.path())).unwrap();
        let cli = |args: &[&str]| {
            let mut argv = vec!["doc-hub"];
            argv.extend_from_slice(args);
            Cli::try_parse_from(argv).unwrap()
        };
        run(cli(&["create", "/", "todo", "--personal", "--token", " alice "]), &store).unwrap();
        assert_eq!(
            store.metadata("todo.md").unwrap().owner,
            Owner::Restricted("alice".into())
        );
        run(cli(&["cat", "todo.md", "--token", " alice "]), &store).unwrap();
        run(cli(&["cat", "todo.md", "--token", "alice"]), &store).unwrap();
        assert!(run(cli(&["rm", "todo.md", "--token", "bob"]), &store).is_err());
        assert!(run(cli(&["rm", "todo.md", "--token", "   "]), &store).is_err());
    }
}
