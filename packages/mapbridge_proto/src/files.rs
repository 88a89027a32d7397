//! Project directory listing and relative path handling.

use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Per-project metadata directory. Never listed, never counted against quota.
pub const META_DIR: &str = ".mapbridge";

/// A regular file inside a project, keyed by its `/`-separated relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("directory not found: {0}")]
    NotFound(PathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}

impl ListError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ListError::NotFound(_))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,

    #[error("path must be relative: {0}")]
    Absolute(String),

    #[error("path escapes the project directory: {0}")]
    Traversal(String),

    #[error("path is reserved for project metadata: {0}")]
    Reserved(String),
}

/// List regular files under `root`, sorted by relative path.
///
/// With `recursive == false` only the top level is listed. The
/// [`META_DIR`] subtree is skipped.
pub fn list_dir(root: &Path, recursive: bool) -> Result<Vec<FileRecord>, ListError> {
    let meta = match std::fs::metadata(root) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ListError::NotFound(root.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Err(ListError::NotADirectory(root.to_path_buf()));
    }

    let mut walker = WalkDir::new(root).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    let entries = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != META_DIR);
    for entry in entries {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let size = entry.metadata()?.len();
        files.push(FileRecord {
            path: to_portable(relative),
            size,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn to_portable(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a `/`-separated relative path onto `root`, refusing anything that
/// could land outside of it.
pub fn resolve_relative(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }
    if relative.starts_with('/') || relative.contains('\\') || relative.contains(':') {
        return Err(PathError::Absolute(relative.to_string()));
    }

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(PathError::Traversal(relative.to_string())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Absolute(relative.to_string()));
            }
        }
    }
    if depth == 0 {
        return Err(PathError::Empty);
    }
    Ok(resolved)
}

/// [`resolve_relative`] for files a client may write: the [`META_DIR`]
/// subtree belongs to the server.
pub fn resolve_project_file(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let resolved = resolve_relative(root, relative)?;
    let first = Path::new(relative).components().find_map(|c| match c {
        Component::Normal(part) => Some(part),
        _ => None,
    });
    if first.is_some_and(|part| part.eq_ignore_ascii_case(META_DIR)) {
        return Err(PathError::Reserved(relative.to_string()));
    }
    Ok(resolved)
}
