//! Per-user project storage under `<projects_dir>/<user>/<project>`.

use mapbridge_proto::{FileRecord, ListError, META_DIR, PathError, list_dir, resolve_relative};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::config::StorageConfig;

/// File the last upload descriptor is kept in, inside [`META_DIR`].
pub const CHANGES_FILE: &str = "changes.json";

/// Directory of `user`'s `project`. The project name must be a single path
/// component.
pub fn project_dir(storage: &StorageConfig, user: &str, project: &str) -> Result<PathBuf, PathError> {
    if project.contains('/') {
        return Err(PathError::Traversal(project.to_string()));
    }
    let user_dir = resolve_relative(&storage.projects_dir, user)?;
    resolve_relative(&user_dir, project)
}

/// Recursive listing off the async runtime.
pub async fn list_project(dir: PathBuf) -> Result<Vec<FileRecord>, ListError> {
    tokio::task::spawn_blocking(move || list_dir(&dir, true))
        .await
        .map_err(|e| ListError::Io(io::Error::other(e)))?
}

/// Like [`list_project`], but a project that does not exist yet is empty.
pub async fn existing_files(dir: PathBuf) -> Result<Vec<FileRecord>, ListError> {
    match list_project(dir).await {
        Ok(files) => Ok(files),
        Err(e) if e.is_not_found() => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Listing(#[from] ListError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Zip every listed file of a project, built off the async runtime.
pub async fn archive_project(dir: PathBuf) -> Result<Vec<u8>, ArchiveError> {
    tokio::task::spawn_blocking(move || {
        let files = list_dir(&dir, true)?;
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for file in &files {
            zip.start_file(file.path.as_str(), options)?;
            let mut source = std::fs::File::open(dir.join(&file.path))?;
            io::copy(&mut source, &mut zip)?;
        }
        Ok(zip.finish()?.into_inner())
    })
    .await
    .map_err(|e| ArchiveError::Io(io::Error::other(e)))?
}

/// Persist the raw upload descriptor next to the project files.
pub async fn write_changes(dir: &Path, blob: &[u8]) -> io::Result<()> {
    let meta = dir.join(META_DIR);
    tokio::fs::create_dir_all(&meta).await?;
    tokio::fs::write(meta.join(CHANGES_FILE), blob).await
}

/// Remove a project directory. Returns false when there was nothing to remove.
pub async fn delete_project(dir: &Path) -> io::Result<bool> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
