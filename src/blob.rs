//! Blob store seam: makes segment files locally readable before they are parsed.

use crate::error::MetaError;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Makes files readable on the local filesystem, fetching them from backing storage if absent.
///
/// Paths are relative to the store's local root unless absolute.
pub trait BlobStore: std::fmt::Debug + Send + Sync + 'static {
    /// Ensures `file` exists locally.
    fn download_if_absent(&self, file: &Path) -> Result<(), MetaError>;

    /// Ensures every file in `files` exists locally. Values are caller tags (e.g. column
    /// names) and are only used for error context.
    ///
    /// A file missing from the backing store is not an error: callers treat an absent file as
    /// "no index for that column". Individual fetch failures are returned so the caller can
    /// report them; the batch only fails when every fetch failed.
    fn bulk_download_if_absent(&self, files: &HashMap<PathBuf, String>) -> Result<Vec<FetchFailure>, MetaError> {
        let mut failures = Vec::new();
        for (file, tag) in files {
            if let Err(error) = self.download_if_absent(file) {
                failures.push(FetchFailure {
                    file: file.clone(),
                    tag: tag.clone(),
                    error,
                });
            }
        }
        if !files.is_empty() && failures.len() == files.len() {
            let joined = failures
                .iter()
                .map(|f| format!("{} ({}): {}", f.file.display(), f.tag, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(MetaError::Blob(joined));
        }
        Ok(failures)
    }

    /// Local root that relative segment paths resolve against.
    fn local_root(&self) -> &Path;
}

/// One file of a bulk download that could not be fetched.
#[derive(Debug)]
pub struct FetchFailure {
    pub file: PathBuf,
    pub tag: String,
    pub error: MetaError,
}

/// Store for nodes whose segment files are already on local disk.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobStore for LocalBlobStore {
    fn download_if_absent(&self, _file: &Path) -> Result<(), MetaError> {
        Ok(())
    }

    fn bulk_download_if_absent(&self, _files: &HashMap<PathBuf, String>) -> Result<Vec<FetchFailure>, MetaError> {
        Ok(Vec::new())
    }

    fn local_root(&self) -> &Path {
        &self.root
    }
}

/// Store that copies missing files from a remote directory tree into the local root,
/// preserving relative paths. Copies go through a temp file and a rename so readers never
/// observe a partial file.
#[derive(Debug, Clone)]
pub struct MirrorBlobStore {
    local: PathBuf,
    remote: PathBuf,
}

impl MirrorBlobStore {
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<PathBuf>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }

    fn fetch(&self, file: &Path) -> Result<(), MetaError> {
        let local = crate::types::resolve(&self.local, file);
        if local.exists() {
            return Ok(());
        }
        let rel = file.strip_prefix(&self.local).unwrap_or(file);
        let remote = crate::types::resolve(&self.remote, rel);
        if !remote.exists() {
            return Ok(());
        }
        let parent = local
            .parent()
            .ok_or_else(|| MetaError::Blob(format!("no parent directory for {}", local.display())))?;
        fs::create_dir_all(parent)?;
        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        fs::copy(&remote, tmp.path()).map_err(|e| {
            MetaError::Blob(format!("copy {} failed: {}", remote.display(), e))
        })?;
        tmp.persist(&local)
            .map_err(|e| MetaError::Blob(format!("install {} failed: {}", local.display(), e)))?;
        Ok(())
    }
}

impl BlobStore for MirrorBlobStore {
    fn download_if_absent(&self, file: &Path) -> Result<(), MetaError> {
        self.fetch(file)
    }

    fn local_root(&self) -> &Path {
        &self.local
    }
}
