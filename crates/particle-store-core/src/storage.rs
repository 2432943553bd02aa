//! Filesystem layout and durable I/O helpers.
//!
//! This module centralizes every filesystem interaction of the store. It maps
//! a store root directory to the locations of:
//!
//! - Chunk files (for example, `<root>/chunk-20250101T000000.000000000Z-000001.parquet`).
//! - The append-only index ledger (`<root>/index.jsonl`).
//! - Temporary files used by the write-then-rename publish step (`*.tmp`).
//!
//! The two publish primitives the rest of the crate relies on live here:
//!
//! - [`write_atomic`]: write to a temporary file, fsync, rename into place
//!   and fsync the parent directory. A reader never observes a partially
//!   written file under its final name.
//! - [`append_durable`]: append bytes to a file and fsync before returning.
//!
//! Only the local filesystem is supported.

use snafu::{Backtrace, IntoError, prelude::*};
use std::{
    error::Error,
    fmt,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Extension used for in-progress files before they are renamed into place.
pub const TEMP_EXTENSION: &str = "tmp";

/// Location of a particle store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLocation {
    /// A store rooted at a local filesystem directory.
    Local(PathBuf),
}

impl StoreLocation {
    /// Creates a new `StoreLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StoreLocation::Local(root.into())
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        match self {
            StoreLocation::Local(root) => root,
        }
    }

    /// Resolve a store-relative path to an absolute local path.
    pub fn join(&self, rel: &Path) -> PathBuf {
        match self {
            StoreLocation::Local(root) => root.join(rel),
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::Local(root) => write!(f, "{}", root.display()),
        }
    }
}

/// Errors produced by the storage backend implementation.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
}

impl BackendError {
    /// Kind of the underlying I/O error.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            BackendError::Local(e) => e.kind(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The specified path already exists when creation was requested with
    /// create-new semantics.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// Underlying backend error that indicates the existing resource.
        source: BackendError,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// An I/O error occurred on the local filesystem.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend I/O error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Path the failing operation was working on.
    pub fn path(&self) -> &str {
        match self {
            StorageError::NotFound { path, .. }
            | StorageError::AlreadyExists { path, .. }
            | StorageError::OtherIo { path, .. } => path,
        }
    }
}

fn classify(e: io::Error, path: &Path) -> StorageError {
    let path = path.display().to_string();
    match e.kind() {
        io::ErrorKind::NotFound => NotFoundSnafu { path }.into_error(BackendError::Local(e)),
        io::ErrorKind::AlreadyExists => {
            AlreadyExistsSnafu { path }.into_error(BackendError::Local(e))
        }
        _ => OtherIoSnafu { path }.into_error(BackendError::Local(e)),
    }
}

/// Create the store root directory (and parents) if it does not exist.
pub async fn ensure_root(location: &StoreLocation) -> StorageResult<()> {
    let root = location.root();
    fs::create_dir_all(root)
        .await
        .map_err(|e| classify(e, root))
}

/// Fsync a directory so that renames and creations inside it are durable.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> StorageResult<()> {
    let handle = fs::File::open(dir).await.map_err(|e| classify(e, dir))?;
    handle.sync_all().await.map_err(|e| classify(e, dir))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Used to ensure cleanup on error paths during atomic writes.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Call this after a successful rename.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we're likely already handling another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `rel_path` inside `location` using an atomic write.
///
/// The payload goes to a temporary file next to the target, which is synced
/// and then renamed into place; the parent directory is synced afterwards so
/// the rename itself survives a crash. If any step fails the temporary file
/// is removed and the final path is left untouched.
pub async fn write_atomic(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    let parent = abs.parent().map(Path::to_path_buf);

    if let Some(parent) = &parent {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| classify(e, parent))?;
    }

    let tmp_path = abs.with_extension(TEMP_EXTENSION);
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| classify(e, &tmp_path))?;

        file.write_all(contents)
            .await
            .map_err(|e| classify(e, &tmp_path))?;

        file.sync_all().await.map_err(|e| classify(e, &tmp_path))?;
    }

    fs::rename(&tmp_path, &abs)
        .await
        .map_err(|e| classify(e, &abs))?;

    // Renamed; nothing left to clean up.
    guard.disarm();

    if let Some(parent) = &parent {
        sync_dir(parent).await?;
    }

    Ok(())
}

/// Append `contents` to `rel_path`, creating the file if needed, and fsync
/// before returning.
///
/// Returns the file length after the append.
pub async fn append_durable(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<u64> {
    let abs = location.join(rel_path);

    let existed = fs::try_exists(&abs).await.map_err(|e| classify(e, &abs))?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&abs)
        .await
        .map_err(|e| classify(e, &abs))?;

    file.write_all(contents)
        .await
        .map_err(|e| classify(e, &abs))?;

    file.sync_data().await.map_err(|e| classify(e, &abs))?;

    let len = file
        .metadata()
        .await
        .map_err(|e| classify(e, &abs))?
        .len();

    // The first append also has to make the file's directory entry durable.
    if !existed && let Some(parent) = abs.parent() {
        sync_dir(parent).await?;
    }

    Ok(len)
}

/// Read the full contents of a file at `rel_path` within `location`.
///
/// A missing file is reported as `StorageError::NotFound`.
pub async fn read_all_bytes(location: &StoreLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = location.join(rel_path);
    fs::read(&abs).await.map_err(|e| classify(e, &abs))
}

/// Read everything in `rel_path` from byte `offset` to the end of the file.
///
/// A missing file is reported as `StorageError::NotFound`; an offset past the
/// end yields an empty buffer.
pub async fn read_from_offset(
    location: &StoreLocation,
    rel_path: &Path,
    offset: u64,
) -> StorageResult<Vec<u8>> {
    let abs = location.join(rel_path);

    let mut file = fs::File::open(&abs).await.map_err(|e| classify(e, &abs))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| classify(e, &abs))?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .await
        .map_err(|e| classify(e, &abs))?;
    Ok(buf)
}

/// Length in bytes of the regular file at `rel_path`.
///
/// Missing files and non-regular files are both reported as `NotFound`.
pub async fn file_len(location: &StoreLocation, rel_path: &Path) -> StorageResult<u64> {
    let abs = location.join(rel_path);
    let meta = fs::metadata(&abs).await.map_err(|e| classify(e, &abs))?;

    if !meta.is_file() {
        return Err(classify(
            io::Error::new(io::ErrorKind::NotFound, "not a regular file"),
            &abs,
        ));
    }
    Ok(meta.len())
}

/// Shrink the file at `rel_path` to `len` bytes and fsync it.
pub async fn truncate(location: &StoreLocation, rel_path: &Path, len: u64) -> StorageResult<()> {
    let abs = location.join(rel_path);
    let file = OpenOptions::new()
        .write(true)
        .open(&abs)
        .await
        .map_err(|e| classify(e, &abs))?;

    file.set_len(len).await.map_err(|e| classify(e, &abs))?;
    file.sync_all().await.map_err(|e| classify(e, &abs))
}

/// Remove the file at `rel_path`. Removing a missing file is not an error.
pub async fn remove_file(location: &StoreLocation, rel_path: &Path) -> StorageResult<()> {
    let abs = location.join(rel_path);
    match fs::remove_file(&abs).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(classify(e, &abs)),
    }
}

/// Names of the regular files directly under the store root, sorted.
///
/// A missing root is reported as `StorageError::NotFound`.
pub async fn list_files(location: &StoreLocation) -> StorageResult<Vec<String>> {
    let root = location.root();
    let mut entries = fs::read_dir(root).await.map_err(|e| classify(e, root))?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| classify(e, root))? {
        let file_type = entry.file_type().await.map_err(|e| classify(e, root))?;
        if file_type.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
