//! Locked, atomic access to one CSV file on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use backoff::ExponentialBackoffBuilder;
use fs2::FileExt;
use tracing::{debug, error, warn};

use super::table::Table;
use super::StoreError;

/// Bounded retry for file operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_interval: Duration::from_millis(25),
            max_interval: Duration::from_secs(1),
        }
    }
}

/// Identity of the file contents as seen by the last read.
type Fingerprint = Option<(SystemTime, u64)>;

/// Result of a conditional read.
#[derive(Debug)]
pub enum ReadOutcome {
    Changed(Table),
    Unchanged,
    Locked,
}

/// A CSV file shared with other processes.
///
/// Writers serialize on an exclusive lock of `<file>.lock` and also wait out
/// any exclusive lock an editor holds on the data file itself.
#[derive(Debug)]
pub struct TableFile {
    path: PathBuf,
    default_header: &'static [&'static str],
    retry: RetryPolicy,
    last_seen: Option<Fingerprint>,
}

impl TableFile {
    pub fn new(path: impl Into<PathBuf>, default_header: &'static [&'static str]) -> Self {
        Self {
            path: path.into(),
            default_header,
            retry: RetryPolicy::default(),
            last_seen: None,
        }
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file if it changed since the last successful read.
    pub fn read_if_changed(&mut self) -> Result<ReadOutcome, StoreError> {
        let fingerprint = fingerprint(&self.path)?;
        if self.last_seen == Some(fingerprint) {
            return Ok(ReadOutcome::Unchanged);
        }
        if is_locked_by_other(&self.path)? {
            return Ok(ReadOutcome::Locked);
        }
        let table = self.read()?;
        self.last_seen = Some(fingerprint);
        Ok(ReadOutcome::Changed(table))
    }

    /// Unconditional read; a missing file reads as a header-only table.
    pub fn read(&self) -> Result<Table, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Table::parse(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Ok(Table::with_header(self.default_header))
            }
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    /// Re-read under lock, apply `mutation`, and atomically replace the file.
    ///
    /// `mutation` runs once per attempt against a fresh read. The file is only
    /// rewritten when the mutation changed something.
    pub fn write<T, F>(&mut self, op: &str, mut mutation: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut Table) -> Result<T, StoreError>,
    {
        let path = self.path.clone();
        let result = with_retry(&self.retry, op, &path, || {
            let _guard = WriteLock::acquire(&path)?;
            let mut table = self.read()?;
            let value = mutation(&mut table)?;
            if table.is_dirty() {
                atomic_write(&path, &table.render()?)?;
                debug!(path = %path.display(), op = op, "File rewritten");
            }
            Ok(value)
        });

        if let Err(e) = &result {
            if e.is_transient() {
                error!(path = %path.display(), op = op, error = %e, "Write abandoned after retries");
            }
        }
        result
    }
}

/// Run `f` until it succeeds, fails permanently, or exhausts the policy.
pub(crate) fn with_retry<T, F>(
    policy: &RetryPolicy,
    op: &str,
    path: &Path,
    mut f: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_interval)
        .with_max_interval(policy.max_interval)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 0;
    backoff::retry(backoff, || {
        attempt += 1;
        match f() {
            Ok(value) => Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    path = %path.display(),
                    op = op,
                    attempt = attempt,
                    error = %e,
                    "Transient file error, retrying"
                );
                Err(backoff::Error::transient(e))
            }
            Err(e) => Err(backoff::Error::permanent(e)),
        }
    })
    .map_err(|e| match e {
        backoff::Error::Permanent(err) => err,
        backoff::Error::Transient { err, .. } => err,
    })
}

fn fingerprint(path: &Path) -> Result<Fingerprint, StoreError> {
    match fs::metadata(path) {
        Ok(meta) => {
            let modified = meta.modified().map_err(|e| StoreError::io(path, e))?;
            Ok(Some((modified, meta.len())))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == fs2::lock_contended_error().kind()
}

/// Whether some other handle holds an exclusive lock on `path`.
pub(crate) fn is_locked_by_other(path: &Path) -> Result<bool, StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(false)
        }
        Err(e) if is_contended(&e) => Ok(true),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Held for the duration of one read-modify-write.
struct WriteLock {
    sidecar: File,
    data: Option<File>,
}

impl WriteLock {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        let sidecar_path = lock_path(path);
        let sidecar = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&sidecar_path)
            .map_err(|e| StoreError::io(&sidecar_path, e))?;
        // Writers from this crate take turns here; a busy sidecar is retried.
        match FileExt::try_lock_exclusive(&sidecar) {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                return Err(StoreError::Locked {
                    path: sidecar_path.display().to_string(),
                })
            }
            Err(e) => return Err(StoreError::io(&sidecar_path, e)),
        }

        // An editor holding the data file is waited out via retry.
        let data = match File::open(path) {
            Ok(file) => match FileExt::try_lock_exclusive(&file) {
                Ok(()) => Some(file),
                Err(e) if is_contended(&e) => {
                    let _ = FileExt::unlock(&sidecar);
                    return Err(StoreError::Locked {
                        path: path.display().to_string(),
                    });
                }
                Err(e) => return Err(StoreError::io(path, e)),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::io(path, e)),
        };

        Ok(Self { sidecar, data })
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Some(data) = &self.data {
            let _ = FileExt::unlock(data);
        }
        let _ = FileExt::unlock(&self.sidecar);
    }
}

/// Write `contents` to a temp file beside `path`, fsync, then rename over `path`.
pub(crate) fn atomic_write(path: &Path, contents: &str) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".trailguard-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| StoreError::io(dir, e))?;

    tmp.write_all(contents.as_bytes())
        .map_err(|e| StoreError::io(path, e))?;
    tmp.flush().map_err(|e| StoreError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(path, e))?;

    if let Ok(meta) = fs::metadata(path) {
        let _ = fs::set_permissions(tmp.path(), meta.permissions());
    }

    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}
