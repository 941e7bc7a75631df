use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DataSafe, DataSafeError};

/// Capacity of the write queue in front of the worker.
const WRITE_QUEUE_CAPACITY: usize = 10;

/// How long the worker keeps accepting writes after a flush was requested.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Replaces path separators in a key.
const SEPARATOR_SUBSTITUTE: char = '\u{FDD2}';

/// Replaces dots in a key.
const DOT_SUBSTITUTE: char = '\u{FDD3}';

struct WriteRequest {
    key: String,
    data: String,
    seq: u64,
    retried: bool,
}

struct ReadRequest {
    key: String,
    back: oneshot::Sender<String>,
}

struct WorkerHandle {
    writes: mpsc::Sender<WriteRequest>,
    reads: mpsc::Sender<ReadRequest>,
    stop: CancellationToken,
    flushed: watch::Receiver<bool>,
    seq: AtomicU64,
    retries: Arc<AtomicUsize>,
}

/// Stores every key as one file in a directory.
///
/// A single worker task owns the directory. Saves are queued and applied in
/// the order the worker accepts them, loads are answered in between, so a load
/// issued after a save was accepted always sees that save.
pub struct FileDataSafe {
    worker: OnceLock<WorkerHandle>,
    grace: Duration,
}

impl FileDataSafe {
    pub fn new() -> Self {
        Self::with_grace(FLUSH_GRACE)
    }

    /// Create a backend with a custom flush grace period.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            worker: OnceLock::new(),
            grace,
        }
    }

    fn handle(&self) -> Result<&WorkerHandle, DataSafeError> {
        self.worker.get().ok_or(DataSafeError::NotConfigured)
    }
}

impl Default for FileDataSafe {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FileDataSafe {
    fn drop(&mut self) {
        // Lets the worker drain and exit when nobody called flush_and_close.
        if let Some(handle) = self.worker.get() {
            handle.stop.cancel();
        }
    }
}

/// Map a session key to a file name that cannot leave the storage directory.
///
/// Keys which already contain the substitute code points may collide with
/// other keys after the mapping.
pub fn storage_name(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' => SEPARATOR_SUBSTITUTE,
            '.' => DOT_SUBSTITUTE,
            c => c,
        })
        .collect()
}

fn has_reserved_chars(key: &str) -> bool {
    key.contains(SEPARATOR_SUBSTITUTE) || key.contains(DOT_SUBSTITUTE)
}

/// Resolve the file for `key`, refusing anything that is not a direct child of `dir`.
fn entry_path(dir: &Path, key: &str) -> Option<PathBuf> {
    if has_reserved_chars(key) {
        warn!("file: key '{}' contains reserved characters and may collide with another key", key);
    }
    let path = dir.join(storage_name(key));
    if path.parent() == Some(dir) {
        Some(path)
    } else {
        error!("file: refusing key '{}', it does not map into the storage directory", key);
        None
    }
}

#[async_trait]
impl DataSafe for FileDataSafe {
    async fn save(&self, key: &str, data: &str) -> Result<(), DataSafeError> {
        let handle = self.handle()?;
        // Counted as a possible retry before the sequence number is taken, so
        // the worker never forgets a newer write while this one may still
        // arrive late.
        handle.retries.fetch_add(1, Ordering::SeqCst);
        let request = WriteRequest {
            key: key.to_string(),
            data: data.to_string(),
            seq: handle.seq.fetch_add(1, Ordering::SeqCst),
            retried: false,
        };

        match handle.writes.try_send(request) {
            Ok(()) => {
                handle.retries.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            Err(TrySendError::Full(mut request)) => {
                // Queue is full. Hand the write to a retry task instead of
                // stalling the session.
                debug!("file: write queue full, retrying '{}' in background", request.key);
                request.retried = true;
                let writes = handle.writes.clone();
                let retries = handle.retries.clone();
                tokio::spawn(async move {
                    let key = request.key.clone();
                    if writes.send(request).await.is_err() {
                        retries.fetch_sub(1, Ordering::SeqCst);
                        error!("file: worker stopped before write for '{}' was accepted", key);
                    }
                });
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                handle.retries.fetch_sub(1, Ordering::SeqCst);
                Err(DataSafeError::StorageUnavailable(
                    "file worker is not running".to_string(),
                ))
            }
        }
    }

    async fn load(&self, key: &str) -> Result<String, DataSafeError> {
        let handle = self.handle()?;
        let (back, answer) = oneshot::channel();
        handle
            .reads
            .send(ReadRequest {
                key: key.to_string(),
                back,
            })
            .await
            .map_err(|_| DataSafeError::StorageUnavailable("file worker is not running".to_string()))?;

        answer
            .await
            .map_err(|_| DataSafeError::StorageUnavailable("file worker dropped the read".to_string()))
    }

    async fn configure(&self, config: &str) -> Result<(), DataSafeError> {
        if self.worker.get().is_some() {
            return Err(DataSafeError::AlreadyConfigured);
        }

        let dir = PathBuf::from(config.trim());
        if dir.as_os_str().is_empty() {
            return Err(DataSafeError::InvalidConfig("file: no directory given".to_string()));
        }

        match tokio::fs::metadata(&dir).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(DataSafeError::InvalidConfig(format!(
                    "path '{}' is not a directory",
                    dir.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut builder = tokio::fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                builder.mode(0o700);
                builder.create(&dir).await.map_err(|e| {
                    DataSafeError::InvalidConfig(format!("can not create path '{}': {}", dir.display(), e))
                })?;
            }
            Err(e) => {
                return Err(DataSafeError::InvalidConfig(format!(
                    "can not check path '{}': {}",
                    dir.display(),
                    e
                )));
            }
        }

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (read_tx, read_rx) = mpsc::channel(1);
        let (flushed_tx, flushed_rx) = watch::channel(false);
        let stop = CancellationToken::new();
        let retries = Arc::new(AtomicUsize::new(0));

        let handle = WorkerHandle {
            writes: write_tx,
            reads: read_tx,
            stop: stop.clone(),
            flushed: flushed_rx,
            seq: AtomicU64::new(0),
            retries: retries.clone(),
        };
        if self.worker.set(handle).is_err() {
            return Err(DataSafeError::AlreadyConfigured);
        }

        info!("file: storing sessions in '{}'", dir.display());
        let log = WriteLog::new(retries);
        tokio::spawn(run_worker(dir, write_rx, read_rx, stop, flushed_tx, log, self.grace));
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn flush_and_close(&self) {
        let Some(handle) = self.worker.get() else {
            return;
        };
        handle.stop.cancel();

        let mut flushed = handle.flushed.clone();
        if flushed.wait_for(|done| *done).await.is_err() {
            error!("file: worker ended without confirming the flush");
        }
    }
}

async fn run_worker(
    dir: PathBuf,
    mut writes: mpsc::Receiver<WriteRequest>,
    mut reads: mpsc::Receiver<ReadRequest>,
    stop: CancellationToken,
    flushed: watch::Sender<bool>,
    mut log: WriteLog,
    grace: Duration,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;

            Some(request) = writes.recv() => {
                write_entry(&dir, &mut log, request).await;
                if let Some(deadline) = deadline.as_mut() {
                    *deadline = Instant::now() + grace;
                }
            }
            Some(request) = reads.recv() => {
                read_entry(&dir, request).await;
            }
            _ = stop.cancelled(), if deadline.is_none() => {
                debug!("file: flush requested");
                deadline = Some(Instant::now() + grace);
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                break;
            }
            else => break,
        }
    }

    info!("file: finished flush");
    let _ = flushed.send(true);
}

/// Highest sequence number written per file, kept only while overflow
/// retries are in flight. Without outstanding retries every write is newer
/// than anything already on disk, so the log is emptied.
struct WriteLog {
    latest: HashMap<PathBuf, u64>,
    retries: Arc<AtomicUsize>,
}

impl WriteLog {
    fn new(retries: Arc<AtomicUsize>) -> Self {
        Self {
            latest: HashMap::new(),
            retries,
        }
    }

    /// Whether `request` may be written. Counts a retry as arrived.
    fn accept(&mut self, path: &Path, request: &WriteRequest) -> bool {
        if request.retried {
            self.retries.fetch_sub(1, Ordering::SeqCst);
        }
        self.latest.get(path).map_or(true, |&last| request.seq >= last)
    }

    fn record(&mut self, path: PathBuf, seq: u64) {
        if self.retries.load(Ordering::SeqCst) > 0 {
            self.latest.insert(path, seq);
        }
    }

    fn settle(&mut self) {
        if self.retries.load(Ordering::SeqCst) == 0 {
            self.latest.clear();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.latest.len()
    }
}

async fn write_entry(dir: &Path, log: &mut WriteLog, request: WriteRequest) {
    let Some(path) = entry_path(dir, &request.key) else {
        if request.retried {
            log.retries.fetch_sub(1, Ordering::SeqCst);
        }
        log.settle();
        return;
    };

    if !log.accept(&path, &request) {
        debug!("file: skipping stale write for '{}'", request.key);
    } else if let Err(e) = tokio::fs::write(&path, request.data.as_bytes()).await {
        error!("file write: can not write '{}': {}", path.display(), e);
    } else {
        log.record(path, request.seq);
    }
    log.settle();
}

async fn read_entry(dir: &Path, request: ReadRequest) {
    let data = match entry_path(dir, &request.key) {
        Some(path) => match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                error!("file read: can not read '{}': {}", path.display(), e);
                String::new()
            }
        },
        None => String::new(),
    };
    let _ = request.back.send(data);
}
