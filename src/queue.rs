//! Serialized file operations.
//!
//! Every write and delete issued by the store goes through one FIFO worker,
//! so overlapping mutations of the same file are applied in submission order
//! and never interleave.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::IntoFuture;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("file queue worker has stopped")]
    Closed,
}

#[derive(Debug)]
enum FileOp {
    Write { path: PathBuf, contents: String },
    Delete { path: PathBuf },
    /// Completes once everything queued before it has been applied
    Barrier,
}

struct Job {
    op: FileOp,
    done: oneshot::Sender<Result<(), QueueError>>,
}

/// Handle to the single worker that applies file operations one at a time.
#[derive(Debug, Clone)]
pub struct FileQueue {
    tx: mpsc::UnboundedSender<Job>,
}

/// Completion of one queued operation. Dropping it does not cancel the
/// operation.
#[must_use = "await the handle to observe the outcome of the operation"]
pub struct Pending {
    rx: oneshot::Receiver<Result<(), QueueError>>,
}

impl IntoFuture for Pending {
    type Output = Result<(), QueueError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.rx
            .map(|result| result.unwrap_or(Err(QueueError::Closed)))
            .boxed()
    }
}

impl FileQueue {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(rx));
        Self { tx }
    }

    /// Queue writing `contents` to `path`, creating parent directories.
    pub fn enqueue_write(&self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Pending {
        self.submit(FileOp::Write {
            path: path.into(),
            contents: contents.into(),
        })
    }

    /// Queue deleting `path`. A missing file is not an error.
    pub fn enqueue_delete(&self, path: impl Into<PathBuf>) -> Pending {
        self.submit(FileOp::Delete { path: path.into() })
    }

    /// Wait until every operation queued so far has been applied.
    pub async fn flush(&self) -> Result<(), QueueError> {
        self.submit(FileOp::Barrier).await
    }

    fn submit(&self, op: FileOp) -> Pending {
        let (done, rx) = oneshot::channel();
        if let Err(rejected) = self.tx.send(Job { op, done }) {
            warn!(op = ?rejected.0.op, "File queue closed, dropping operation");
        }
        Pending { rx }
    }
}

impl Default for FileQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        let result = apply(&job.op).await;
        if let Err(e) = &result {
            warn!(error = %e, "File operation failed");
        }
        // The submitter may have dropped its handle
        let _ = job.done.send(result);
    }
    debug!("File queue drained and closed");
}

async fn apply(op: &FileOp) -> Result<(), QueueError> {
    match op {
        FileOp::Write { path, contents } => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| io_error("create directory for", path, source))?;
            }
            tokio::fs::write(path, contents)
                .await
                .map_err(|source| io_error("write", path, source))?;
            debug!(path = %path.display(), bytes = contents.len(), "Wrote file");
            Ok(())
        }
        FileOp::Delete { path } => match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "File already absent");
                Ok(())
            }
            Err(source) => Err(io_error("delete", path, source)),
        },
        FileOp::Barrier => Ok(()),
    }
}

fn io_error(action: &'static str, path: &Path, source: io::Error) -> QueueError {
    QueueError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_parent_directories() {
        let temp = TempDir::new().unwrap();
        let queue = FileQueue::new();
        let path = temp.path().join("a/b/rule.yaml");

        queue.enqueue_write(&path, "name: r\n").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "name: r\n");
    }

    #[tokio::test]
    async fn test_operations_on_one_path_apply_in_order() {
        let temp = TempDir::new().unwrap();
        let queue = FileQueue::new();
        let path = temp.path().join("rule.yaml");

        // Fire-and-forget submissions, observed only through flush
        for i in 0..50 {
            let _ = queue.enqueue_write(&path, format!("v{}", i));
        }
        let _ = queue.enqueue_delete(&path);
        let last = queue.enqueue_write(&path, "final");
        queue.flush().await.unwrap();

        last.await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "final");
    }

    #[tokio::test]
    async fn test_write_then_delete() {
        let temp = TempDir::new().unwrap();
        let queue = FileQueue::new();
        let path = temp.path().join("rule.yaml");

        let write = queue.enqueue_write(&path, "x");
        let delete = queue.enqueue_delete(&path);
        write.await.unwrap();
        delete.await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_ok() {
        let temp = TempDir::new().unwrap();
        let queue = FileQueue::new();

        queue
            .enqueue_delete(temp.path().join("missing.yaml"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let temp = TempDir::new().unwrap();
        let queue = FileQueue::new();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();

        let err = queue
            .enqueue_write(blocker.join("child.yaml"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Io { .. }));

        // The worker keeps going after a failure
        queue.enqueue_write(temp.path().join("ok.yaml"), "x").await.unwrap();
    }
}
