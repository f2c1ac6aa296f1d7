//! Asynchronous deletion of spilled files and directories.
//!
//! A single worker thread drains the deletion queue. It is started on the
//! first request and exits after `idle` without work; the next request
//! starts a new one. Deletion failures are retried once and then logged.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};

struct ReclaimerState {
    sender: Option<Sender<PathBuf>>,
    pending: usize,
    workers_started: u64,
}

struct Inner {
    state: Mutex<ReclaimerState>,
    drained: Condvar,
    idle: Duration,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ReclaimerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn done_one(&self) {
        let mut s = self.lock();
        s.pending = s.pending.saturating_sub(1);
        if s.pending == 0 {
            self.drained.notify_all();
        }
    }
}

#[derive(Clone)]
pub struct BackgroundReclaimer {
    inner: Arc<Inner>,
}

impl BackgroundReclaimer {
    pub fn new(idle: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ReclaimerState {
                    sender: None,
                    pending: 0,
                    workers_started: 0,
                }),
                drained: Condvar::new(),
                idle,
            }),
        }
    }

    /// Queue `paths` for deletion. Files and directory trees both work.
    pub fn delete<I>(&self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for path in paths {
            self.delete_one(path);
        }
    }

    fn delete_one(&self, path: PathBuf) {
        let mut s = self.inner.lock();
        s.pending += 1;
        if s.sender.is_none() {
            let (tx, rx) = unbounded::<PathBuf>();
            let inner = Arc::clone(&self.inner);
            let spawned = std::thread::Builder::new()
                .name("rowstore-reclaimer".into())
                .spawn(move || loop {
                    match rx.recv_timeout(inner.idle) {
                        Ok(path) => {
                            remove_path(&path);
                            inner.done_one();
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            let mut s = inner.lock();
                            if s.pending == 0 {
                                s.sender = None;
                                return;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                });
            match spawned {
                Ok(_) => {
                    s.sender = Some(tx);
                    s.workers_started += 1;
                }
                Err(e) => {
                    tracing::warn!("could not start reclaimer thread ({}), deleting inline", e);
                    drop(s);
                    remove_path(&path);
                    self.inner.done_one();
                    return;
                }
            }
        }
        let sent = match &s.sender {
            Some(tx) => tx.send(path).map_err(|e| e.into_inner()),
            None => Err(path),
        };
        if let Err(path) = sent {
            s.sender = None;
            drop(s);
            remove_path(&path);
            self.inner.done_one();
        }
    }

    /// Block until every queued deletion has been attempted.
    pub fn wait_until_finished(&self) {
        let mut s = self.inner.lock();
        while s.pending > 0 {
            s = self
                .inner
                .drained
                .wait(s)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending
    }

    /// Number of worker threads started so far.
    pub fn workers_started(&self) -> u64 {
        self.inner.lock().workers_started
    }
}

fn try_remove(path: &Path) -> std::io::Result<()> {
    let res = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match res {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_path(path: &Path) {
    if try_remove(path).is_ok() {
        return;
    }
    if let Err(e) = try_remove(path) {
        tracing::warn!("failed to delete {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_deletes_files_and_dirs() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.bin");
        let sub = dir.path().join("blobs");
        std::fs::write(&file, b"x").unwrap();
        std::fs::create_dir_all(sub.join("col_0/000/000")).unwrap();
        std::fs::write(sub.join("col_0/000/000/0.bin"), b"y").unwrap();

        let r = BackgroundReclaimer::new(Duration::from_secs(5));
        r.delete(vec![file.clone(), sub.clone(), dir.path().join("missing")]);
        r.wait_until_finished();

        assert!(!file.exists());
        assert!(!sub.exists());
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_worker_restarts_after_idle() {
        let dir = TempDir::new().unwrap();
        let r = BackgroundReclaimer::new(Duration::from_millis(20));

        let a = dir.path().join("a");
        std::fs::write(&a, b"1").unwrap();
        r.delete(vec![a.clone()]);
        r.wait_until_finished();

        // let the worker time out and exit
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while r.inner.lock().sender.is_some() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(r.inner.lock().sender.is_none());

        let b = dir.path().join("b");
        std::fs::write(&b, b"2").unwrap();
        r.delete(vec![b.clone()]);
        r.wait_until_finished();

        assert!(!a.exists() && !b.exists());
        assert_eq!(r.workers_started(), 2);
    }

    #[test]
    fn test_wait_without_work_returns() {
        let r = BackgroundReclaimer::new(Duration::from_secs(1));
        r.wait_until_finished();
        assert_eq!(r.workers_started(), 0);
    }
}
