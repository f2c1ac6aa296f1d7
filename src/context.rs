//! Process-scoped state shared by all buffers and pipelines.
//!
//! Created once by the host application and passed by `Arc` to every
//! component that needs the cache, the reclaimer, the memory monitor, the
//! global table repository or the ingestion pool. `shutdown` clears every
//! buffer still holding temp files or a file store and waits for pending
//! deletions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::blob::CompressionPolicy;
use crate::buffer::RowBuffer;
use crate::cache::ReferenceCache;
use crate::error::{Result, TableError};
use crate::filestore::FileStoreHandler;
use crate::memory::{ListenerId, MemoryMonitor};
use crate::reclaim::BackgroundReclaimer;
use crate::repository::TableRepository;
use crate::settings::StoreSettings;

const MB: u64 = 1024 * 1024;

/// Buffer that created temp files or owns a file store.
struct OpenBuffer {
    buffer: Weak<RowBuffer>,
    files: Vec<PathBuf>,
    file_store: Option<Arc<dyn FileStoreHandler>>,
}

pub struct StoreContext {
    settings: StoreSettings,
    cache: ReferenceCache,
    reclaimer: BackgroundReclaimer,
    memory: MemoryMonitor,
    repository: TableRepository,
    compression: CompressionPolicy,
    pool: rayon::ThreadPool,
    open_buffers: Mutex<HashMap<u64, OpenBuffer>>,
    next_identity: AtomicU64,
    cache_listener: Mutex<Option<ListenerId>>,
}

impl StoreContext {
    pub fn new(settings: StoreSettings) -> Result<Arc<Self>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.worker_threads.max(1))
            .thread_name(|i| format!("rowstore-worker-{i}"))
            .build()
            .map_err(|e| TableError::IngestionFailed(format!("worker pool: {e}")))?;

        let ctx = Arc::new(Self {
            cache: ReferenceCache::new(
                settings.lru_cache_size,
                settings.weak_tier_capacity,
                settings.cache_stats_interval,
            ),
            reclaimer: BackgroundReclaimer::new(settings.reclaimer_idle),
            memory: MemoryMonitor::new(settings.memory_threshold),
            repository: TableRepository::new(),
            compression: CompressionPolicy::new(),
            pool,
            open_buffers: Mutex::new(HashMap::new()),
            next_identity: AtomicU64::new(1),
            cache_listener: Mutex::new(None),
            settings,
        });

        let weak = Arc::downgrade(&ctx);
        let id = ctx.memory.register(Arc::new(move || {
            if let Some(ctx) = weak.upgrade() {
                ctx.cache.reclaim();
            }
        }));
        *ctx.cache_listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
        Ok(ctx)
    }

    /// Context with settings from the environment.
    pub fn from_env() -> Result<Arc<Self>> {
        Self::new(StoreSettings::from_env())
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn cache(&self) -> &ReferenceCache {
        &self.cache
    }

    pub fn reclaimer(&self) -> &BackgroundReclaimer {
        &self.reclaimer
    }

    pub fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }

    /// Global buffer id -> table lookup.
    pub fn repository(&self) -> &TableRepository {
        &self.repository
    }

    pub fn compression(&self) -> &CompressionPolicy {
        &self.compression
    }

    pub(crate) fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    pub(crate) fn next_identity(&self) -> u64 {
        self.next_identity.fetch_add(1, Ordering::Relaxed)
    }

    // ── Temp files ──────────────────────────────────────────────────

    /// Fail fast if the temp partition is below the configured free space.
    pub fn check_disk_space(&self) -> Result<()> {
        let dir = &self.settings.temp_dir;
        let available = fs2::available_space(dir)?;
        let required = self.settings.min_free_disk_mb;
        if available < required.saturating_mul(MB) {
            return Err(TableError::InsufficientDiskSpace {
                path: dir.display().to_string(),
                available_mb: available / MB,
                required_mb: required,
            });
        }
        Ok(())
    }

    pub(crate) fn create_temp_file(&self, prefix: &str, suffix: &str) -> Result<PathBuf> {
        self.check_disk_space()?;
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(&self.settings.temp_dir)?;
        let (_, path) = file.keep().map_err(|e| TableError::Io(e.error))?;
        Ok(path)
    }

    pub(crate) fn create_temp_dir(&self, prefix: &str) -> Result<PathBuf> {
        self.check_disk_space()?;
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.settings.temp_dir)?;
        Ok(dir.into_path())
    }

    // ── Open buffer registry ────────────────────────────────────────

    fn open_buffers(&self) -> MutexGuard<'_, HashMap<u64, OpenBuffer>> {
        self.open_buffers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a temp file or directory created by the buffer `identity`.
    pub(crate) fn track_file(&self, identity: u64, buffer: &Weak<RowBuffer>, path: &Path) {
        let mut open = self.open_buffers();
        open.entry(identity)
            .or_insert_with(|| OpenBuffer {
                buffer: buffer.clone(),
                files: Vec::new(),
                file_store: None,
            })
            .files
            .push(path.to_path_buf());
    }

    /// Record a buffer owning `store`, before it writes any file.
    pub(crate) fn track_file_store(
        &self,
        identity: u64,
        buffer: &Weak<RowBuffer>,
        store: &Arc<dyn FileStoreHandler>,
    ) {
        let mut open = self.open_buffers();
        open.entry(identity)
            .or_insert_with(|| OpenBuffer {
                buffer: buffer.clone(),
                files: Vec::new(),
                file_store: None,
            })
            .file_store = Some(Arc::clone(store));
    }

    pub(crate) fn forget_buffer(&self, identity: u64) {
        self.open_buffers().remove(&identity);
    }

    /// Number of buffers currently holding temp files or a file store.
    pub fn open_buffer_count(&self) -> usize {
        self.open_buffers().len()
    }

    /// Clear every buffer that still owns temp files, drop registered
    /// tables and wait until all deletions have run.
    pub fn shutdown(&self) {
        let open: Vec<OpenBuffer> = self.open_buffers().drain().map(|(_, b)| b).collect();
        let mut cleared = 0usize;
        for entry in open {
            match entry.buffer.upgrade() {
                Some(buffer) => {
                    buffer.clear();
                    cleared += 1;
                }
                None => {
                    self.reclaimer.delete(entry.files);
                    if let Some(store) = entry.file_store {
                        store.dispose(&self.reclaimer);
                    }
                }
            }
        }
        for table in self.repository.drain() {
            table.buffer().clear();
        }
        if let Some(id) = self
            .cache_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.memory.unregister(id);
        }
        self.reclaimer.wait_until_finished();
        tracing::debug!("row store shut down, {} open buffers cleared", cleared);
    }
}

// ── Tests ───────────────────────────────────────────────────────────
