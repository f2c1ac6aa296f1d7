//! Ordered concurrent ingestion into a `RowBuffer`.
//!
//! In parallel mode rows are grouped into batches of `row_batch_size`.
//! Each batch gets the next batch index and runs on the context's worker
//! pool, where it is validated against the schema, fed to a pooled domain
//! tracker and registered with the duplicate checker. Only the final write
//! into the buffer is ordered: the worker holding the next expected index
//! commits its batch, then drains every directly following batch already
//! parked in the pending map. No sequencer thread is involved.
//!
//! The producer holds at most `max_threads_per_container` batches in
//! flight. A permit is taken per submitted batch and returned exactly once,
//! when that batch is committed or discarded after a failure.
//!
//! On a low-memory edge the pipeline writes the buffer out, drains all
//! in-flight batches and stays sequential for the rest of its life.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::buffer::{BufferOptions, RowBuffer};
use crate::context::StoreContext;
use crate::data::Row;
use crate::domain::DomainTracker;
use crate::duplicate::DuplicateChecker;
use crate::error::{Result, TableError};
use crate::filestore::{FileStoreHandler, LocalFileStore};
use crate::memory::ListenerId;
use crate::repository::TableRepository;
use crate::schema::Schema;
use crate::settings::ContainerSettings;
use crate::table::ReadableTable;

// ── Permits ─────────────────────────────────────────────────────────

/// Counting limit on batches submitted but not yet committed.
struct Permits {
    in_flight: Mutex<usize>,
    cond: Condvar,
    max: usize,
}

impl Permits {
    fn new(max: usize) -> Self {
        Self {
            in_flight: Mutex::new(0),
            cond: Condvar::new(),
            max: max.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(&self) {
        let mut n = self.lock();
        while *n >= self.max {
            n = self.cond.wait(n).unwrap_or_else(|e| e.into_inner());
        }
        *n += 1;
    }

    fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut n = self.lock();
        *n = n.saturating_sub(count);
        self.cond.notify_all();
    }

    fn wait_idle(&self) {
        let mut n = self.lock();
        while *n > 0 {
            n = self.cond.wait(n).unwrap_or_else(|e| e.into_inner());
        }
    }
}

// ── Shared worker state ─────────────────────────────────────────────

struct CommitState {
    next_index: u64,
    pending: BTreeMap<u64, Vec<Row>>,
}

struct Shared {
    buffer: Arc<RowBuffer>,
    schema: Schema,
    duplicates: DuplicateChecker,
    force_blob_copy: bool,
    max_possible_values: Mutex<usize>,
    commit: Mutex<CommitState>,
    permits: Permits,
    failure: Mutex<Option<TableError>>,
    failed: AtomicBool,
    trackers: Mutex<Vec<DomainTracker>>,
}

impl Shared {
    fn failure(&self) -> Option<TableError> {
        if !self.failed.load(Ordering::Acquire) {
            return None;
        }
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(TableError::duplicate)
    }

    fn check(&self) -> Result<()> {
        match self.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Keep the first error only.
    fn record_failure(&self, error: TableError) {
        let mut slot = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            tracing::error!("ingestion into buffer {} failed: {}", self.buffer.buffer_id(), error);
            *slot = Some(error);
        }
        self.failed.store(true, Ordering::Release);
    }

    fn commit_state(&self) -> MutexGuard<'_, CommitState> {
        self.commit.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_tracker(&self) -> DomainTracker {
        let pooled = self.trackers.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let cap = *self
            .max_possible_values
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match pooled {
            Some(mut t) => {
                t.set_max_possible_values(cap);
                t
            }
            None => DomainTracker::new(&self.schema, cap),
        }
    }

    fn return_tracker(&self, tracker: DomainTracker) {
        self.trackers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tracker);
    }

    /// Order-independent part of a batch.
    fn prepare(&self, index: u64, rows: &[Row]) -> Result<()> {
        let mut guard = TrackerGuard {
            shared: self,
            tracker: Some(self.take_tracker()),
        };
        let tracker = guard.tracker.as_mut().ok_or_else(|| {
            TableError::IngestionFailed("domain tracker missing".into())
        })?;
        tracker.begin_batch(index);
        for row in rows {
            self.schema.validate_row(row)?;
            tracker.update(row);
            self.duplicates.add_key(&row.key)?;
        }
        Ok(())
    }

    /// Commit `rows` if it is the next batch, else park it.
    fn commit(&self, index: u64, rows: Vec<Row>) {
        let mut c = self.commit_state();
        if self.failed.load(Ordering::Acquire) {
            drop(c);
            self.permits.release(1);
            return;
        }
        if index != c.next_index {
            c.pending.insert(index, rows);
            return;
        }
        let mut batch = Some(rows);
        while let Some(rows) = batch {
            for row in rows {
                if let Err(e) = self.buffer.add_row(row, false, self.force_blob_copy) {
                    self.record_failure(e);
                    let parked = c.pending.len();
                    c.pending.clear();
                    drop(c);
                    self.permits.release(1 + parked);
                    return;
                }
            }
            c.next_index += 1;
            self.permits.release(1);
            let next = c.next_index;
            batch = c.pending.remove(&next);
        }
    }

    /// Drop a failed batch and everything parked behind it.
    fn abandon(&self, error: TableError) {
        self.record_failure(error);
        let parked = {
            let mut c = self.commit_state();
            let n = c.pending.len();
            c.pending.clear();
            n
        };
        self.permits.release(1 + parked);
    }

    fn run_batch(&self, index: u64, rows: Vec<Row>) {
        if self.failed.load(Ordering::Acquire) {
            self.permits.release(1);
            return;
        }
        let prepared = panic::catch_unwind(AssertUnwindSafe(|| self.prepare(index, &rows)));
        match prepared {
            Ok(Ok(())) => {
                let committed = panic::catch_unwind(AssertUnwindSafe(|| self.commit(index, rows)));
                if let Err(payload) = committed {
                    // the commit lock was poisoned or dropped mid-batch
                    self.abandon(TableError::IngestionFailed(panic_message(payload.as_ref())));
                }
            }
            Ok(Err(e)) => self.abandon(e),
            Err(payload) => {
                self.abandon(TableError::IngestionFailed(panic_message(payload.as_ref())))
            }
        }
    }
}

/// Returns a borrowed domain tracker to the pool, also on unwind.
struct TrackerGuard<'a> {
    shared: &'a Shared,
    tracker: Option<DomainTracker>,
}

impl Drop for TrackerGuard<'_> {
    fn drop(&mut self) {
        if let Some(t) = self.tracker.take() {
            self.shared.return_tracker(t);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

// ── IngestionPipeline ───────────────────────────────────────────────

pub struct IngestionPipeline {
    ctx: Arc<StoreContext>,
    settings: ContainerSettings,
    local: Option<Arc<TableRepository>>,
    shared: Arc<Shared>,
    sequential: bool,
    /// Tracker for rows committed inline.
    domain: DomainTracker,
    current: Vec<Row>,
    next_batch: u64,
    size: u64,
    low_memory: Arc<AtomicBool>,
    listener: Option<ListenerId>,
    table: Option<ReadableTable>,
    cleared: bool,
}

impl IngestionPipeline {
    /// New pipeline writing into a fresh buffer.
    ///
    /// The buffer gets a globally unique id when `track_globally` is set
    /// and -1 otherwise.
    pub fn new(
        ctx: &Arc<StoreContext>,
        schema: Schema,
        settings: ContainerSettings,
        local: Option<Arc<TableRepository>>,
    ) -> Result<Self> {
        Self::with_file_store(ctx, schema, settings, local, None)
    }

    /// Pipeline whose table is isolated from its producer: it owns a
    /// private file store and copies every foreign blob.
    pub fn isolated(
        ctx: &Arc<StoreContext>,
        schema: Schema,
        mut settings: ContainerSettings,
        local: Option<Arc<TableRepository>>,
    ) -> Result<Self> {
        settings.force_blob_copy = true;
        let store = LocalFileStore::create(&ctx.settings().temp_dir)?;
        Self::with_file_store(ctx, schema, settings, local, Some(Arc::new(store)))
    }

    fn with_file_store(
        ctx: &Arc<StoreContext>,
        schema: Schema,
        settings: ContainerSettings,
        local: Option<Arc<TableRepository>>,
        file_store: Option<Arc<dyn FileStoreHandler>>,
    ) -> Result<Self> {
        let buffer_id = if settings.track_globally {
            ctx.repository().generate_id()
        } else {
            -1
        };
        let buffer = RowBuffer::open(
            ctx,
            schema.clone(),
            settings.max_rows_in_memory(schema.len()),
            buffer_id,
            BufferOptions {
                settings: settings.buffer.clone(),
                file_store,
                local_repository: local.clone(),
            },
        )?;

        let domain = if settings.init_domain {
            DomainTracker::seeded(&schema, settings.max_possible_values)
        } else {
            DomainTracker::new(&schema, settings.max_possible_values)
        };
        let shared = Arc::new(Shared {
            buffer,
            duplicates: DuplicateChecker::new(Arc::clone(ctx), settings.duplicate_chunk_size),
            force_blob_copy: settings.force_blob_copy,
            max_possible_values: Mutex::new(settings.max_possible_values),
            commit: Mutex::new(CommitState {
                next_index: 0,
                pending: BTreeMap::new(),
            }),
            permits: Permits::new(settings.max_threads_per_container),
            failure: Mutex::new(None),
            failed: AtomicBool::new(false),
            trackers: Mutex::new(Vec::new()),
            schema,
        });

        let low_memory = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&low_memory);
        let listener = ctx.memory().register(Arc::new(move || {
            flag.store(true, Ordering::Release);
        }));

        tracing::debug!(
            "ingestion into buffer {}: {} mode, batches of {}, {} in flight",
            buffer_id,
            if settings.sequential { "sequential" } else { "parallel" },
            settings.row_batch_size,
            settings.max_threads_per_container
        );
        Ok(Self {
            ctx: Arc::clone(ctx),
            sequential: settings.sequential,
            current: Vec::with_capacity(settings.row_batch_size),
            settings,
            local,
            shared,
            domain,
            next_batch: 0,
            size: 0,
            low_memory,
            listener: Some(listener),
            table: None,
            cleared: false,
        })
    }

    fn check_open(&self) -> Result<()> {
        let id = self.shared.buffer.buffer_id();
        if self.cleared {
            return Err(TableError::BufferCleared(id));
        }
        if self.table.is_some() {
            return Err(TableError::BufferClosed(id));
        }
        Ok(())
    }

    /// Buffer the pipeline writes into.
    pub fn buffer(&self) -> &Arc<RowBuffer> {
        &self.shared.buffer
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    /// Rows accepted so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Schema the table is written with; carries the merged domain once closed.
    pub fn table_spec(&self) -> Schema {
        match &self.table {
            Some(table) => table.schema(),
            None => self.shared.schema.clone(),
        }
    }

    /// Cap for tracked possible values. Applies to rows not yet merged.
    pub fn set_max_possible_values(&mut self, max: usize) {
        *self
            .shared
            .max_possible_values
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = max;
        self.domain.set_max_possible_values(max);
    }

    pub fn add_row(&mut self, row: Row) -> Result<()> {
        self.check_open()?;
        self.shared.check()?;
        if self.low_memory.swap(false, Ordering::AcqRel) {
            self.on_low_memory()?;
        }
        if self.sequential {
            self.shared.schema.validate_row(&row)?;
            self.domain.update(&row);
            self.shared.duplicates.add_key(&row.key)?;
            self.shared
                .buffer
                .add_row(row, false, self.settings.force_blob_copy)?;
        } else {
            self.current.push(row);
            if self.current.len() >= self.settings.row_batch_size.max(1) {
                self.submit_batch()?;
            }
        }
        self.size += 1;
        Ok(())
    }

    fn submit_batch(&mut self) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let rows = std::mem::replace(
            &mut self.current,
            Vec::with_capacity(self.settings.row_batch_size),
        );
        let index = self.next_batch;
        self.next_batch += 1;

        self.shared.permits.acquire();
        if let Some(e) = self.shared.failure() {
            self.shared.permits.release(1);
            return Err(e);
        }
        let shared = Arc::clone(&self.shared);
        self.ctx
            .pool()
            .spawn(move || shared.run_batch(index, rows));
        Ok(())
    }

    /// Submit the partial batch and wait until everything is committed.
    pub fn flush_pending(&mut self) -> Result<()> {
        self.check_open()?;
        self.submit_batch()?;
        self.shared.permits.wait_idle();
        self.shared.check()
    }

    fn on_low_memory(&mut self) -> Result<()> {
        self.shared.duplicates.flush()?;
        if self.sequential {
            return Ok(());
        }
        self.submit_batch()?;
        self.shared.permits.wait_idle();
        self.shared.check()?;
        self.shared.buffer.flush_to_disk()?;
        self.sequential = true;
        self.domain.begin_batch(self.next_batch);
        tracing::debug!(
            "low memory: buffer {} continues sequentially after {} batches",
            self.shared.buffer.buffer_id(),
            self.next_batch
        );
        Ok(())
    }

    /// Wait for all batches, merge domains, check keys and close the buffer.
    ///
    /// The table is registered in the local and global repositories.
    pub fn close(&mut self) -> Result<ReadableTable> {
        self.check_open()?;
        self.submit_batch()?;
        self.shared.permits.wait_idle();
        self.shared.check()?;

        let mut merged = self.domain.clone();
        for tracker in self
            .shared
            .trackers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            merged.merge(tracker);
        }
        self.shared.duplicates.check()?;

        let schema = merged.apply(&self.shared.schema);
        let table = self.shared.buffer.close(schema)?;
        if let Some(local) = &self.local {
            local.register(table.clone());
        }
        self.ctx.repository().register(table.clone());
        self.shared.duplicates.clear();
        self.unregister_listener();
        tracing::debug!(
            "ingestion into buffer {} closed, {} rows",
            table.buffer_id(),
            self.size
        );
        self.table = Some(table.clone());
        Ok(table)
    }

    /// Abort or dispose: wait for workers, then release the buffer and its files.
    pub fn clear(&mut self) {
        if self.cleared {
            return;
        }
        self.cleared = true;
        self.current.clear();
        self.shared.permits.wait_idle();
        self.shared.duplicates.clear();
        self.unregister_listener();
        match self.table.take() {
            Some(table) => table.clear_in(self.local.as_deref()),
            None => self.shared.buffer.clear(),
        }
    }

    fn unregister_listener(&mut self) {
        if let Some(id) = self.listener.take() {
            self.ctx.memory().unregister(id);
        }
    }
}

impl Drop for IngestionPipeline {
    fn drop(&mut self) {
        self.shared.permits.wait_idle();
        self.unregister_listener();
    }
}

// ── Tests ───────────────────────────────────────────────────────────
