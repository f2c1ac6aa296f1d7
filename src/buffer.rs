//! Row buffer: the memory/disk spill engine.
//!
//! Rows accumulate in memory until more than `max_rows_in_memory` have
//! been added; then all of them are written to a temp file and every later
//! row goes straight to disk. A low-memory alert forces the same spill
//! early, from a separate thread.
//!
//! Closing a memory-resident buffer publishes its rows in the context's
//! `ReferenceCache`. The hard cache reference is only dropped after the
//! rows were written to disk, either on a later memory alert or never.
//!
//! Blob cells are intercepted in `add_row`. Each blob ends up in exactly
//! one of the `Adoption` outcomes below; blobs this buffer takes ownership
//! of get a fresh `BlobAddress` rooted here and a file in the blob directory.
//!
//! Nothing is deleted implicitly. `clear` releases the files, and
//! `StoreContext::shutdown` clears buffers that are still alive.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::blob;
use crate::cache::Cacheable;
use crate::context::StoreContext;
use crate::data::{BlobAddress, BlobCell, BlobSource, BlobValue, Cell, Row, RowKey};
use crate::error::{Result, TableError};
use crate::filestore::FileStoreHandler;
use crate::format::{
    self, BufferMeta, RowReader, RowWriter, StoredCell, CURRENT_VERSION, CURRENT_VERSION_NUMBER,
    OUTPUT_FORMAT,
};
use crate::iter::RowIterator;
use crate::lru::LruCache;
use crate::memory::ListenerId;
use crate::repository::TableRepository;
use crate::schema::Schema;
use crate::settings::BufferSettings;
use crate::table::ReadableTable;

/// Deserialized blobs kept per buffer.
pub const BLOB_CACHE_CAPACITY: usize = 100;

/// Options for `RowBuffer::open`.
#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    pub settings: BufferSettings,
    /// Large-object store of an isolated buffer.
    pub file_store: Option<Arc<dyn FileStoreHandler>>,
    /// Per-execution repository searched before the global one.
    pub local_repository: Option<Arc<TableRepository>>,
}

/// What `add_row` does with one blob cell.
enum Adoption {
    /// Minted by this buffer already.
    OwnedLocally,
    /// Owned by `source`; copy its file into this buffer.
    CopyBytes {
        source: Arc<dyn BlobSource>,
        address: BlobAddress,
    },
    /// Owned by another registered buffer; keep the reference.
    ReferenceOnly,
    /// Payload only (or its owner is gone); write it out here.
    WriteFresh,
}

struct BufferState {
    schema: Schema,
    size: u64,
    list: Option<Vec<Row>>,
    writer: Option<RowWriter>,
    data_file: Option<PathBuf>,
    blob_dir: Option<PathBuf>,
    blob_indices: Vec<u32>,
    /// Foreign address -> local copy, so a blob is copied once.
    copied_blobs: HashMap<BlobAddress, BlobAddress>,
    contains_blobs: bool,
    /// Some blob cells reference files of other buffers.
    foreign_blobs: bool,
    closed: bool,
    version: u32,
    /// Delete data file and blob directory on clear.
    owns_files: bool,
    /// Re-publish rows in the cache after a full read from disk.
    restore_into_memory: bool,
}

pub struct RowBuffer {
    ctx: Arc<StoreContext>,
    me: Weak<RowBuffer>,
    buffer_id: i32,
    identity: u64,
    settings: BufferSettings,
    max_rows_in_memory: usize,
    file_store: Option<Arc<dyn FileStoreHandler>>,
    local_repository: Option<Arc<TableRepository>>,
    state: Mutex<BufferState>,
    blob_cache: Mutex<LruCache<BlobAddress, Arc<BlobValue>>>,
    listener: Mutex<Option<ListenerId>>,
    corruption_logged: Arc<AtomicBool>,
    flushed: AtomicBool,
    cleared: AtomicBool,
}

impl RowBuffer {
    /// Create an empty buffer open for writing.
    ///
    /// `max_rows_in_memory == 0` spills on the first row. `buffer_id == -1`
    /// means the buffer is not tracked in any repository.
    pub fn open(
        ctx: &Arc<StoreContext>,
        schema: Schema,
        max_rows_in_memory: usize,
        buffer_id: i32,
        options: BufferOptions,
    ) -> Result<Arc<RowBuffer>> {
        let columns = schema.len();
        let buffer = Arc::new_cyclic(|me| RowBuffer {
            ctx: Arc::clone(ctx),
            me: me.clone(),
            buffer_id,
            identity: ctx.next_identity(),
            settings: options.settings,
            max_rows_in_memory,
            file_store: options.file_store,
            local_repository: options.local_repository,
            state: Mutex::new(BufferState {
                schema,
                size: 0,
                list: Some(Vec::new()),
                writer: None,
                data_file: None,
                blob_dir: None,
                blob_indices: vec![0; columns],
                copied_blobs: HashMap::new(),
                contains_blobs: false,
                foreign_blobs: false,
                closed: false,
                version: CURRENT_VERSION_NUMBER,
                owns_files: true,
                restore_into_memory: false,
            }),
            blob_cache: Mutex::new(LruCache::new(BLOB_CACHE_CAPACITY)),
            listener: Mutex::new(None),
            corruption_logged: Arc::new(AtomicBool::new(false)),
            flushed: AtomicBool::new(false),
            cleared: AtomicBool::new(false),
        });
        if let Some(store) = &buffer.file_store {
            ctx.track_file_store(buffer.identity, &buffer.me, store);
        }
        if max_rows_in_memory > 0 {
            buffer.register_memory_listener();
        }
        tracing::debug!(
            "opened buffer {} (identity {}), {} rows in memory",
            buffer_id,
            buffer.identity,
            max_rows_in_memory
        );
        Ok(buffer)
    }

    /// Closed buffer reading an existing data file in place.
    ///
    /// The files are never deleted by this buffer.
    pub(crate) fn from_files(
        ctx: &Arc<StoreContext>,
        schema: Schema,
        meta: &BufferMeta,
        data_file: PathBuf,
        blob_dir: Option<PathBuf>,
        file_store: Option<Arc<dyn FileStoreHandler>>,
    ) -> Arc<RowBuffer> {
        let columns = schema.len();
        Arc::new_cyclic(|me| RowBuffer {
            ctx: Arc::clone(ctx),
            me: me.clone(),
            buffer_id: meta.buffer_id,
            identity: ctx.next_identity(),
            settings: meta.format_settings.clone(),
            max_rows_in_memory: 0,
            file_store,
            local_repository: None,
            state: Mutex::new(BufferState {
                schema,
                size: meta.row_count,
                list: None,
                writer: None,
                data_file: Some(data_file),
                blob_dir,
                blob_indices: vec![0; columns],
                copied_blobs: HashMap::new(),
                contains_blobs: meta.contains_blobs,
                foreign_blobs: false,
                closed: true,
                version: format::version_number(&meta.version),
                owns_files: false,
                restore_into_memory: meta.in_memory,
            }),
            blob_cache: Mutex::new(LruCache::new(BLOB_CACHE_CAPACITY)),
            listener: Mutex::new(None),
            corruption_logged: Arc::new(AtomicBool::new(false)),
            flushed: AtomicBool::new(true),
            cleared: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_not_cleared(&self) -> Result<()> {
        if self.cleared.load(Ordering::Acquire) {
            return Err(TableError::BufferCleared(self.buffer_id));
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn buffer_id(&self) -> i32 {
        self.buffer_id
    }

    /// Process-unique identity, also the cache key.
    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn context(&self) -> &Arc<StoreContext> {
        &self.ctx
    }

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn schema(&self) -> Schema {
        self.lock().schema.clone()
    }

    pub fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    pub fn max_rows_in_memory(&self) -> usize {
        self.max_rows_in_memory
    }

    /// Whether rows have been written to a backing file.
    pub fn uses_out_file(&self) -> bool {
        self.lock().data_file.is_some()
    }

    pub fn contains_blobs(&self) -> bool {
        self.lock().contains_blobs
    }

    /// Whether rows reference blobs stored by other buffers.
    pub fn references_foreign_blobs(&self) -> bool {
        self.lock().foreign_blobs
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }

    /// Internal format version this buffer was written with.
    pub fn version(&self) -> u32 {
        self.lock().version
    }

    pub fn data_file(&self) -> Option<PathBuf> {
        self.lock().data_file.clone()
    }

    pub fn blob_dir(&self) -> Option<PathBuf> {
        self.lock().blob_dir.clone()
    }

    pub fn file_store(&self) -> Option<&Arc<dyn FileStoreHandler>> {
        self.file_store.as_ref()
    }

    pub fn local_repository(&self) -> Option<&Arc<TableRepository>> {
        self.local_repository.as_ref()
    }

    /// Metadata describing the data file of this buffer.
    pub fn meta(&self) -> BufferMeta {
        let st = self.lock();
        BufferMeta {
            row_count: st.size,
            version: version_string(st.version),
            contains_blobs: st.contains_blobs,
            buffer_id: self.buffer_id,
            output_format: OUTPUT_FORMAT.to_string(),
            format_settings: self.settings.clone(),
            in_memory: st.restore_into_memory,
        }
    }

    /// Whether a complete file read puts the rows back into the cache.
    pub fn restores_into_memory(&self) -> bool {
        self.lock().restore_into_memory
    }

    // ── Memory alerts ───────────────────────────────────────────────

    fn register_memory_listener(&self) {
        let weak = self.me.clone();
        let id = self.ctx.memory().register(Arc::new(move || {
            if let Some(buffer) = weak.upgrade() {
                buffer.on_memory_alert();
            }
        }));
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    fn unregister_memory_listener(&self) {
        let id = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(id) = id {
            self.ctx.memory().unregister(id);
        }
    }

    /// Hand the flush to a transient thread; the alert must not block.
    fn on_memory_alert(&self) {
        let Some(buffer) = self.me.upgrade() else {
            return;
        };
        let spawned = std::thread::Builder::new()
            .name(format!("rowstore-flush-{}", self.buffer_id))
            .spawn(move || {
                if let Err(e) = buffer.flush_to_disk() {
                    tracing::error!(
                        "writing buffer {} to disk after memory alert failed: {}",
                        buffer.buffer_id,
                        e
                    );
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("could not start flush thread for buffer {}: {}", self.buffer_id, e);
        }
    }

    // ── Writing ─────────────────────────────────────────────────────

    /// Append a row.
    ///
    /// `copy_for_upgrade` and `force_blob_copy` make this buffer take
    /// ownership of every blob not minted by it.
    pub fn add_row(&self, row: Row, copy_for_upgrade: bool, force_blob_copy: bool) -> Result<()> {
        self.check_not_cleared()?;
        let mut st = self.lock();
        if st.closed {
            return Err(TableError::BufferClosed(self.buffer_id));
        }
        let row = self.intercept_blobs(&mut st, row, copy_for_upgrade || force_blob_copy)?;

        if let Some(list) = st.list.as_mut() {
            list.push(row);
            let resident = list.len();
            st.size += 1;
            if resident > self.max_rows_in_memory {
                self.spill(&mut st)?;
            }
            return Ok(());
        }
        match st.writer.as_mut() {
            Some(writer) => writer.write_row(&row)?,
            None => return Err(TableError::BufferClosed(self.buffer_id)),
        }
        st.size += 1;
        Ok(())
    }

    /// Write resident rows to disk now.
    ///
    /// Open buffers switch to write-through. A closed buffer whose rows
    /// only live in the cache writes them out and then releases the hard
    /// cache reference. No-op if already on disk or cleared.
    pub fn flush_to_disk(&self) -> Result<()> {
        if self.is_cleared() {
            return Ok(());
        }
        let mut st = self.lock();
        if !st.closed {
            if st.list.as_ref().is_some_and(|l| !l.is_empty()) {
                self.spill(&mut st)?;
            }
            return Ok(());
        }
        if self.flushed.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(rows) = self.ctx.cache().get_silent(self.identity) else {
            return Ok(());
        };
        let path = self.ensure_data_file(&mut st)?;
        let mut writer = RowWriter::create(&path, &self.settings)?;
        for row in rows.iter() {
            writer.write_row(row)?;
        }
        writer.finish()?;
        self.flushed.store(true, Ordering::Release);
        drop(st);
        self.unregister_memory_listener();
        self.ctx.cache().clear_for_reclaim(self)?;
        tracing::debug!(
            "buffer {}: {} cached rows written to disk",
            self.buffer_id,
            rows.len()
        );
        Ok(())
    }

    fn spill(&self, st: &mut BufferState) -> Result<()> {
        let path = self.ensure_data_file(st)?;
        let mut writer = RowWriter::create(&path, &self.settings)?;
        let rows = st.list.take().unwrap_or_default();
        for row in &rows {
            writer.write_row(row)?;
        }
        st.writer = Some(writer);
        tracing::debug!(
            "buffer {} spilled {} rows to {}",
            self.buffer_id,
            rows.len(),
            path.display()
        );
        // nothing left to spill
        self.unregister_memory_listener();
        Ok(())
    }

    fn ensure_data_file(&self, st: &mut BufferState) -> Result<PathBuf> {
        if let Some(path) = &st.data_file {
            return Ok(path.clone());
        }
        let path = self.ctx.create_temp_file("rowstore-", ".bin")?;
        self.ctx.track_file(self.identity, &self.me, &path);
        st.data_file = Some(path.clone());
        Ok(path)
    }

    fn ensure_blob_dir(&self, st: &mut BufferState) -> Result<PathBuf> {
        if let Some(dir) = &st.blob_dir {
            return Ok(dir.clone());
        }
        let dir = self.ctx.create_temp_dir("rowstore-blobs-")?;
        self.ctx.track_file(self.identity, &self.me, &dir);
        st.blob_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Finish writing. Memory-resident rows move into the cache.
    pub fn close(&self, schema: Schema) -> Result<ReadableTable> {
        self.check_not_cleared()?;
        let mut st = self.lock();
        if st.closed {
            return Err(TableError::BufferClosed(self.buffer_id));
        }
        st.schema = schema;
        st.closed = true;
        let size = st.size;
        if let Some(rows) = st.list.take() {
            // stays registered: a memory alert writes the rows out later
            st.restore_into_memory = true;
            self.ctx.cache().put(self.identity, Arc::new(rows));
            drop(st);
        } else {
            let writer = st.writer.take();
            drop(st);
            if let Some(writer) = writer {
                writer.finish()?;
            }
            self.flushed.store(true, Ordering::Release);
            self.unregister_memory_listener();
        }
        let me = self
            .me
            .upgrade()
            .ok_or(TableError::BufferCleared(self.buffer_id))?;
        tracing::debug!("closed buffer {} with {} rows", self.buffer_id, size);
        Ok(ReadableTable::new(me))
    }

    // ── Blob interception ───────────────────────────────────────────

    fn intercept_blobs(&self, st: &mut BufferState, row: Row, must_own: bool) -> Result<Row> {
        if !row.contains_blobs() {
            return Ok(row);
        }
        let mut cells = Vec::with_capacity(row.cells.len());
        for (col, cell) in row.cells.into_iter().enumerate() {
            match cell {
                Cell::Blob(blob) => {
                    let adopted = self.adopt_blob(st, col, blob, must_own)?;
                    cells.push(Cell::Blob(adopted));
                }
                other => cells.push(other),
            }
        }
        st.contains_blobs = true;
        Ok(Row::new(row.key, cells))
    }

    fn is_self(&self, source: &Arc<dyn BlobSource>) -> bool {
        Arc::as_ptr(source) as *const () == self as *const RowBuffer as *const ()
    }

    /// Whether `blob` was minted by this buffer instance.
    fn owns(&self, blob: &BlobCell) -> bool {
        let Some(address) = blob.address() else {
            return false;
        };
        if address.buffer_id != self.buffer_id {
            return false;
        }
        if self.buffer_id == -1 && address.identity != Some(self.identity) {
            return false;
        }
        match blob.owner() {
            Some(owner) => self.is_self(&owner),
            None => true,
        }
    }

    /// Find the buffer owning `address`: the cell's owner, then the local
    /// repository, then the global one.
    fn find_owner(&self, blob: &BlobCell, address: &BlobAddress) -> Option<Arc<dyn BlobSource>> {
        if let Some(owner) = blob.owner() {
            return Some(owner);
        }
        self.lookup_buffer(address.buffer_id)
            .map(|b| b as Arc<dyn BlobSource>)
    }

    fn lookup_buffer(&self, buffer_id: i32) -> Option<Arc<RowBuffer>> {
        if buffer_id < 0 {
            return None;
        }
        self.local_repository
            .as_ref()
            .and_then(|r| r.get(buffer_id))
            .or_else(|| self.ctx.repository().get(buffer_id))
            .map(|t| Arc::clone(t.buffer()))
    }

    fn resolves_to_owner(&self, blob: &BlobCell, address: &BlobAddress) -> bool {
        let Some(registered) = self.lookup_buffer(address.buffer_id) else {
            return false;
        };
        match blob.owner() {
            Some(owner) => {
                Arc::as_ptr(&owner) as *const () == Arc::as_ptr(&registered) as *const ()
            }
            None => true,
        }
    }

    fn classify(&self, blob: &BlobCell, must_own: bool) -> Adoption {
        let Some(address) = blob.address().copied() else {
            return Adoption::WriteFresh;
        };
        if self.owns(blob) {
            return Adoption::OwnedLocally;
        }
        // A reference survives a spill only if the id resolves back to the
        // very buffer that minted the blob.
        if !must_own && self.resolves_to_owner(blob, &address) {
            return Adoption::ReferenceOnly;
        }
        match self.find_owner(blob, &address) {
            Some(source) => Adoption::CopyBytes { source, address },
            None => Adoption::WriteFresh,
        }
    }

    fn mint(&self, st: &mut BufferState, column: usize, compressed: bool) -> BlobAddress {
        if st.blob_indices.len() <= column {
            st.blob_indices.resize(column + 1, 0);
        }
        let index = st.blob_indices[column];
        st.blob_indices[column] += 1;
        BlobAddress {
            buffer_id: self.buffer_id,
            column: column as u32,
            index,
            compressed,
            identity: (self.buffer_id == -1).then_some(self.identity),
        }
    }

    fn self_source(&self) -> Weak<dyn BlobSource> {
        let me: Weak<dyn BlobSource> = self.me.clone();
        me
    }

    fn adopt_blob(
        &self,
        st: &mut BufferState,
        column: usize,
        blob: BlobCell,
        must_own: bool,
    ) -> Result<BlobCell> {
        match self.classify(&blob, must_own) {
            Adoption::OwnedLocally => Ok(blob),
            Adoption::ReferenceOnly => {
                st.foreign_blobs = true;
                Ok(blob)
            }
            Adoption::WriteFresh => {
                let value = blob.resolve()?;
                let compressed = self.ctx.compression().should_compress(&value.kind);
                let address = self.mint(st, column, compressed);
                let dir = self.ensure_blob_dir(st)?;
                blob::write_blob(&dir, &address, &value.bytes)?;
                Ok(BlobCell::stored(
                    address,
                    blob.kind(),
                    Some(self.self_source()),
                    Some(value),
                ))
            }
            Adoption::CopyBytes { source, address } => {
                if let Some(local) = st.copied_blobs.get(&address).copied() {
                    return Ok(BlobCell::stored(
                        local,
                        blob.kind(),
                        Some(self.self_source()),
                        blob.cached_value().cloned(),
                    ));
                }
                let local = self.mint(st, column, address.compressed);
                let dir = self.ensure_blob_dir(st)?;
                match source.blob_file(&address).filter(|p| p.is_file()) {
                    Some(file) => {
                        blob::copy_blob_file(&file, &dir, &local)?;
                    }
                    None => {
                        let value = match blob.cached_value() {
                            Some(v) => Arc::clone(v),
                            None => source.read_blob(&address, blob.kind())?,
                        };
                        blob::write_blob(&dir, &local, &value.bytes)?;
                    }
                }
                st.copied_blobs.insert(address, local);
                Ok(BlobCell::stored(
                    local,
                    blob.kind(),
                    Some(self.self_source()),
                    blob.cached_value().cloned(),
                ))
            }
        }
    }

    // ── Reading ─────────────────────────────────────────────────────

    /// Fresh iterator over all rows. Only valid once closed.
    pub fn iter(&self) -> Result<RowIterator> {
        self.check_not_cleared()?;
        let st = self.lock();
        if !st.closed {
            return Err(TableError::NotClosed(self.buffer_id));
        }
        if let Some(rows) = self.ctx.cache().get(self.identity) {
            return Ok(RowIterator::from_memory(rows));
        }
        let path = match (&st.data_file, self.flushed.load(Ordering::Acquire)) {
            (Some(path), true) => path.clone(),
            _ => {
                return Err(TableError::InvalidFormat(format!(
                    "buffer {} has neither cached rows nor a complete data file",
                    self.buffer_id
                )))
            }
        };
        let reader = RowReader::open(
            &path,
            &self.settings,
            st.schema.len(),
            Arc::clone(&self.corruption_logged),
        )?;
        let restore = st.restore_into_memory;
        let size = st.size;
        drop(st);
        let me = self
            .me
            .upgrade()
            .ok_or(TableError::BufferCleared(self.buffer_id))?;
        Ok(RowIterator::from_file(me, reader, size, restore))
    }

    /// Turn a decoded row into a `Row`, attaching blob owners.
    pub(crate) fn materialize(&self, key: RowKey, cells: Vec<StoredCell>) -> Row {
        let cells = cells
            .into_iter()
            .map(|cell| match cell {
                StoredCell::Missing => Cell::Missing,
                StoredCell::Value(v) => Cell::Value(v),
                StoredCell::Blob { mut address, kind } => {
                    // foreign -1 blobs are always copied in, so a -1 address
                    // in this file is our own
                    let mine = address.buffer_id == self.buffer_id;
                    let owner = if mine {
                        if self.buffer_id == -1 {
                            address.identity = Some(self.identity);
                        }
                        Some(self.self_source())
                    } else {
                        self.lookup_buffer(address.buffer_id).map(|b| {
                            let owner: Arc<dyn BlobSource> = b;
                            Arc::downgrade(&owner)
                        })
                    };
                    Cell::Blob(BlobCell::stored(address, kind, owner, None))
                }
            })
            .collect();
        Row::new(key, cells)
    }

    /// Called by a file iterator that read every row.
    pub(crate) fn restore_into_cache(&self, rows: Vec<Row>) {
        if self.is_cleared() {
            return;
        }
        self.ctx.cache().put_soft(self.identity, Arc::new(rows));
    }

    // ── Disposal ────────────────────────────────────────────────────

    /// Release everything: cache entries, memory listener, temp files,
    /// file store. Safe to call more than once.
    pub fn clear(&self) {
        if self.cleared.swap(true, Ordering::AcqRel) {
            return;
        }
        self.unregister_memory_listener();
        self.ctx.cache().invalidate(self.identity);

        let mut paths = Vec::new();
        {
            let mut st = self.lock();
            st.list = None;
            st.writer = None;
            if st.owns_files {
                paths.extend(st.data_file.take());
                paths.extend(st.blob_dir.take());
            }
        }
        if let Ok(mut cache) = self.blob_cache.lock() {
            cache.clear();
        }
        if let Some(store) = &self.file_store {
            store.dispose(self.ctx.reclaimer());
        }
        let deleted = paths.len();
        self.ctx.reclaimer().delete(paths);
        self.ctx.forget_buffer(self.identity);
        tracing::debug!(
            "cleared buffer {} ({} paths queued for deletion)",
            self.buffer_id,
            deleted
        );
    }
}

fn version_string(version: u32) -> String {
    if version == CURRENT_VERSION_NUMBER {
        return CURRENT_VERSION.to_string();
    }
    format!("rowstore_{version}")
}

impl BlobSource for RowBuffer {
    fn read_blob(&self, address: &BlobAddress, kind: &str) -> Result<Arc<BlobValue>> {
        if let Ok(mut cache) = self.blob_cache.lock() {
            if let Some(v) = cache.get(address) {
                return Ok(Arc::clone(v));
            }
        }
        let path = self.blob_file(address).ok_or_else(|| {
            TableError::InvalidFormat(format!(
                "buffer {} has no blob directory for {}",
                self.buffer_id, address
            ))
        })?;
        let bytes = blob::read_blob_file(&path, address.compressed)?;
        let value = Arc::new(BlobValue::new(kind, bytes));
        if let Ok(mut cache) = self.blob_cache.lock() {
            cache.put(*address, Arc::clone(&value));
        }
        Ok(value)
    }

    fn blob_file(&self, address: &BlobAddress) -> Option<PathBuf> {
        let dir = self.lock().blob_dir.clone()?;
        Some(blob::blob_path(&dir, address))
    }
}

impl Cacheable for RowBuffer {
    fn cache_id(&self) -> u64 {
        self.identity
    }

    fn is_flushed_to_disk(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for RowBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowBuffer")
            .field("buffer_id", &self.buffer_id)
            .field("identity", &self.identity)
            .field("cleared", &self.is_cleared())
            .finish()
    }
}
