//! Directory archive of a closed table.
//!
//! Layout:
//!
//! ```text
//! <dir>/spec.json        schema, read before anything else
//! <dir>/meta.json        BufferMeta
//! <dir>/data.bin         row stream
//! <dir>/blobs/...        col_<i>/<hi>/<lo>/<index>.bin[.gz]
//! <dir>/filestores/...   only for isolated tables
//! ```
//!
//! A table is written with a deep copy when its rows are not on disk yet,
//! when its version is older than the current one, or when it references
//! blobs of other buffers. The copy owns all its blobs, so the archive is
//! self-contained. Otherwise the files are copied as they are.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::blob;
use crate::buffer::{BufferOptions, RowBuffer};
use crate::cache::Cacheable;
use crate::cancel::CancelToken;
use crate::context::StoreContext;
use crate::error::{Result, TableError};
use crate::filestore::{FileStoreHandler, LocalFileStore};
use crate::format::{BufferMeta, CURRENT_VERSION_NUMBER, OUTPUT_FORMAT};
use crate::schema::Schema;
use crate::table::ReadableTable;

pub const SPEC_FILE: &str = "spec.json";
pub const META_FILE: &str = "meta.json";
pub const DATA_FILE: &str = "data.bin";
pub const BLOB_DIR: &str = "blobs";
pub const FILESTORE_DIR: &str = "filestores";

/// Write `table` into `dir`. Partial output is removed on error or cancel.
pub fn save_table(table: &ReadableTable, dir: &Path, cancel: &CancelToken) -> Result<()> {
    match write_archive(table, dir, cancel) {
        Ok(()) => Ok(()),
        Err(e) => {
            remove_partial(dir);
            Err(e)
        }
    }
}

fn write_archive(table: &ReadableTable, dir: &Path, cancel: &CancelToken) -> Result<()> {
    fs::create_dir_all(dir)?;
    let schema = table.schema();
    write_json(&dir.join(SPEC_FILE), &schema)?;

    let buffer = table.buffer();
    let mut meta = if needs_deep_copy(buffer) {
        deep_copy(buffer, schema, dir, cancel)?
    } else {
        cancel.check()?;
        let data = buffer.data_file().ok_or_else(|| {
            TableError::InvalidFormat(format!("buffer {} has no data file", buffer.buffer_id()))
        })?;
        fs::copy(&data, dir.join(DATA_FILE))?;
        if let Some(blobs) = buffer.blob_dir() {
            cancel.check()?;
            blob::copy_dir_all(&blobs, &dir.join(BLOB_DIR))?;
        }
        buffer.meta()
    };
    meta.in_memory = buffer.restores_into_memory();

    if let Some(root) = buffer.file_store().and_then(|s| s.root()) {
        cancel.check()?;
        blob::copy_dir_all(root, &dir.join(FILESTORE_DIR))?;
    }
    write_json(&dir.join(META_FILE), &meta)?;
    tracing::debug!(
        "saved table {} ({} rows) to {}",
        meta.buffer_id,
        meta.row_count,
        dir.display()
    );
    Ok(())
}

fn needs_deep_copy(buffer: &RowBuffer) -> bool {
    !buffer.is_flushed_to_disk()
        || buffer.data_file().is_none()
        || buffer.version() < CURRENT_VERSION_NUMBER
        || buffer.references_foreign_blobs()
}

/// Copy every row into a fresh buffer with the same id that takes
/// ownership of all blobs, then move its files into `dir`.
fn deep_copy(
    source: &Arc<RowBuffer>,
    schema: Schema,
    dir: &Path,
    cancel: &CancelToken,
) -> Result<BufferMeta> {
    let ctx = source.context();
    let copy = RowBuffer::open(
        ctx,
        schema.clone(),
        0,
        source.buffer_id(),
        BufferOptions {
            settings: source.settings().clone(),
            file_store: None,
            local_repository: source.local_repository().cloned(),
        },
    )?;
    let result = (|| -> Result<BufferMeta> {
        for row in source.iter()? {
            cancel.check()?;
            copy.add_row(row, true, false)?;
        }
        copy.close(schema)?;
        copy.flush_to_disk()?;
        let data = copy.data_file().ok_or_else(|| {
            TableError::InvalidFormat("copied buffer has no data file".into())
        })?;
        fs::copy(&data, dir.join(DATA_FILE))?;
        if let Some(blobs) = copy.blob_dir() {
            cancel.check()?;
            blob::copy_dir_all(&blobs, &dir.join(BLOB_DIR))?;
        }
        Ok(copy.meta())
    })();
    copy.clear();
    if result.is_ok() {
        tracing::debug!(
            "buffer {} copied to version {} for archiving",
            source.buffer_id(),
            CURRENT_VERSION_NUMBER
        );
    }
    result
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut w, value)?;
    w.flush()?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let r = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(r)?)
}

fn remove_partial(dir: &Path) {
    for name in [SPEC_FILE, META_FILE, DATA_FILE] {
        let path = dir.join(name);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("could not remove {}: {}", path.display(), e);
            }
        }
    }
    for name in [BLOB_DIR, FILESTORE_DIR] {
        let path = dir.join(name);
        if path.exists() {
            if let Err(e) = fs::remove_dir_all(&path) {
                tracing::warn!("could not remove {}: {}", path.display(), e);
            }
        }
    }
}

/// Open an archive written by `save_table`. Files are read in place.
///
/// Tables with a buffer id >= 0 are registered in the global repository
/// unless that id is already taken.
pub fn load_table(ctx: &Arc<StoreContext>, dir: &Path) -> Result<ReadableTable> {
    let schema: Schema = read_json(&dir.join(SPEC_FILE))?;
    let meta: BufferMeta = read_json(&dir.join(META_FILE))?;
    if meta.output_format != OUTPUT_FORMAT {
        return Err(TableError::InvalidFormat(format!(
            "unsupported output format \"{}\"",
            meta.output_format
        )));
    }
    let data = dir.join(DATA_FILE);
    if !data.is_file() {
        return Err(TableError::InvalidFormat(format!(
            "archive {} has no {}",
            dir.display(),
            DATA_FILE
        )));
    }
    let blobs = dir.join(BLOB_DIR);
    let blob_dir = blobs.is_dir().then_some(blobs);
    let stores = dir.join(FILESTORE_DIR);
    let file_store = stores
        .is_dir()
        .then(|| Arc::new(LocalFileStore::open(&stores)) as Arc<dyn FileStoreHandler>);

    let buffer = RowBuffer::from_files(ctx, schema, &meta, data, blob_dir, file_store);
    let table = ReadableTable::new(buffer);
    let id = meta.buffer_id;
    if id >= 0 {
        if ctx.repository().get(id).is_none() {
            ctx.repository().register(table.clone());
        } else {
            ctx.repository().reserve_id(id);
            tracing::debug!("buffer id {} already registered, loaded table stays local", id);
        }
    }
    tracing::debug!(
        "loaded table {} ({} rows, version {}) from {}",
        id,
        meta.row_count,
        meta.version,
        dir.display()
    );
    Ok(table)
}
