//! Integration test: RowBuffer spill engine and blob handling.
//!
//! Validates that:
//! - Rows read back equal the rows added, resident or spilled
//! - The spill threshold is exact (N rows resident, N+1 spill)
//! - Blob addresses are unique and owned by the minting buffer
//! - Foreign blobs are referenced or copied depending on the copy flags
//! - Blobs whose owner cannot be found by id are always copied
//! - clear() releases files and is idempotent

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rowstore::{
    BlobValue, BufferOptions, BufferSettings, CacheTier, Cacheable, Cell, ColumnSpec,
    DataCompression, DataType, RowBuffer, Row, Schema, StoreContext, StoreSettings, TableError,
    Value,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn create_context(dir: &Path) -> Arc<StoreContext> {
    StoreContext::new(StoreSettings {
        temp_dir: dir.to_path_buf(),
        min_free_disk_mb: 0,
        worker_threads: 2,
        ..StoreSettings::default()
    })
    .unwrap()
}

fn value_schema() -> Schema {
    Schema::new(vec![
        ColumnSpec::new("id", DataType::Long),
        ColumnSpec::new("name", DataType::String),
        ColumnSpec::new("tags", DataType::List),
    ])
}

fn value_row(i: i64) -> Row {
    let name = if i % 4 == 0 {
        Cell::Missing
    } else {
        Cell::Value(Value::String(format!("name_{}", i)))
    };
    Row::new(
        format!("Row{}", i),
        vec![
            Cell::Value(Value::Long(i)),
            name,
            Cell::Value(Value::List(vec![Value::Int(i as i32), Value::Boolean(i % 2 == 0)])),
        ],
    )
}

fn blob_schema() -> Schema {
    Schema::new(vec![
        ColumnSpec::new("id", DataType::Long),
        ColumnSpec::new("doc", DataType::Blob("doc".into())),
    ])
}

fn blob_row(i: i64) -> Row {
    Row::new(
        format!("Row{}", i),
        vec![
            Cell::Value(Value::Long(i)),
            Cell::from(BlobValue::new("doc", format!("payload {}", i).into_bytes())),
        ],
    )
}

fn options(compression: DataCompression, row_keys: bool) -> BufferOptions {
    BufferOptions {
        settings: BufferSettings {
            compression,
            row_keys,
        },
        ..BufferOptions::default()
    }
}

fn payload(cell: &Cell) -> Vec<u8> {
    cell.as_blob().unwrap().resolve().unwrap().bytes.clone()
}

// ---------------------------------------------------------------------------
// Tests: Round trip and spill policy
// ---------------------------------------------------------------------------

#[test]
fn rows_round_trip_resident_and_spilled() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());

    for limit in [100, 7, 0] {
        for compression in [DataCompression::Gzip, DataCompression::None] {
            let buffer =
                RowBuffer::open(&ctx, value_schema(), limit, -1, options(compression, true))
                    .unwrap();
            let rows: Vec<Row> = (0..20).map(value_row).collect();
            for row in &rows {
                buffer.add_row(row.clone(), false, false).unwrap();
            }
            let table = buffer.close(value_schema()).unwrap();
            assert_eq!(table.size(), 20);
            assert_eq!(buffer.uses_out_file(), limit < 20);

            let read: Vec<Row> = table.iter().unwrap().collect();
            assert_eq!(read, rows, "limit {} compression {:?}", limit, compression);
            // restartable
            assert_eq!(table.iter().unwrap().count(), 20);
            table.clear();
        }
    }
}

#[test]
fn spill_threshold_is_exact() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    let buffer = RowBuffer::open(&ctx, value_schema(), 5, -1, BufferOptions::default()).unwrap();

    for i in 0..5 {
        buffer.add_row(value_row(i), false, false).unwrap();
    }
    assert!(!buffer.uses_out_file());

    buffer.add_row(value_row(5), false, false).unwrap();
    assert!(buffer.uses_out_file());
    assert_eq!(buffer.size(), 6);
    buffer.clear();
}

#[test]
fn zero_limit_spills_on_first_row() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    let buffer = RowBuffer::open(&ctx, value_schema(), 0, -1, BufferOptions::default()).unwrap();
    buffer.add_row(value_row(0), false, false).unwrap();
    assert!(buffer.uses_out_file());
    buffer.clear();
}

#[test]
fn disabled_row_keys_are_synthesized() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    let buffer =
        RowBuffer::open(&ctx, value_schema(), 0, -1, options(DataCompression::Gzip, false))
            .unwrap();
    for key in ["alpha", "beta"] {
        let mut row = value_row(1);
        row.key = key.to_string();
        buffer.add_row(row, false, false).unwrap();
    }
    let table = buffer.close(value_schema()).unwrap();
    let keys: Vec<String> = table.iter().unwrap().map(|r| r.key).collect();
    assert_eq!(keys, vec!["Row0", "Row1"]);
    table.clear();
}

#[test]
fn state_errors() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    let buffer = RowBuffer::open(&ctx, value_schema(), 10, 3, BufferOptions::default()).unwrap();
    assert!(matches!(buffer.iter(), Err(TableError::NotClosed(3))));

    buffer.add_row(value_row(0), false, false).unwrap();
    let table = buffer.close(value_schema()).unwrap();
    assert!(matches!(
        buffer.add_row(value_row(1), false, false),
        Err(TableError::BufferClosed(3))
    ));

    table.clear();
    assert!(matches!(table.iter(), Err(TableError::BufferCleared(3))));
}

// ---------------------------------------------------------------------------
// Tests: Blobs
// ---------------------------------------------------------------------------

#[test]
fn blob_addresses_are_unique_and_owned() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    let buffer = RowBuffer::open(&ctx, blob_schema(), 0, 12, BufferOptions::default()).unwrap();
    for i in 0..50 {
        buffer.add_row(blob_row(i), false, false).unwrap();
    }
    let table = buffer.close(blob_schema()).unwrap();
    assert!(buffer.contains_blobs());

    let mut seen = HashSet::new();
    for (i, row) in table.iter().unwrap().enumerate() {
        let blob = row.cells[1].as_blob().unwrap();
        let address = *blob.address().unwrap();
        assert_eq!(address.buffer_id, 12);
        assert_eq!(address.column, 1);
        assert_eq!(address.index, i as u32);
        assert!(seen.insert(address));
        assert_eq!(payload(&row.cells[1]), format!("payload {}", i).into_bytes());
    }
    assert_eq!(seen.len(), 50);
    table.clear();
}

#[test]
fn foreign_blobs_are_referenced_unless_copy_is_forced() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());

    let source = RowBuffer::open(&ctx, blob_schema(), 0, 20, BufferOptions::default()).unwrap();
    for i in 0..5 {
        source.add_row(blob_row(i), false, false).unwrap();
    }
    let source_table = source.close(blob_schema()).unwrap();
    ctx.repository().register(source_table.clone());

    // reference only
    let referencing =
        RowBuffer::open(&ctx, blob_schema(), 0, 21, BufferOptions::default()).unwrap();
    for row in source_table.iter().unwrap() {
        referencing.add_row(row, false, false).unwrap();
    }
    let referencing_table = referencing.close(blob_schema()).unwrap();
    assert!(referencing.blob_dir().is_none());
    assert!(referencing.references_foreign_blobs());
    for row in referencing_table.iter().unwrap() {
        assert_eq!(row.cells[1].as_blob().unwrap().address().unwrap().buffer_id, 20);
    }

    // forced copy
    let copied = RowBuffer::open(&ctx, blob_schema(), 0, 22, BufferOptions::default()).unwrap();
    for row in source_table.iter().unwrap() {
        copied.add_row(row, false, true).unwrap();
    }
    let copied_table = copied.close(blob_schema()).unwrap();
    assert!(copied.blob_dir().is_some());

    source_table.clear();
    ctx.reclaimer().wait_until_finished();

    for (i, row) in copied_table.iter().unwrap().enumerate() {
        let blob = row.cells[1].as_blob().unwrap();
        assert_eq!(blob.address().unwrap().buffer_id, 22);
        assert_eq!(payload(&row.cells[1]), format!("payload {}", i).into_bytes());
    }

    let row = referencing_table.iter().unwrap().next().unwrap();
    match row.cells[1].as_blob().unwrap().resolve() {
        Err(TableError::BlobOwnerMissing { buffer_id }) => assert_eq!(buffer_id, 20),
        other => panic!("unexpected {:?}", other),
    }
    ctx.shutdown();
}

#[test]
fn blobs_of_unregistered_owners_are_copied() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());

    let spilled_source = |id: i32| {
        let buffer = RowBuffer::open(&ctx, blob_schema(), 0, id, BufferOptions::default()).unwrap();
        for i in 0..3 {
            buffer.add_row(blob_row(i), false, false).unwrap();
        }
        buffer.close(blob_schema()).unwrap()
    };

    // id 30 is not in any repository
    let unregistered = spilled_source(30);
    // id 31 is registered, but to another buffer than the one minting the rows
    let registered = spilled_source(31);
    ctx.repository().register(registered.clone());
    let shadow = spilled_source(31);

    for (next_id, source) in [(40, &unregistered), (41, &shadow)] {
        let target =
            RowBuffer::open(&ctx, blob_schema(), 0, next_id, BufferOptions::default()).unwrap();
        for row in source.iter().unwrap() {
            target.add_row(row, false, false).unwrap();
        }
        let table = target.close(blob_schema()).unwrap();
        assert!(!target.references_foreign_blobs());
        assert!(target.blob_dir().is_some());

        for (i, row) in table.iter().unwrap().enumerate() {
            let blob = row.cells[1].as_blob().unwrap();
            assert_eq!(blob.address().unwrap().buffer_id, next_id);
            assert_eq!(payload(&row.cells[1]), format!("payload {}", i).into_bytes());
        }
        table.clear();
    }
    ctx.shutdown();
}

// ---------------------------------------------------------------------------
// Tests: Disposal and memory pressure
// ---------------------------------------------------------------------------

#[test]
fn clear_deletes_files_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    let buffer = RowBuffer::open(&ctx, blob_schema(), 0, -1, BufferOptions::default()).unwrap();
    buffer.add_row(blob_row(0), false, false).unwrap();
    let table = buffer.close(blob_schema()).unwrap();

    let data = buffer.data_file().unwrap();
    let blobs = buffer.blob_dir().unwrap();
    assert!(data.exists() && blobs.is_dir());
    assert_eq!(ctx.open_buffer_count(), 1);

    table.clear();
    table.clear();
    ctx.reclaimer().wait_until_finished();
    assert!(!data.exists());
    assert!(!blobs.exists());
    assert_eq!(ctx.open_buffer_count(), 0);
}

#[test]
fn low_memory_writes_cached_table_to_disk() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    let buffer = RowBuffer::open(&ctx, value_schema(), 100, -1, BufferOptions::default()).unwrap();
    let rows: Vec<Row> = (0..10).map(value_row).collect();
    for row in &rows {
        buffer.add_row(row.clone(), false, false).unwrap();
    }
    let table = buffer.close(value_schema()).unwrap();
    assert!(!buffer.uses_out_file());
    assert_eq!(ctx.cache().tier(buffer.identity()), Some(CacheTier::Hard));

    ctx.memory().signal_low_memory();
    let deadline = Instant::now() + Duration::from_secs(10);
    while ctx.cache().tier(buffer.identity()) == Some(CacheTier::Hard) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(buffer.is_flushed_to_disk());
    assert!(buffer.uses_out_file());
    assert_ne!(ctx.cache().tier(buffer.identity()), Some(CacheTier::Hard));

    let read: Vec<Row> = table.iter().unwrap().collect();
    assert_eq!(read, rows);
    table.clear();
}

#[test]
fn shutdown_clears_open_buffers() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    let buffer = RowBuffer::open(&ctx, value_schema(), 0, -1, BufferOptions::default()).unwrap();
    buffer.add_row(value_row(0), false, false).unwrap();
    let data = buffer.data_file().unwrap();

    ctx.shutdown();
    assert!(buffer.is_cleared());
    assert!(!data.exists());
}
