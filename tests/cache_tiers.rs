//! Integration test: ReferenceCache tiers driven by real buffers.
//!
//! Validates that:
//! - The hard tier cannot be cleared before the buffer is on disk
//! - After a confirmed flush only the soft and weak tiers answer
//! - Memory reclamation drops the soft tier, the weak tier remembers
//! - Disposal removes a table from every tier

use std::path::Path;
use std::sync::Arc;

use rowstore::{
    BufferOptions, CacheTier, Cell, ColumnSpec, DataType, ReadableTable, RowBuffer, Row, Schema,
    StoreContext, StoreSettings, TableError, Value,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn create_context(dir: &Path) -> Arc<StoreContext> {
    StoreContext::new(StoreSettings {
        temp_dir: dir.to_path_buf(),
        min_free_disk_mb: 0,
        worker_threads: 1,
        ..StoreSettings::default()
    })
    .unwrap()
}

fn schema() -> Schema {
    Schema::new(vec![ColumnSpec::new("n", DataType::Int)])
}

fn resident_table(ctx: &Arc<StoreContext>, rows: i32) -> (Arc<RowBuffer>, ReadableTable) {
    let buffer = RowBuffer::open(ctx, schema(), 1_000, -1, BufferOptions::default()).unwrap();
    for i in 0..rows {
        buffer
            .add_row(
                Row::new(format!("Row{}", i), vec![Cell::Value(Value::Int(i))]),
                false,
                false,
            )
            .unwrap();
    }
    let table = buffer.close(schema()).unwrap();
    (buffer, table)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn clear_for_reclaim_requires_flush() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    let (buffer, table) = resident_table(&ctx, 3);
    let id = buffer.identity();

    match ctx.cache().clear_for_reclaim(buffer.as_ref()) {
        Err(e @ TableError::CacheContract(_)) => assert_eq!(e.code(), "CACHE_CONTRACT"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(ctx.cache().tier(id), Some(CacheTier::Hard));

    buffer.flush_to_disk().unwrap();
    assert!(buffer.uses_out_file());
    assert_eq!(ctx.cache().tier(id), Some(CacheTier::Soft));

    let before = ctx.cache().stats();
    assert_eq!(table.iter().unwrap().count(), 3);
    let after = ctx.cache().stats();
    assert_eq!(after.hard_hits, before.hard_hits);
    assert_eq!(after.soft_hits, before.soft_hits + 1);
    table.clear();
}

#[test]
fn reclaim_keeps_weak_tier_and_reads_fall_back_to_disk() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    let (buffer, table) = resident_table(&ctx, 4);
    let id = buffer.identity();
    buffer.flush_to_disk().unwrap();

    assert_eq!(ctx.cache().reclaim(), 1);
    assert_eq!(ctx.cache().tier(id), Some(CacheTier::Weak));
    assert!(ctx.cache().was_cached(id));
    assert_eq!(ctx.cache().last_known_size(id), Some(4));

    let mut iter = table.iter().unwrap();
    assert!(!iter.is_in_memory());
    assert_eq!(iter.len(), 4);
    assert_eq!(iter.by_ref().count(), 4);
    assert!(ctx.cache().stats().weak_hits >= 1);

    // a complete file read re-publishes the rows, without a hard reference
    assert_eq!(ctx.cache().tier(id), Some(CacheTier::Soft));
    assert!(table.iter().unwrap().is_in_memory());
    table.clear();
}

#[test]
fn lru_capacity_bounds_soft_tier() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    ctx.cache().set_lru_capacity(2);
    assert_eq!(ctx.cache().lru_capacity(), 2);

    let tables: Vec<_> = (0..3).map(|_| resident_table(&ctx, 1)).collect();
    for (buffer, _) in &tables {
        assert_eq!(ctx.cache().tier(buffer.identity()), Some(CacheTier::Hard));
        buffer.flush_to_disk().unwrap();
    }
    assert_eq!(ctx.cache().tier(tables[0].0.identity()), Some(CacheTier::Weak));
    assert_eq!(ctx.cache().tier(tables[1].0.identity()), Some(CacheTier::Soft));
    assert_eq!(ctx.cache().tier(tables[2].0.identity()), Some(CacheTier::Soft));
    for (_, table) in &tables {
        table.clear();
    }
}

#[test]
fn clear_invalidates_every_tier() {
    let dir = TempDir::new().unwrap();
    let ctx = create_context(dir.path());
    let (buffer, table) = resident_table(&ctx, 2);
    let id = buffer.identity();
    let invalidated = ctx.cache().stats().invalidated;

    table.clear();
    assert_eq!(ctx.cache().tier(id), None);
    assert!(!ctx.cache().was_cached(id));
    assert_eq!(ctx.cache().stats().invalidated, invalidated + 1);
}
