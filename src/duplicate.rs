//! Row-key uniqueness across a whole table.
//!
//! Keys are collected in memory. Past `chunk_size` keys, or when asked to
//! `flush` under memory pressure, the set is sorted and written to a chunk
//! file. `check` merges all chunks (k-way, binary heap) and reports the
//! first duplicate. Duplicates seen while still in memory are remembered
//! and reported by `check` as well, so the error always surfaces at close.
//!
//! Chunk file format: `[key_count: u64]` then for each key
//! `[byte_len: u32][utf8 bytes]`, keys in ascending order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::context::StoreContext;
use crate::error::{Result, TableError};

struct CheckerState {
    keys: HashSet<String>,
    first_duplicate: Option<String>,
    chunks: Vec<PathBuf>,
}

pub struct DuplicateChecker {
    ctx: Arc<StoreContext>,
    chunk_size: usize,
    state: Mutex<CheckerState>,
}

impl DuplicateChecker {
    pub fn new(ctx: Arc<StoreContext>, chunk_size: usize) -> Self {
        Self {
            ctx,
            chunk_size: chunk_size.max(1),
            state: Mutex::new(CheckerState {
                keys: HashSet::new(),
                first_duplicate: None,
                chunks: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CheckerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a key. Duplicates are reported by `check`.
    pub fn add_key(&self, key: &str) -> Result<()> {
        let mut st = self.lock();
        if !st.keys.insert(key.to_string()) && st.first_duplicate.is_none() {
            st.first_duplicate = Some(key.to_string());
        }
        if st.keys.len() >= self.chunk_size {
            self.write_chunk(&mut st)?;
        }
        Ok(())
    }

    /// Move the in-memory keys to a chunk file.
    pub fn flush(&self) -> Result<()> {
        let mut st = self.lock();
        self.write_chunk(&mut st)
    }

    pub fn chunk_count(&self) -> usize {
        self.lock().chunks.len()
    }

    /// `Err(DuplicateKey)` for the first duplicate found.
    pub fn check(&self) -> Result<()> {
        let mut st = self.lock();
        if let Some(key) = &st.first_duplicate {
            return Err(TableError::DuplicateKey { key: key.clone() });
        }
        if st.chunks.is_empty() {
            return Ok(());
        }
        self.write_chunk(&mut st)?;
        match merge_chunks(&st.chunks)? {
            Some(key) => {
                st.first_duplicate = Some(key.clone());
                Err(TableError::DuplicateKey { key })
            }
            None => Ok(()),
        }
    }

    /// Forget all keys and delete the chunk files.
    pub fn clear(&self) {
        let mut st = self.lock();
        st.keys.clear();
        st.first_duplicate = None;
        let chunks = std::mem::take(&mut st.chunks);
        self.ctx.reclaimer().delete(chunks);
    }

    fn write_chunk(&self, st: &mut CheckerState) -> Result<()> {
        if st.keys.is_empty() {
            return Ok(());
        }
        let mut keys: Vec<String> = st.keys.drain().collect();
        keys.sort_unstable();
        let path = self.ctx.create_temp_file("rowstore-keys-", ".bin")?;
        write_chunk_file(&path, &keys)?;
        tracing::debug!("wrote {} row keys to {}", keys.len(), path.display());
        st.chunks.push(path);
        Ok(())
    }
}

impl Drop for DuplicateChecker {
    fn drop(&mut self) {
        self.clear();
    }
}

// -- Chunk files --

fn write_chunk_file(path: &Path, keys: &[String]) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(&(keys.len() as u64).to_le_bytes())?;
    for key in keys {
        w.write_all(&(key.len() as u32).to_le_bytes())?;
        w.write_all(key.as_bytes())?;
    }
    w.flush()?;
    Ok(())
}

struct ChunkReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl ChunkReader {
    fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        Ok(Self {
            reader,
            remaining: u64::from_le_bytes(buf),
        })
    }

    fn next_key(&mut self) -> Result<Option<String>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
        self.reader.read_exact(&mut bytes)?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| TableError::InvalidFormat(format!("row key chunk: {e}")))
    }
}

struct HeapEntry {
    key: String,
    chunk: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap
        other.key.cmp(&self.key)
    }
}

/// Smallest key present in more than one chunk, if any.
fn merge_chunks(paths: &[PathBuf]) -> Result<Option<String>> {
    let mut readers: Vec<ChunkReader> = paths
        .iter()
        .map(|p| ChunkReader::open(p))
        .collect::<Result<_>>()?;

    let mut heap = BinaryHeap::new();
    for (chunk, reader) in readers.iter_mut().enumerate() {
        if let Some(key) = reader.next_key()? {
            heap.push(HeapEntry { key, chunk });
        }
    }

    let mut previous: Option<String> = None;
    while let Some(entry) = heap.pop() {
        if previous.as_deref() == Some(entry.key.as_str()) {
            return Ok(Some(entry.key));
        }
        if let Some(next) = readers[entry.chunk].next_key()? {
            heap.push(HeapEntry {
                key: next,
                chunk: entry.chunk,
            });
        }
        previous = Some(entry.key);
    }
    Ok(None)
}

// ── Tests ───────────────────────────────────────────────────────────
