//! Row iterators over a closed buffer.
//!
//! Memory iterators walk the cached row list. File iterators decode the
//! data file; one that reads every row hands the rows back to the buffer so
//! the next iterator can be served from the cache again.

use std::sync::Arc;

use crate::buffer::RowBuffer;
use crate::cache::CachedRows;
use crate::data::Row;
use crate::format::RowReader;

pub enum RowIterator {
    Memory {
        rows: CachedRows,
        pos: usize,
    },
    File {
        buffer: Arc<RowBuffer>,
        reader: Box<RowReader>,
        remaining: u64,
        restore: Option<Vec<Row>>,
    },
}

impl RowIterator {
    pub(crate) fn from_memory(rows: CachedRows) -> Self {
        RowIterator::Memory { rows, pos: 0 }
    }

    pub(crate) fn from_file(
        buffer: Arc<RowBuffer>,
        reader: RowReader,
        size: u64,
        restore: bool,
    ) -> Self {
        RowIterator::File {
            buffer,
            reader: Box::new(reader),
            remaining: size,
            restore: restore.then(|| Vec::with_capacity(size.min(1 << 16) as usize)),
        }
    }

    /// Whether rows come from memory rather than the data file.
    pub fn is_in_memory(&self) -> bool {
        matches!(self, RowIterator::Memory { .. })
    }

    fn remaining(&self) -> usize {
        match self {
            RowIterator::Memory { rows, pos } => rows.len() - pos,
            RowIterator::File { remaining, .. } => *remaining as usize,
        }
    }
}

impl Iterator for RowIterator {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        match self {
            RowIterator::Memory { rows, pos } => {
                let row = rows.get(*pos).cloned()?;
                *pos += 1;
                Some(row)
            }
            RowIterator::File {
                buffer,
                reader,
                remaining,
                restore,
            } => {
                if *remaining == 0 || buffer.is_cleared() {
                    return None;
                }
                let (key, cells) = reader.read_row();
                let row = buffer.materialize(key, cells);
                *remaining -= 1;
                if let Some(collected) = restore.as_mut() {
                    collected.push(row.clone());
                    if *remaining == 0 {
                        buffer.restore_into_cache(std::mem::take(collected));
                        *restore = None;
                    }
                }
                Some(row)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

impl ExactSizeIterator for RowIterator {}
