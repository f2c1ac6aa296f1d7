//! Read-only view of a closed buffer.

use std::fmt;
use std::sync::Arc;

use crate::buffer::RowBuffer;
use crate::error::Result;
use crate::iter::RowIterator;
use crate::repository::TableRepository;
use crate::schema::Schema;

#[derive(Clone)]
pub struct ReadableTable {
    buffer: Arc<RowBuffer>,
}

impl ReadableTable {
    pub(crate) fn new(buffer: Arc<RowBuffer>) -> Self {
        Self { buffer }
    }

    /// Fresh iterator over all rows in commit order.
    pub fn iter(&self) -> Result<RowIterator> {
        self.buffer.iter()
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub fn schema(&self) -> Schema {
        self.buffer.schema()
    }

    pub fn buffer_id(&self) -> i32 {
        self.buffer.buffer_id()
    }

    pub(crate) fn identity(&self) -> u64 {
        self.buffer.identity()
    }

    pub fn buffer(&self) -> &Arc<RowBuffer> {
        &self.buffer
    }

    /// Dispose the table: unregister it and delete its files.
    pub fn clear(&self) {
        self.clear_in(None);
    }

    /// Like `clear`, also removing the table from a local repository.
    pub fn clear_in(&self, local: Option<&TableRepository>) {
        let id = self.buffer_id();
        if id >= 0 {
            if let Some(local) = local {
                local.remove_if(id, self.identity());
            }
            self.buffer
                .context()
                .repository()
                .remove_if(id, self.identity());
        }
        self.buffer.clear();
    }
}

impl fmt::Debug for ReadableTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableTable")
            .field("buffer_id", &self.buffer_id())
            .field("size", &self.size())
            .finish()
    }
}
