//! rowstore - row-table storage engine.
//!
//! Buffers tables produced row by row, keeps them in memory or spills
//! them to a versioned binary format, stores large cells out-of-line,
//! caches closed tables for repeated reads and ingests rows through an
//! ordered parallel pipeline.
//!
//! Everything hangs off a [`StoreContext`], created once by the host:
//!
//! ```no_run
//! use rowstore::{ContainerSettings, IngestionPipeline, StoreContext};
//! use rowstore::{Cell, ColumnSpec, DataType, Row, Schema, Value};
//!
//! # fn main() -> rowstore::Result<()> {
//! let ctx = StoreContext::from_env()?;
//! let schema = Schema::new(vec![ColumnSpec::new("n", DataType::Long)]);
//! let mut pipeline = IngestionPipeline::new(&ctx, schema, ContainerSettings::default(), None)?;
//! pipeline.add_row(Row::new("Row0", vec![Cell::Value(Value::Long(1))]))?;
//! let table = pipeline.close()?;
//! for row in table.iter()? {
//!     println!("{}", row.key);
//! }
//! ctx.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod blob;
pub mod buffer;
pub mod cache;
pub mod cancel;
pub mod context;
pub mod data;
pub mod domain;
pub mod duplicate;
pub mod error;
pub mod filestore;
pub mod format;
pub mod iter;
pub mod lru;
pub mod memory;
pub mod pipeline;
pub mod reclaim;
pub mod repository;
pub mod resource;
pub mod schema;
pub mod settings;
pub mod table;

pub use blob::{BlobKind, CompressionPolicy};
pub use buffer::{BufferOptions, RowBuffer};
pub use cache::{CacheStats, CacheTier, Cacheable, ReferenceCache};
pub use cancel::CancelToken;
pub use context::StoreContext;
pub use data::{BlobAddress, BlobCell, BlobSource, BlobValue, Cell, DataType, Row, RowKey, Value};
pub use error::{Result, TableError};
pub use iter::RowIterator;
pub use pipeline::IngestionPipeline;
pub use reclaim::BackgroundReclaimer;
pub use repository::TableRepository;
pub use schema::{ColumnDomain, ColumnSpec, Schema};
pub use settings::{BufferSettings, ContainerSettings, DataCompression, StoreSettings};
pub use table::ReadableTable;
