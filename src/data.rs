//! Row and cell types.
//!
//! A `Row` is a key plus ordered cells. A cell is missing, an inline
//! `Value`, or a `BlobCell` whose payload lives out-of-line and is
//! resolved lazily through the `BlobSource` that owns it.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TableError};

// ── Value ───────────────────────────────────────────────────────────

/// Inline cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i32),
    Long(i64),
    Double(f64),
    Boolean(bool),
    String(String),
    List(Vec<Value>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int(_) => DataType::Int,
            Value::Long(_) => DataType::Long,
            Value::Double(_) => DataType::Double,
            Value::Boolean(_) => DataType::Boolean,
            Value::String(_) => DataType::String,
            Value::List(_) => DataType::List,
        }
    }

    /// Numeric view used for bounds tracking.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Long(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

// ── DataType ────────────────────────────────────────────────────────

/// Declared column type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int,
    Long,
    Double,
    Boolean,
    String,
    List,
    /// Out-of-line value of the named blob kind.
    Blob(String),
    /// Accepts every cell.
    Any,
}

impl DataType {
    /// Whether a value of type `other` may be stored in a column of this type.
    ///
    /// Numeric types widen: `Double` accepts `Long` and `Int`, `Long` accepts `Int`.
    pub fn is_super_type_of(&self, other: &DataType) -> bool {
        match (self, other) {
            (DataType::Any, _) => true,
            (DataType::Double, DataType::Long | DataType::Int) => true,
            (DataType::Long, DataType::Int) => true,
            (a, b) => a == b,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int | DataType::Long | DataType::Double)
    }

    pub fn is_nominal(&self) -> bool {
        matches!(self, DataType::String | DataType::Boolean)
    }
}

// ── Blobs ───────────────────────────────────────────────────────────

/// Payload of a blob cell: opaque bytes tagged with the blob kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobValue {
    pub kind: String,
    pub bytes: Vec<u8>,
}

impl BlobValue {
    pub fn new(kind: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            bytes,
        }
    }
}

/// Location of a blob inside the buffer that owns it.
///
/// Minted once by the owning buffer and never changed. `identity` is only
/// set for buffers with id -1, which cannot be told apart by id alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobAddress {
    pub buffer_id: i32,
    pub column: u32,
    pub index: u32,
    pub compressed: bool,
    pub identity: Option<u64>,
}

impl fmt::Display for BlobAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffer {}, col {}, idx {}{}",
            self.buffer_id,
            self.column,
            self.index,
            if self.compressed { ", gz" } else { "" }
        )
    }
}

/// Anything that can hand out blob payloads by address.
pub trait BlobSource: Send + Sync {
    fn read_blob(&self, address: &BlobAddress, kind: &str) -> Result<Arc<BlobValue>>;

    /// Backing file of a blob, if it is stored on disk.
    fn blob_file(&self, address: &BlobAddress) -> Option<PathBuf>;
}

/// Cell whose payload is stored out-of-line.
#[derive(Clone)]
pub struct BlobCell {
    address: Option<BlobAddress>,
    kind: String,
    value: OnceLock<Arc<BlobValue>>,
    owner: Option<Weak<dyn BlobSource>>,
}

impl BlobCell {
    /// A fresh blob not yet owned by any buffer.
    pub fn new(value: BlobValue) -> Self {
        let kind = value.kind.clone();
        let cell = OnceLock::new();
        let _ = cell.set(Arc::new(value));
        Self {
            address: None,
            kind,
            value: cell,
            owner: None,
        }
    }

    /// A reference to a blob stored by `owner` at `address`.
    pub fn stored(
        address: BlobAddress,
        kind: impl Into<String>,
        owner: Option<Weak<dyn BlobSource>>,
        value: Option<Arc<BlobValue>>,
    ) -> Self {
        let cell = OnceLock::new();
        if let Some(v) = value {
            let _ = cell.set(v);
        }
        Self {
            address: Some(address),
            kind: kind.into(),
            value: cell,
            owner,
        }
    }

    pub fn address(&self) -> Option<&BlobAddress> {
        self.address.as_ref()
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn owner(&self) -> Option<Arc<dyn BlobSource>> {
        self.owner.as_ref().and_then(|w| w.upgrade())
    }

    /// Payload if already materialized.
    pub fn cached_value(&self) -> Option<&Arc<BlobValue>> {
        self.value.get()
    }

    /// Materialize the payload, reading it from the owner on first use.
    pub fn resolve(&self) -> Result<Arc<BlobValue>> {
        if let Some(v) = self.value.get() {
            return Ok(Arc::clone(v));
        }
        let address = self.address.ok_or_else(|| {
            TableError::InvalidFormat("blob cell without address or payload".into())
        })?;
        let owner = self.owner().ok_or(TableError::BlobOwnerMissing {
            buffer_id: address.buffer_id,
        })?;
        let value = owner.read_blob(&address, &self.kind)?;
        Ok(Arc::clone(self.value.get_or_init(|| value)))
    }
}

impl fmt::Debug for BlobCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobCell")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("resolved", &self.value.get().is_some())
            .finish()
    }
}

impl PartialEq for BlobCell {
    /// Blob cells are equal when their payloads are.
    fn eq(&self, other: &Self) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match (self.resolve(), other.resolve()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

// ── Cell / Row ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Missing,
    Value(Value),
    Blob(BlobCell),
}

impl Cell {
    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Cell::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&BlobCell> {
        match self {
            Cell::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Runtime type, `None` for missing cells.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Cell::Missing => None,
            Cell::Value(v) => Some(v.data_type()),
            Cell::Blob(b) => Some(DataType::Blob(b.kind.clone())),
        }
    }
}

impl From<Value> for Cell {
    fn from(v: Value) -> Self {
        Cell::Value(v)
    }
}

impl From<BlobValue> for Cell {
    fn from(v: BlobValue) -> Self {
        Cell::Blob(BlobCell::new(v))
    }
}

/// Row key. Unique within a table.
pub type RowKey = String;

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: RowKey,
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn new(key: impl Into<RowKey>, cells: Vec<Cell>) -> Self {
        Self {
            key: key.into(),
            cells,
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn contains_blobs(&self) -> bool {
        self.cells.iter().any(|c| matches!(c, Cell::Blob(_)))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
