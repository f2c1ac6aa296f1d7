//! Versioned binary row stream.
//!
//! Layout of a data file (optionally gzip-compressed as a whole):
//!
//! ```text
//! [MAGIC: 8 bytes]
//! row*:
//!   [key block]                 (only if row keys are enabled)
//!   cell* (one per column):
//!     [tag: u8][payload block]
//!   [ROW_END]
//!
//! block = escaped payload bytes followed by BLOCK_END
//!         (ESC, BLOCK_END and ROW_END inside the payload are prefixed by ESC)
//! ```
//!
//! Cell tags: `TAG_MISSING`, `TAG_BLOB`, one tag per inline value type,
//! with `GENERIC_FLAG` set for values written through `bincode`.
//! All integers are little-endian.
//!
//! The reader never fails on a damaged row: a bad block or row marker
//! yields a missing cell (or a synthetic key) and reading resumes at the
//! next row marker. The first such event per buffer is logged as a warning.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::data::{BlobAddress, Cell, Row, RowKey, Value};
use crate::error::{Result, TableError};
use crate::settings::{BufferSettings, DataCompression};

// ── Constants ───────────────────────────────────────────────────────

pub const MAGIC: &[u8; 8] = b"RSTORE\x00\x01";

/// Version string written by this build.
pub const CURRENT_VERSION: &str = "rowstore_4";

/// Internal version number of `CURRENT_VERSION`.
pub const CURRENT_VERSION_NUMBER: u32 = 4;

/// Identifier of the only output format.
pub const OUTPUT_FORMAT: &str = "rowstore.binary";

/// Every version string ever written, with its internal number.
const COMPATIBILITY: &[(&str, u32)] = &[
    ("rowstore_1.0.0", 1), // initial format
    ("rowstore_2", 2),     // blob directories sharded by column
    ("rowstore_3", 3),     // optional row keys
    (CURRENT_VERSION, CURRENT_VERSION_NUMBER), // gzip data stream
];

const ESC: u8 = 0x1B;
const BLOCK_END: u8 = 0x1C;
const ROW_END: u8 = 0x1D;

pub const TAG_MISSING: u8 = 0x00;
pub const TAG_BLOB: u8 = 0x01;
pub const TAG_INT: u8 = 0x02;
pub const TAG_LONG: u8 = 0x03;
pub const TAG_DOUBLE: u8 = 0x04;
pub const TAG_BOOLEAN: u8 = 0x05;
pub const TAG_STRING: u8 = 0x06;
pub const TAG_LIST: u8 = 0x07;
/// Set on tags whose payload is `bincode`-serialized.
pub const GENERIC_FLAG: u8 = 0x80;

/// Resolve a stored version string.
///
/// Unknown strings are assumed to be written by a newer build and read as
/// the current version.
pub fn version_number(version: &str) -> u32 {
    match COMPATIBILITY.iter().find(|(s, _)| *s == version) {
        Some((_, n)) => *n,
        None => {
            tracing::warn!(
                "unknown table version \"{}\", reading as \"{}\"",
                version,
                CURRENT_VERSION
            );
            CURRENT_VERSION_NUMBER
        }
    }
}

// ── BufferMeta ──────────────────────────────────────────────────────

/// Metadata stored next to a data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferMeta {
    pub row_count: u64,
    pub version: String,
    pub contains_blobs: bool,
    pub buffer_id: i32,
    pub output_format: String,
    pub format_settings: BufferSettings,
    /// Rows fit in memory when the table was written; readers restore
    /// them into the cache after a full read.
    #[serde(default)]
    pub in_memory: bool,
}

// ── Writer ──────────────────────────────────────────────────────────

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

/// Appends rows to a data file.
pub struct RowWriter {
    sink: Sink,
    row_keys: bool,
    scratch: Vec<u8>,
    rows: u64,
}

impl RowWriter {
    pub fn create(path: &Path, settings: &BufferSettings) -> Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        let mut sink = match settings.compression {
            DataCompression::None => Sink::Plain(file),
            DataCompression::Gzip => Sink::Gzip(GzEncoder::new(file, Compression::fast())),
        };
        sink.write_all(MAGIC)?;
        Ok(Self {
            sink,
            row_keys: settings.row_keys,
            scratch: Vec::with_capacity(256),
            rows: 0,
        })
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Append one row. Blob cells must already carry an address.
    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        if self.row_keys {
            let key = row.key.as_bytes().to_vec();
            self.write_block(&key)?;
        }
        for cell in &row.cells {
            let mut payload = std::mem::take(&mut self.scratch);
            payload.clear();
            let tag = encode_cell(cell, &mut payload)?;
            self.sink.write_all(&[tag])?;
            let res = self.write_block(&payload);
            self.scratch = payload;
            res?;
        }
        self.sink.write_all(&[ROW_END])?;
        self.rows += 1;
        Ok(())
    }

    fn write_block(&mut self, payload: &[u8]) -> Result<()> {
        let mut escaped = Vec::with_capacity(payload.len() + 1);
        for &b in payload {
            if b == ESC || b == BLOCK_END || b == ROW_END {
                escaped.push(ESC);
            }
            escaped.push(b);
        }
        escaped.push(BLOCK_END);
        self.sink.write_all(&escaped)?;
        Ok(())
    }

    /// Flush and close the file.
    pub fn finish(self) -> Result<()> {
        match self.sink {
            Sink::Plain(mut w) => w.flush()?,
            Sink::Gzip(enc) => enc.finish()?.flush()?,
        }
        Ok(())
    }
}

fn encode_cell(cell: &Cell, out: &mut Vec<u8>) -> Result<u8> {
    let tag = match cell {
        Cell::Missing => TAG_MISSING,
        Cell::Blob(blob) => {
            let address = blob.address().ok_or_else(|| {
                TableError::InvalidFormat("blob cell written before it was assigned an address".into())
            })?;
            put_str(out, blob.kind());
            out.extend_from_slice(&address.buffer_id.to_le_bytes());
            out.extend_from_slice(&address.column.to_le_bytes());
            out.extend_from_slice(&address.index.to_le_bytes());
            out.push(address.compressed as u8);
            match address.identity {
                Some(token) => {
                    out.push(1);
                    out.extend_from_slice(&token.to_le_bytes());
                }
                None => out.push(0),
            }
            TAG_BLOB
        }
        Cell::Value(value) => match value {
            Value::Int(v) => {
                out.extend_from_slice(&v.to_le_bytes());
                TAG_INT
            }
            Value::Long(v) => {
                out.extend_from_slice(&v.to_le_bytes());
                TAG_LONG
            }
            Value::Double(v) => {
                out.extend_from_slice(&v.to_bits().to_le_bytes());
                TAG_DOUBLE
            }
            Value::Boolean(v) => {
                out.push(*v as u8);
                TAG_BOOLEAN
            }
            Value::String(s) => {
                put_str(out, s);
                TAG_STRING
            }
            Value::List(_) => {
                out.extend_from_slice(&bincode::serialize(value)?);
                TAG_LIST | GENERIC_FLAG
            }
        },
    };
    Ok(tag)
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

// ── Reader ──────────────────────────────────────────────────────────

/// Cell as decoded from the stream, before blob owners are attached.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredCell {
    Missing,
    Value(Value),
    Blob { address: BlobAddress, kind: String },
}

enum BlockRead {
    Block(Vec<u8>),
    RowEnded,
    Eof,
}

/// Reads rows from a data file, recovering from damaged rows.
pub struct RowReader {
    input: BufReader<Box<dyn Read + Send>>,
    row_keys: bool,
    columns: usize,
    row_index: u64,
    eof: bool,
    corruption_logged: Arc<AtomicBool>,
    source: String,
}

impl RowReader {
    /// Open a data file and check its magic header.
    ///
    /// `corruption_logged` is shared by all readers of one buffer so that
    /// damaged rows are reported once per buffer.
    pub fn open(
        path: &Path,
        settings: &BufferSettings,
        columns: usize,
        corruption_logged: Arc<AtomicBool>,
    ) -> Result<Self> {
        let file = BufReader::new(File::open(path)?);
        let raw: Box<dyn Read + Send> = match settings.compression {
            DataCompression::None => Box::new(file),
            DataCompression::Gzip => Box::new(GzDecoder::new(file)),
        };
        let mut input = BufReader::new(raw);
        let mut magic = [0u8; 8];
        input.read_exact(&mut magic).map_err(|e| {
            TableError::InvalidFormat(format!("{}: missing header ({e})", path.display()))
        })?;
        if &magic != MAGIC {
            return Err(TableError::InvalidFormat(format!(
                "{}: not a row store data file",
                path.display()
            )));
        }
        Ok(Self {
            input,
            row_keys: settings.row_keys,
            columns,
            row_index: 0,
            eof: false,
            corruption_logged,
            source: path.display().to_string(),
        })
    }

    fn report(&self, what: &str) {
        if !self.corruption_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "corrupted row {} in {}: {} (further problems in this table are logged at debug level)",
                self.row_index,
                self.source,
                what
            );
        } else {
            tracing::debug!("corrupted row {} in {}: {}", self.row_index, self.source, what);
        }
    }

    fn next_byte(&mut self) -> Option<u8> {
        if self.eof {
            return None;
        }
        let mut b = [0u8; 1];
        match self.input.read(&mut b) {
            Ok(1) => Some(b[0]),
            Ok(_) => {
                self.eof = true;
                None
            }
            Err(e) => {
                self.report(&format!("read error: {e}"));
                self.eof = true;
                None
            }
        }
    }

    fn read_block(&mut self) -> BlockRead {
        let mut payload = Vec::new();
        loop {
            match self.next_byte() {
                None => return BlockRead::Eof,
                Some(ESC) => match self.next_byte() {
                    Some(b) => payload.push(b),
                    None => return BlockRead::Eof,
                },
                Some(BLOCK_END) => return BlockRead::Block(payload),
                Some(ROW_END) => return BlockRead::RowEnded,
                Some(b) => payload.push(b),
            }
        }
    }

    /// Skip to just past the next unescaped row marker.
    fn resync(&mut self) {
        loop {
            match self.next_byte() {
                None | Some(ROW_END) => return,
                Some(ESC) => {
                    self.next_byte();
                }
                Some(_) => {}
            }
        }
    }

    fn synthetic_key(&self) -> RowKey {
        format!("Row{}", self.row_index)
    }

    /// Read the next row. Always returns `columns` cells.
    pub fn read_row(&mut self) -> (RowKey, Vec<StoredCell>) {
        let mut cells = Vec::with_capacity(self.columns);
        let mut row_ended = false;

        let key = if self.row_keys {
            match self.read_block() {
                BlockRead::Block(bytes) => match String::from_utf8(bytes) {
                    Ok(k) => k,
                    Err(_) => {
                        self.report("row key is not valid UTF-8");
                        self.synthetic_key()
                    }
                },
                BlockRead::RowEnded => {
                    self.report("row ended inside row key");
                    row_ended = true;
                    self.synthetic_key()
                }
                BlockRead::Eof => {
                    self.report("unexpected end of file");
                    self.synthetic_key()
                }
            }
        } else {
            self.synthetic_key()
        };

        for col in 0..self.columns {
            if row_ended || self.eof {
                cells.push(StoredCell::Missing);
                continue;
            }
            let tag = match self.next_byte() {
                Some(ROW_END) => {
                    self.report(&format!("row ended before column {col}"));
                    row_ended = true;
                    cells.push(StoredCell::Missing);
                    continue;
                }
                Some(t) => t,
                None => {
                    self.report("unexpected end of file");
                    cells.push(StoredCell::Missing);
                    continue;
                }
            };
            match self.read_block() {
                BlockRead::Block(payload) => match decode_cell(tag, &payload) {
                    Ok(cell) => cells.push(cell),
                    Err(msg) => {
                        self.report(&format!("column {col}: {msg}"));
                        cells.push(StoredCell::Missing);
                    }
                },
                BlockRead::RowEnded => {
                    self.report(&format!("row ended inside column {col}"));
                    row_ended = true;
                    cells.push(StoredCell::Missing);
                }
                BlockRead::Eof => {
                    self.report("unexpected end of file");
                    cells.push(StoredCell::Missing);
                }
            }
        }

        if !row_ended && !self.eof {
            match self.next_byte() {
                Some(ROW_END) => {}
                Some(_) => {
                    self.report("bad end-of-row marker");
                    self.resync();
                }
                None => self.report("unexpected end of file"),
            }
        }

        self.row_index += 1;
        (key, cells)
    }
}

struct Payload<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        if self.pos + n > self.data.len() {
            return Err(format!(
                "codec under-read: need {} bytes at offset {}, block has {}",
                n,
                self.pos,
                self.data.len()
            ));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> std::result::Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> std::result::Result<u64, String> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    fn string(&mut self) -> std::result::Result<String, String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| "string is not valid UTF-8".to_string())
    }

    fn finish(&self) -> std::result::Result<(), String> {
        if self.pos != self.data.len() {
            return Err(format!(
                "codec over-read: {} of {} bytes consumed",
                self.pos,
                self.data.len()
            ));
        }
        Ok(())
    }
}

fn decode_cell(tag: u8, data: &[u8]) -> std::result::Result<StoredCell, String> {
    let mut p = Payload { data, pos: 0 };
    let cell = match tag {
        TAG_MISSING => StoredCell::Missing,
        TAG_BLOB => {
            let kind = p.string()?;
            let buffer_id = p.u32()? as i32;
            let column = p.u32()?;
            let index = p.u32()?;
            let compressed = p.u8()? != 0;
            let identity = match p.u8()? {
                0 => None,
                _ => Some(p.u64()?),
            };
            StoredCell::Blob {
                address: BlobAddress {
                    buffer_id,
                    column,
                    index,
                    compressed,
                    identity,
                },
                kind,
            }
        }
        TAG_INT => StoredCell::Value(Value::Int(p.u32()? as i32)),
        TAG_LONG => StoredCell::Value(Value::Long(p.u64()? as i64)),
        TAG_DOUBLE => StoredCell::Value(Value::Double(f64::from_bits(p.u64()?))),
        TAG_BOOLEAN => StoredCell::Value(Value::Boolean(p.u8()? != 0)),
        TAG_STRING => StoredCell::Value(Value::String(p.string()?)),
        t if t & GENERIC_FLAG != 0 => {
            let value: Value =
                bincode::deserialize(data).map_err(|e| format!("generic codec: {e}"))?;
            p.pos = data.len();
            StoredCell::Value(value)
        }
        t => return Err(format!("unknown cell tag 0x{t:02x}")),
    };
    p.finish()?;
    Ok(cell)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BlobCell, BlobValue};
    use tempfile::TempDir;

    fn settings(compression: DataCompression, row_keys: bool) -> BufferSettings {
        BufferSettings {
            compression,
            row_keys,
        }
    }

    fn sample_rows() -> Vec<Row> {
        let addr = BlobAddress {
            buffer_id: 3,
            column: 3,
            index: 0,
            compressed: true,
            identity: None,
        };
        vec![
            Row::new(
                "first",
                vec![
                    Cell::Value(Value::Int(-5)),
                    Cell::Value(Value::String("has \x1b\x1c\x1d markers".into())),
                    Cell::Value(Value::List(vec![Value::Double(1.5), Value::Boolean(true)])),
                    Cell::Blob(BlobCell::stored(addr, "doc", None, None)),
                ],
            ),
            Row::new(
                "second",
                vec![
                    Cell::Value(Value::Long(i64::MAX)),
                    Cell::Missing,
                    Cell::Value(Value::Double(f64::MIN_POSITIVE)),
                    Cell::Missing,
                ],
            ),
        ]
    }

    fn write(path: &Path, s: &BufferSettings, rows: &[Row]) {
        let mut w = RowWriter::create(path, s).unwrap();
        for r in rows {
            w.write_row(r).unwrap();
        }
        assert_eq!(w.rows_written(), rows.len() as u64);
        w.finish().unwrap();
    }

    #[test]
    fn test_version_table() {
        assert_eq!(version_number(CURRENT_VERSION), CURRENT_VERSION_NUMBER);
        assert_eq!(version_number("rowstore_2"), 2);
        assert_eq!(version_number("rowstore_99"), CURRENT_VERSION_NUMBER);
    }

    #[test]
    fn test_write_then_read_both_compressions() {
        let dir = TempDir::new().unwrap();
        for compression in [DataCompression::None, DataCompression::Gzip] {
            let s = settings(compression, true);
            let path = dir.path().join(format!("{compression:?}.bin"));
            write(&path, &s, &sample_rows());

            let mut r = RowReader::open(&path, &s, 4, Arc::new(AtomicBool::new(false))).unwrap();
            let (k0, c0) = r.read_row();
            assert_eq!(k0, "first");
            assert_eq!(c0[0], StoredCell::Value(Value::Int(-5)));
            assert_eq!(
                c0[1],
                StoredCell::Value(Value::String("has \x1b\x1c\x1d markers".into()))
            );
            assert!(matches!(&c0[3], StoredCell::Blob { address, kind } if address.index == 0 && kind == "doc"));
            let (k1, c1) = r.read_row();
            assert_eq!(k1, "second");
            assert_eq!(c1[0], StoredCell::Value(Value::Long(i64::MAX)));
            assert_eq!(c1[1], StoredCell::Missing);
        }
    }

    #[test]
    fn test_row_keys_disabled_synthesizes_keys() {
        let dir = TempDir::new().unwrap();
        let s = settings(DataCompression::None, false);
        let path = dir.path().join("nokeys.bin");
        write(&path, &s, &sample_rows());

        let mut r = RowReader::open(&path, &s, 4, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(r.read_row().0, "Row0");
        assert_eq!(r.read_row().0, "Row1");
    }

    #[test]
    fn test_damaged_payload_becomes_missing() {
        let dir = TempDir::new().unwrap();
        let s = settings(DataCompression::None, true);
        let path = dir.path().join("damaged.bin");
        let rows = vec![
            Row::new("a", vec![Cell::Value(Value::String("keep-me".into())), Cell::Value(Value::Int(1))]),
            Row::new("b", vec![Cell::Value(Value::String("damage-me".into())), Cell::Value(Value::Int(2))]),
            Row::new("c", vec![Cell::Value(Value::String("fine".into())), Cell::Value(Value::Int(3))]),
        ];
        write(&path, &s, &rows);

        let mut bytes = std::fs::read(&path).unwrap();
        let pos = bytes
            .windows(9)
            .position(|w| w == b"damage-me")
            .unwrap();
        bytes.drain(pos..pos + 3);
        std::fs::write(&path, &bytes).unwrap();

        let logged = Arc::new(AtomicBool::new(false));
        let mut r = RowReader::open(&path, &s, 2, logged.clone()).unwrap();
        let (_, a) = r.read_row();
        let (kb, b) = r.read_row();
        let (kc, c) = r.read_row();
        assert_eq!(a[0], StoredCell::Value(Value::String("keep-me".into())));
        assert_eq!(kb, "b");
        assert_eq!(b[0], StoredCell::Missing);
        assert_eq!(b[1], StoredCell::Value(Value::Int(2)));
        assert_eq!(kc, "c");
        assert_eq!(c[1], StoredCell::Value(Value::Int(3)));
        assert!(logged.load(Ordering::Relaxed));
    }

    #[test]
    fn test_truncated_file_yields_missing_rows() {
        let dir = TempDir::new().unwrap();
        let s = settings(DataCompression::None, true);
        let path = dir.path().join("short.bin");
        let rows = vec![Row::new("only", vec![Cell::Value(Value::Int(9))])];
        write(&path, &s, &rows);

        let mut r = RowReader::open(&path, &s, 1, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(r.read_row().0, "only");
        let (k, cells) = r.read_row();
        assert_eq!(k, "Row1");
        assert_eq!(cells, vec![StoredCell::Missing]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"not a table at all").unwrap();
        let s = settings(DataCompression::None, true);
        assert!(matches!(
            RowReader::open(&path, &s, 1, Arc::new(AtomicBool::new(false))),
            Err(TableError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_meta_json() {
        let meta = BufferMeta {
            row_count: 10,
            version: CURRENT_VERSION.into(),
            contains_blobs: true,
            buffer_id: 4,
            output_format: OUTPUT_FORMAT.into(),
            format_settings: BufferSettings::default(),
            in_memory: true,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(serde_json::from_str::<BufferMeta>(&json).unwrap(), meta);

        // written before the flag existed
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value.as_object_mut().unwrap().remove("in_memory");
        let old: BufferMeta = serde_json::from_value(value).unwrap();
        assert!(!old.in_memory);
    }

    #[test]
    fn test_unaddressed_blob_rejected() {
        let dir = TempDir::new().unwrap();
        let s = settings(DataCompression::None, true);
        let mut w = RowWriter::create(&dir.path().join("x.bin"), &s).unwrap();
        let row = Row::new("r", vec![Cell::from(BlobValue::new("doc", vec![1]))]);
        assert!(matches!(w.write_row(&row), Err(TableError::InvalidFormat(_))));
    }
}
