//! Variable-length cells, the unit stored in a slotted page. A cell is
//! either key-only (carrying a child page id) or key-value. On the wire:
//! flags (1) · key-size (4 BE) · [value-size (4 BE) · value-type (1)] ·
//! key bytes · [value bytes | child id (8 BE)].

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::{Result, StorageError};

/// Flag bit: the cell has been deleted and awaits compaction.
pub const FLAG_DELETED: u8 = 1 << 0;
/// Flag bit: the cell's payload continues on an overflow page. Reserved;
/// this crate round-trips the bit but never sets it.
pub const FLAG_OVERFLOW: u8 = 1 << 1;

// The high nibble of the flag byte carries the cell kind.
const KIND_KEY: u8 = 0x10;
const KIND_KV: u8 = 0x20;
const KIND_MASK: u8 = 0xF0;

const INT_TYPE: u8 = 1;
const STRING_TYPE: u8 = 2;
const BOOL_TYPE: u8 = 3;
const TIMESTAMP_TYPE: u8 = 4;
const BYTES_TYPE: u8 = 5;

/// A typed value held by a key-value cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Int(i32),
    Str(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl CellValue {
    fn type_tag(&self) -> u8 {
        match self {
            CellValue::Int(_) => INT_TYPE,
            CellValue::Str(_) => STRING_TYPE,
            CellValue::Bool(_) => BOOL_TYPE,
            CellValue::Timestamp(_) => TIMESTAMP_TYPE,
            CellValue::Bytes(_) => BYTES_TYPE,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            CellValue::Int(v) => v.to_be_bytes().to_vec(),
            CellValue::Str(v) => v.as_bytes().to_vec(),
            CellValue::Bool(v) => vec![*v as u8],
            CellValue::Timestamp(v) => v.timestamp().to_be_bytes().to_vec(),
            CellValue::Bytes(v) => v.clone(),
        }
    }

    fn from_bytes(tag: u8, bytes: &[u8]) -> Result<Self> {
        match tag {
            INT_TYPE => {
                let arr: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| StorageError::MalformedCell("int value must be 4 bytes".into()))?;
                Ok(CellValue::Int(i32::from_be_bytes(arr)))
            }
            STRING_TYPE => Ok(CellValue::Str(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| StorageError::MalformedCell(format!("invalid utf-8: {e}")))?,
            )),
            BOOL_TYPE => match bytes {
                [b] => Ok(CellValue::Bool(*b == 1)),
                _ => Err(StorageError::MalformedCell(
                    "bool value must be 1 byte".into(),
                )),
            },
            TIMESTAMP_TYPE => {
                let arr: [u8; 8] = bytes.try_into().map_err(|_| {
                    StorageError::MalformedCell("timestamp value must be 8 bytes".into())
                })?;
                let secs = i64::from_be_bytes(arr);
                DateTime::<Utc>::from_timestamp(secs, 0)
                    .map(CellValue::Timestamp)
                    .ok_or_else(|| {
                        StorageError::MalformedCell(format!("timestamp {secs} out of range"))
                    })
            }
            BYTES_TYPE => Ok(CellValue::Bytes(bytes.to_vec())),
            other => Err(StorageError::MalformedCell(format!(
                "unknown value type tag {other}"
            ))),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            CellValue::Int(_) => 4,
            CellValue::Str(v) => v.len(),
            CellValue::Bool(_) => 1,
            CellValue::Timestamp(_) => 8,
            CellValue::Bytes(v) => v.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CellPayload {
    /// Internal-node cell: the key routes to a child page.
    Key { child: u64 },
    /// Leaf cell: the key maps to an optional typed value. A `None`
    /// value is a freshly inserted cell that has not been assigned yet.
    KeyValue { value: Option<CellValue> },
}

/// A tagged record stored in a slotted page.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    flags: u8,
    key: Vec<u8>,
    payload: CellPayload,
}

impl Cell {
    pub fn new_key_cell(key: impl Into<Vec<u8>>, child: u64) -> Self {
        Self {
            flags: 0,
            key: key.into(),
            payload: CellPayload::Key { child },
        }
    }

    pub fn new_kv_cell(key: impl Into<Vec<u8>>) -> Self {
        Self {
            flags: 0,
            key: key.into(),
            payload: CellPayload::KeyValue { value: None },
        }
    }

    pub fn with_value(key: impl Into<Vec<u8>>, value: CellValue) -> Self {
        Self {
            flags: 0,
            key: key.into(),
            payload: CellPayload::KeyValue { value: Some(value) },
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn child(&self) -> Option<u64> {
        match &self.payload {
            CellPayload::Key { child } => Some(*child),
            CellPayload::KeyValue { .. } => None,
        }
    }

    pub fn value(&self) -> Option<&CellValue> {
        match &self.payload {
            CellPayload::KeyValue { value } => value.as_ref(),
            CellPayload::Key { .. } => None,
        }
    }

    pub fn has_value(&self) -> bool {
        self.value().is_some()
    }

    pub fn set_value(&mut self, value: CellValue) -> Result<()> {
        match &mut self.payload {
            CellPayload::KeyValue { value: slot } => {
                *slot = Some(value);
                Ok(())
            }
            CellPayload::Key { .. } => Err(StorageError::InvalidArgument(
                "cannot set a value on a key-only cell".to_string(),
            )),
        }
    }

    pub fn mark_deleted(&mut self) {
        self.flags |= FLAG_DELETED;
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn is_overflow(&self) -> bool {
        self.flags & FLAG_OVERFLOW != 0
    }

    pub(crate) fn flag_byte(&self) -> u8 {
        let kind = match self.payload {
            CellPayload::Key { .. } => KIND_KEY,
            CellPayload::KeyValue { .. } => KIND_KV,
        };
        kind | self.flags
    }

    /// Size of the serialized cell in bytes.
    pub fn encoded_size(&self) -> usize {
        let base = 1 + 4 + self.key.len();
        match &self.payload {
            CellPayload::Key { .. } => base + 8,
            CellPayload::KeyValue { value } => {
                base + 4 + 1 + value.as_ref().map_or(0, CellValue::encoded_len)
            }
        }
    }

    pub fn fits_in(&self, remaining_space: usize) -> bool {
        self.encoded_size() <= remaining_space
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u8(self.flag_byte());
        buf.put_u32(self.key.len() as u32);
        match &self.payload {
            CellPayload::Key { child } => {
                buf.put_slice(&self.key);
                buf.put_u64(*child);
            }
            CellPayload::KeyValue { value } => {
                match value {
                    Some(v) => {
                        buf.put_u32(v.encoded_len() as u32);
                        buf.put_u8(v.type_tag());
                        buf.put_slice(&self.key);
                        buf.put_slice(&v.to_bytes());
                    }
                    None => {
                        buf.put_u32(0);
                        buf.put_u8(0);
                        buf.put_slice(&self.key);
                    }
                }
            }
        }
        buf.to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < 5 {
            return Err(StorageError::MalformedCell("truncated header".into()));
        }
        let flag_byte = buf.get_u8();
        let kind = flag_byte & KIND_MASK;
        let flags = flag_byte & !KIND_MASK;
        let key_size = buf.get_u32() as usize;

        match kind {
            KIND_KEY => {
                if buf.remaining() < key_size + 8 {
                    return Err(StorageError::MalformedCell("truncated key cell".into()));
                }
                let key = buf.copy_to_bytes(key_size).to_vec();
                let child = buf.get_u64();
                Ok(Cell {
                    flags,
                    key,
                    payload: CellPayload::Key { child },
                })
            }
            KIND_KV => {
                if buf.remaining() < 5 {
                    return Err(StorageError::MalformedCell("truncated value header".into()));
                }
                let value_size = buf.get_u32() as usize;
                let value_type = buf.get_u8();
                if buf.remaining() < key_size + value_size {
                    return Err(StorageError::MalformedCell("truncated kv cell".into()));
                }
                let key = buf.copy_to_bytes(key_size).to_vec();
                let value_bytes = buf.copy_to_bytes(value_size).to_vec();
                let value = if value_type == 0 && value_size == 0 {
                    None
                } else {
                    Some(CellValue::from_bytes(value_type, &value_bytes)?)
                };
                Ok(Cell {
                    flags,
                    key,
                    payload: CellPayload::KeyValue { value },
                })
            }
            other => Err(StorageError::MalformedCell(format!(
                "unknown cell kind {other:#x}"
            ))),
        }
    }
}
