//! WAL record wire format.
//!
//! One record is laid out as
//!
//! ```text
//! [tranc_id u64 LE][op u8][key_len u16 LE][key][value_len u32 LE][value][record_len u16 LE]
//! ```
//!
//! `record_len` covers the whole record **including itself**, which
//! makes the stream self-delimiting in both directions: a forward
//! parser verifies each record's length field against the bytes it
//! consumed, and a trailing length permits backward scans. A length
//! mismatch or a truncated tail terminates parsing of the segment;
//! everything fully parsed before it is kept.

use bytes::{BufMut, Bytes};

use crate::encoding::{ByteReader, EncodingError};

/// Fixed bytes per record around the key and value payloads.
pub const RECORD_OVERHEAD: usize = 8 + 1 + 2 + 4 + 2;

/// Upper bound on `key.len() + value.len()` imposed by the `u16`
/// trailing length field.
pub const MAX_RECORD_PAYLOAD: usize = u16::MAX as usize - RECORD_OVERHEAD;

/// Operation carried by a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    /// Transaction opened.
    Create = 0,
    /// Transaction committed; terminates a replayable group.
    Commit = 1,
    /// Transaction rolled back; the group is discarded on recovery.
    Rollback = 2,
    /// Key write.
    Put = 3,
    /// Key deletion (tombstone).
    Delete = 4,
}

impl OpType {
    fn from_u8(raw: u8) -> Result<Self, EncodingError> {
        match raw {
            0 => Ok(Self::Create),
            1 => Ok(Self::Commit),
            2 => Ok(Self::Rollback),
            3 => Ok(Self::Put),
            4 => Ok(Self::Delete),
            other => Err(EncodingError::InvalidTag {
                tag: other as u32,
                type_name: "OpType",
            }),
        }
    }
}

/// One write-ahead-log record.
///
/// `Create`, `Commit` and `Rollback` markers carry empty key and
/// value; `Put` carries both; `Delete` carries only a key (an empty
/// value is the tombstone convention everywhere in the engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Owning transaction.
    pub tranc_id: u64,

    /// Operation kind.
    pub op: OpType,

    /// Key bytes (empty for markers).
    pub key: Bytes,

    /// Value bytes (empty for markers, deletes and tombstones).
    pub value: Bytes,
}

impl Record {
    /// Transaction-open marker.
    pub fn create(tranc_id: u64) -> Self {
        Self {
            tranc_id,
            op: OpType::Create,
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Commit marker.
    pub fn commit(tranc_id: u64) -> Self {
        Self {
            tranc_id,
            op: OpType::Commit,
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Rollback marker.
    pub fn rollback(tranc_id: u64) -> Self {
        Self {
            tranc_id,
            op: OpType::Rollback,
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Key write.
    pub fn put(tranc_id: u64, key: Bytes, value: Bytes) -> Self {
        Self {
            tranc_id,
            op: OpType::Put,
            key,
            value,
        }
    }

    /// Key deletion.
    pub fn delete(tranc_id: u64, key: Bytes) -> Self {
        Self {
            tranc_id,
            op: OpType::Delete,
            key,
            value: Bytes::new(),
        }
    }

    /// Encoded size of this record in bytes.
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.key.len() + self.value.len()
    }

    /// Appends the wire encoding of this record to `buf`.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.tranc_id);
        buf.put_u8(self.op as u8);
        buf.put_u16_le(self.key.len() as u16);
        buf.put_slice(&self.key);
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.value);
        buf.put_u16_le(self.encoded_len() as u16);
    }

    /// Decodes a sequence of records from `buf`.
    ///
    /// Parsing stops at the first truncated or inconsistent record;
    /// every record fully parsed before it is returned together with
    /// the error that stopped the scan (`None` when the buffer was
    /// consumed cleanly).
    pub fn decode_stream(buf: &[u8]) -> (Vec<Record>, Option<EncodingError>) {
        let mut records = Vec::new();
        let mut reader = ByteReader::new(buf);

        while !reader.is_empty() {
            let start = reader.pos();
            match Self::decode_one(&mut reader, start) {
                Ok(record) => records.push(record),
                Err(err) => return (records, Some(err)),
            }
        }
        (records, None)
    }

    fn decode_one(reader: &mut ByteReader<'_>, start: usize) -> Result<Record, EncodingError> {
        let tranc_id = reader.read_u64()?;
        let op = OpType::from_u8(reader.read_u8()?)?;
        let key = Bytes::copy_from_slice(reader.read_len_u16()?);
        let value = Bytes::copy_from_slice(reader.read_len_u32()?);
        let record_len = reader.read_u16()? as usize;

        let consumed = reader.pos() - start;
        if record_len != consumed {
            return Err(EncodingError::LengthMismatch(format!(
                "record_len {record_len} does not match {consumed} consumed bytes"
            )));
        }

        Ok(Record {
            tranc_id,
            op,
            key,
            value,
        })
    }
}
