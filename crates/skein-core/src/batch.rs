//! Update-batch codec for the ingestion wire protocol
//!
//! Frame payload layout (little-endian): u32 update count, then per update a
//! u8 opcode, two vertex keys, and for inserts an i64 weight. A key is a u8
//! tag — either a u64 id or a u16-length-prefixed UTF-8 name. Named keys are
//! only accepted when the server runs in named-identifier mode.

/// Vertex identifier mode configured at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMode {
    Numeric,
    Named,
}

/// A vertex endpoint as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VertexKey {
    Id(u64),
    Name(String),
}

/// One edge update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Insert {
        src: VertexKey,
        dst: VertexKey,
        weight: i64,
    },
    Delete {
        src: VertexKey,
        dst: VertexKey,
    },
}

/// An ordered group of edge updates, applied in receipt order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub updates: Vec<Update>,
}

/// Upper bound on updates per batch; keeps a hostile frame from ballooning.
pub const MAX_BATCH_UPDATES: u32 = 1 << 20;

const OP_INSERT: u8 = 0;
const OP_DELETE: u8 = 1;
const KEY_ID: u8 = 0;
const KEY_NAME: u8 = 1;

/// Decode failure for a single batch frame.
#[derive(Debug, PartialEq, Eq)]
pub enum BatchError {
    Truncated,
    TrailingBytes(usize),
    UnknownOp(u8),
    UnknownKeyTag(u8),
    BadName,
    NamedIdsDisabled,
    TooManyUpdates(u32),
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "batch payload is truncated"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after last update"),
            Self::UnknownOp(op) => write!(f, "unknown update opcode {op}"),
            Self::UnknownKeyTag(tag) => write!(f, "unknown vertex key tag {tag}"),
            Self::BadName => write!(f, "vertex name is not valid UTF-8"),
            Self::NamedIdsDisabled => {
                write!(f, "named vertex key received in numeric-identifier mode")
            }
            Self::TooManyUpdates(n) => write!(f, "batch of {n} updates exceeds limit"),
        }
    }
}

impl std::error::Error for BatchError {}

impl Batch {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.updates.len() * 20);
        out.extend_from_slice(&(self.updates.len() as u32).to_le_bytes());
        for update in &self.updates {
            match update {
                Update::Insert { src, dst, weight } => {
                    out.push(OP_INSERT);
                    encode_key(&mut out, src);
                    encode_key(&mut out, dst);
                    out.extend_from_slice(&weight.to_le_bytes());
                }
                Update::Delete { src, dst } => {
                    out.push(OP_DELETE);
                    encode_key(&mut out, src);
                    encode_key(&mut out, dst);
                }
            }
        }
        out
    }

    pub fn decode(payload: &[u8], mode: IdMode) -> Result<Batch, BatchError> {
        let mut reader = Reader {
            buf: payload,
            pos: 0,
        };
        let count = reader.u32()?;
        if count > MAX_BATCH_UPDATES {
            return Err(BatchError::TooManyUpdates(count));
        }
        let mut updates = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let op = reader.u8()?;
            let src = reader.key(mode)?;
            let dst = reader.key(mode)?;
            updates.push(match op {
                OP_INSERT => Update::Insert {
                    src,
                    dst,
                    weight: reader.i64()?,
                },
                OP_DELETE => Update::Delete { src, dst },
                other => return Err(BatchError::UnknownOp(other)),
            });
        }
        let trailing = payload.len() - reader.pos;
        if trailing > 0 {
            return Err(BatchError::TrailingBytes(trailing));
        }
        Ok(Batch { updates })
    }
}

fn encode_key(out: &mut Vec<u8>, key: &VertexKey) {
    match key {
        VertexKey::Id(id) => {
            out.push(KEY_ID);
            out.extend_from_slice(&id.to_le_bytes());
        }
        VertexKey::Name(name) => {
            out.push(KEY_NAME);
            let bytes = name.as_bytes();
            out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            out.extend_from_slice(bytes);
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], BatchError> {
        let end = self.pos.checked_add(n).ok_or(BatchError::Truncated)?;
        if end > self.buf.len() {
            return Err(BatchError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, BatchError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BatchError> {
        Ok(u16::from_le_bytes(
            self.bytes(2)?.try_into().expect("2-byte slice"),
        ))
    }

    fn u32(&mut self) -> Result<u32, BatchError> {
        Ok(u32::from_le_bytes(
            self.bytes(4)?.try_into().expect("4-byte slice"),
        ))
    }

    fn u64(&mut self) -> Result<u64, BatchError> {
        Ok(u64::from_le_bytes(
            self.bytes(8)?.try_into().expect("8-byte slice"),
        ))
    }

    fn i64(&mut self) -> Result<i64, BatchError> {
        Ok(i64::from_le_bytes(
            self.bytes(8)?.try_into().expect("8-byte slice"),
        ))
    }

    fn key(&mut self, mode: IdMode) -> Result<VertexKey, BatchError> {
        match self.u8()? {
            KEY_ID => Ok(VertexKey::Id(self.u64()?)),
            KEY_NAME => {
                if mode == IdMode::Numeric {
                    return Err(BatchError::NamedIdsDisabled);
                }
                let len = self.u16()? as usize;
                let bytes = self.bytes(len)?;
                let name = std::str::from_utf8(bytes).map_err(|_| BatchError::BadName)?;
                Ok(VertexKey::Name(name.to_string()))
            }
            other => Err(BatchError::UnknownKeyTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_batch() -> Batch {
        Batch {
            updates: vec![
                Update::Insert {
                    src: VertexKey::Id(1),
                    dst: VertexKey::Id(2),
                    weight: 7,
                },
                Update::Delete {
                    src: VertexKey::Id(1),
                    dst: VertexKey::Id(2),
                },
            ],
        }
    }

    #[test]
    fn decode_numeric() {
        let batch = numeric_batch();
        let decoded = Batch::decode(&batch.encode(), IdMode::Numeric).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn decode_named() {
        let batch = Batch {
            updates: vec![Update::Insert {
                src: VertexKey::Name("alice".to_string()),
                dst: VertexKey::Name("bob".to_string()),
                weight: -3,
            }],
        };
        let decoded = Batch::decode(&batch.encode(), IdMode::Named).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn named_keys_rejected_in_numeric_mode() {
        let batch = Batch {
            updates: vec![Update::Delete {
                src: VertexKey::Name("alice".to_string()),
                dst: VertexKey::Id(2),
            }],
        };
        assert_eq!(
            Batch::decode(&batch.encode(), IdMode::Numeric),
            Err(BatchError::NamedIdsDisabled)
        );
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let encoded = numeric_batch().encode();
        assert_eq!(
            Batch::decode(&encoded[..encoded.len() - 3], IdMode::Numeric),
            Err(BatchError::Truncated)
        );
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        let mut encoded = numeric_batch().encode();
        encoded.push(0);
        assert_eq!(
            Batch::decode(&encoded, IdMode::Numeric),
            Err(BatchError::TrailingBytes(1))
        );
    }

    #[test]
    fn hostile_count_is_capped() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(
            Batch::decode(&payload, IdMode::Numeric),
            Err(BatchError::TooManyUpdates(u32::MAX))
        );
    }
}
