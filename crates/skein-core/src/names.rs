//! Vertex name interning for named-identifier mode
//!
//! Names map to dense u64 ids assigned on first use. Only the ingestion
//! thread assigns ids, so the table needs no internal synchronization beyond
//! the lock the server already holds around it.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use rustc_hash::FxHashMap;

#[derive(Debug, Default)]
pub struct VertexNames {
    map: FxHashMap<String, u64>,
    next: u64,
}

impl VertexNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `name`, assigning the next dense id on first use.
    pub fn resolve(&mut self, name: &str) -> u64 {
        if let Some(&id) = self.map.get(name) {
            return id;
        }
        let id = self.next;
        self.next += 1;
        self.map.insert(name.to_string(), id);
        id
    }

    /// Id for `name` if it was ever assigned.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.map.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Save the mapping as little-endian binary, sorted by id for a
    /// deterministic file.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut entries: Vec<(&str, u64)> =
            self.map.iter().map(|(n, &id)| (n.as_str(), id)).collect();
        entries.sort_by_key(|&(_, id)| id);

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&(entries.len() as u64).to_le_bytes())?;
        for (name, id) in entries {
            let bytes = name.as_bytes();
            if bytes.len() > u16::MAX as usize {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "vertex name longer than 65535 bytes",
                ));
            }
            writer.write_all(&(bytes.len() as u16).to_le_bytes())?;
            writer.write_all(bytes)?;
            writer.write_all(&id.to_le_bytes())?;
        }
        writer.flush()
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let count = read_u64(&mut reader)?;
        let mut map = FxHashMap::default();
        let mut next = 0u64;
        for _ in 0..count {
            let len = read_u16(&mut reader)? as usize;
            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes)?;
            let name = String::from_utf8(bytes).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "vertex name is not UTF-8")
            })?;
            let id = read_u64(&mut reader)?;
            next = next.max(id + 1);
            map.insert(name, id);
        }
        Ok(Self { map, next })
    }
}

fn read_u16(reader: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
