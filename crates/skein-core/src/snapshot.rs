//! Durable snapshot encode/decode for graph segment images
//!
//! File layout: 8-byte magic, u32 format version, u64 payload length, 32-byte
//! blake3 checksum of the payload, then the raw segment image. Written with
//! atomic tmp→rename so a crash mid-persist never leaves a half-written
//! snapshot under the final name.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use crate::error::SnapshotError;

const MAGIC: &[u8; 8] = b"SKEINSN1";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 8 + 32;

/// Write a segment image to `path`.
pub fn write_snapshot(image: &[u8], path: &Path) -> Result<(), SnapshotError> {
    let tmp = path.with_extension("snapshot.tmp");
    if tmp.exists() {
        fs::remove_file(&tmp)?;
    }

    let hash = blake3::hash(image);
    let mut writer = BufWriter::new(File::create(&tmp)?);
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&(image.len() as u64).to_le_bytes())?;
    writer.write_all(hash.as_bytes())?;
    writer.write_all(image)?;
    let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()?;

    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and verify a snapshot, returning the raw segment image.
pub fn read_snapshot(path: &Path) -> Result<Vec<u8>, SnapshotError> {
    let mut file = File::open(path)?;

    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).map_err(truncated)?;
    if &header[0..8] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = u32::from_le_bytes(header[8..12].try_into().expect("4-byte slice"));
    if version != VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let payload_len = u64::from_le_bytes(header[12..20].try_into().expect("8-byte slice"));

    // length check against the file before allocating the image buffer
    if file.metadata()?.len() != (HEADER_LEN as u64).saturating_add(payload_len) {
        return Err(SnapshotError::Truncated);
    }

    let mut image = vec![0u8; payload_len as usize];
    file.read_exact(&mut image).map_err(truncated)?;

    let expected: [u8; 32] = header[20..52].try_into().expect("32-byte slice");
    if blake3::hash(&image).as_bytes() != &expected {
        return Err(SnapshotError::ChecksumMismatch);
    }
    Ok(image)
}

fn truncated(e: io::Error) -> SnapshotError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        SnapshotError::Truncated
    } else {
        SnapshotError::Io(e)
    }
}
