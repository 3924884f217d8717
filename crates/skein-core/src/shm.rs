//! Shared-memory namespace helpers
//!
//! Named regions are plain files under the OS shared-memory directory
//! (`/dev/shm` on Linux), mapped with memmap2. `SKEIN_SHM_DIR` overrides the
//! location for tests and for hosts without a tmpfs mount. Every region
//! created here must be unlinked before process exit; a leaked name persists
//! until manual cleanup or reboot.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;

use memmap2::{Mmap, MmapMut};

/// Directory holding named shared-memory regions.
pub fn shm_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SKEIN_SHM_DIR") {
        return PathBuf::from(dir);
    }
    let dev_shm = PathBuf::from("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm
    } else {
        std::env::temp_dir()
    }
}

/// Filesystem path backing a named region.
pub fn region_path(name: &str) -> PathBuf {
    shm_dir().join(sanitize_name(name))
}

/// Restrict a region or worker name to a single safe path component.
pub fn sanitize_name(name: &str) -> String {
    name.trim_start_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Create (or overwrite) a named region of `len` zeroed bytes, mapped writable.
pub fn create_region(name: &str, len: u64) -> io::Result<MmapMut> {
    let path = region_path(name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.set_len(len)?;
    // SAFETY: freshly created and sized above; this process holds the only
    // writable mapping until the name is published
    unsafe { MmapMut::map_mut(&file) }
}

/// Map an existing region read-only.
pub fn open_region(name: &str) -> io::Result<Mmap> {
    let file = File::open(region_path(name))?;
    // SAFETY: read-only view; concurrent writers only touch single-word
    // little-endian fields
    unsafe { Mmap::map(&file) }
}

/// Read a full region into memory (used for worker history capture).
pub fn read_region(name: &str) -> io::Result<Vec<u8>> {
    fs::read(region_path(name))
}

/// Remove a region from the namespace. Returns false if it was already gone.
pub fn unlink_region(name: &str) -> io::Result<bool> {
    match fs::remove_file(region_path(name)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether a region of this name currently exists.
pub fn region_exists(name: &str) -> bool {
    region_path(name).exists()
}
