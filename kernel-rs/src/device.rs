//! The block device seam. `spec.md` §6 describes it as "an ordered sequence
//! of fixed-size sectors exposing synchronous read and write of one
//! sector." In the teacher this is `virtio_disk.rs` behind the `hal()`
//! singleton (`kernel-rs/src/hal.rs`); here it's a plain trait with two
//! implementations so tests can swap in an in-memory disk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::param::SECTOR;

/// One on-disk sector's worth of bytes.
pub type Sector = [u8; SECTOR];

/// Synchronous, whole-sector block I/O. Any I/O failure is unrecoverable at
/// this layer — `spec.md` §4.1/§7 treat it as a panic, with no retry.
pub trait BlockDevice: Send + Sync {
    /// Total number of addressable sectors on this device.
    fn num_sectors(&self) -> u32;

    /// Reads sector `sector` into `buf`. Panics on I/O failure or an
    /// out-of-range sector.
    fn read(&self, sector: u32, buf: &mut Sector);

    /// Writes `buf` to sector `sector`. Panics on I/O failure or an
    /// out-of-range sector.
    fn write(&self, sector: u32, buf: &Sector);
}

/// An in-memory block device, used by tests and by anything that does not
/// need the cache's contents to outlive the process.
pub struct MemBlockDevice {
    sectors: Mutex<Vec<Sector>>,
}

impl MemBlockDevice {
    pub fn new(num_sectors: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR]; num_sectors as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn num_sectors(&self) -> u32 {
        self.sectors.lock().expect("disk lock poisoned").len() as u32
    }

    fn read(&self, sector: u32, buf: &mut Sector) {
        let sectors = self.sectors.lock().expect("disk lock poisoned");
        let src = sectors
            .get(sector as usize)
            .unwrap_or_else(|| panic!("read of out-of-range sector {sector}"));
        buf.copy_from_slice(src);
    }

    fn write(&self, sector: u32, buf: &Sector) {
        let mut sectors = self.sectors.lock().expect("disk lock poisoned");
        let dst = sectors
            .get_mut(sector as usize)
            .unwrap_or_else(|| panic!("write of out-of-range sector {sector}"));
        dst.copy_from_slice(buf);
    }
}

/// A host-file-backed block device — the nearest a hosted build has to the
/// teacher's virtio disk: the bytes genuinely persist across runs.
pub struct FileBlockDevice {
    file: Mutex<File>,
    num_sectors: u32,
}

impl FileBlockDevice {
    /// Opens (creating if needed) `path` as a block device of `num_sectors`
    /// sectors, zero-filling any newly extended tail.
    pub fn open(path: impl AsRef<Path>, num_sectors: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len((num_sectors as u64) * (SECTOR as u64))?;
        Ok(Self {
            file: Mutex::new(file),
            num_sectors,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    fn read(&self, sector: u32, buf: &mut Sector) {
        assert!(sector < self.num_sectors, "read of out-of-range sector {sector}");
        let mut file = self.file.lock().expect("disk lock poisoned");
        file.seek(SeekFrom::Start((sector as u64) * (SECTOR as u64)))
            .expect("seek failed");
        file.read_exact(buf).expect("disk read failed");
    }

    fn write(&self, sector: u32, buf: &Sector) {
        assert!(sector < self.num_sectors, "write of out-of-range sector {sector}");
        let mut file = self.file.lock().expect("disk lock poisoned");
        file.seek(SeekFrom::Start((sector as u64) * (SECTOR as u64)))
            .expect("seek failed");
        file.write_all(buf).expect("disk write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemBlockDevice::new(4);
        let mut buf = [0u8; SECTOR];
        buf[0] = 0xab;
        dev.write(2, &buf);
        let mut out = [0u8; SECTOR];
        dev.read(2, &mut out);
        assert_eq!(buf, out);
        // untouched sectors stay zeroed
        dev.read(1, &mut out);
        assert_eq!(out, [0u8; SECTOR]);
    }

    #[test]
    #[should_panic(expected = "out-of-range")]
    fn mem_device_panics_out_of_range() {
        let dev = MemBlockDevice::new(1);
        let buf = [0u8; SECTOR];
        dev.write(5, &buf);
    }

    #[test]
    fn file_device_persists() {
        let dir = std::env::temp_dir().join(format!("rv6-core-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("disk.img");
        {
            let dev = FileBlockDevice::open(&path, 4).unwrap();
            let mut buf = [0u8; SECTOR];
            buf[10] = 7;
            dev.write(3, &buf);
        }
        let dev = FileBlockDevice::open(&path, 4).unwrap();
        let mut out = [0u8; SECTOR];
        dev.read(3, &mut out);
        assert_eq!(out[10], 7);
        std::fs::remove_dir_all(&dir).ok();
    }
}
