//! On-disk inodes and the multilevel block index.
//!
//! The on-disk layout and address-resolution rule are grounded directly in
//! `examples/original_source/src/filesys/inode.c` (`byte_to_sector`,
//! `inode_create`, `inode_read_at`, `inode_write_at`, `inode_close`); the
//! `repr(C)` + `zerocopy::{AsBytes, FromBytes}` pattern for the on-disk
//! struct and the `const_assert!` layout check follow
//! `kernel-rs/src/fs/ufs/inode.rs`'s `Dinode`.
//!
//! spec.md §9 flags the double-indirect offset arithmetic as the one place
//! several historical copies got wrong (double-subtracting
//! `NUM_DIRECT_POINTERS`); the arithmetic below is re-derived from the
//! address-resolution rule in spec.md §4.3, not copied from any one
//! existing implementation.

use std::mem;
use std::sync::Mutex;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::bcache::AccessMode;
use crate::param::{
    DOUBLE_INDIRECT_INDEX, NAME_MAX, NO_BLOCK, NUM_BLOCK_POINTERS, NUM_DIRECT_POINTERS,
    POINTERS_PER_BLOCK, SECTOR, SINGLE_INDIRECT_INDEX,
};
use crate::sync::WaitChannel;

use super::FileSystem;

pub const INODE_MAGIC: u32 = 0x494E_4F44;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DiskInode {
    pub length: i32,
    pub blocks: [u32; NUM_BLOCK_POINTERS],
    _pad_a: [u8; 500 - 4 - NUM_BLOCK_POINTERS * 4],
    pub is_file: u8,
    _pad_b: [u8; 3],
    pub magic: u32,
    _pad_c: [u8; 4],
}

const_assert_eq!(mem::size_of::<DiskInode>(), SECTOR);

impl DiskInode {
    pub fn new(is_file: bool) -> Self {
        Self {
            length: 0,
            blocks: [NO_BLOCK; NUM_BLOCK_POINTERS],
            _pad_a: [0; 500 - 4 - NUM_BLOCK_POINTERS * 4],
            is_file: is_file as u8,
            _pad_b: [0; 3],
            magic: INODE_MAGIC,
            _pad_c: [0; 4],
        }
    }

    fn from_sector(raw: &[u8; SECTOR]) -> Self {
        *zerocopy::LayoutVerified::<_, DiskInode>::new(&raw[..])
            .expect("inode sector has wrong layout")
            .into_ref()
    }
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct IndirectBlock {
    pub pointers: [u32; POINTERS_PER_BLOCK],
}

const_assert_eq!(mem::size_of::<IndirectBlock>(), SECTOR);

impl IndirectBlock {
    fn empty() -> Self {
        Self {
            pointers: [NO_BLOCK; POINTERS_PER_BLOCK],
        }
    }

    fn from_sector(raw: &[u8; SECTOR]) -> Self {
        *zerocopy::LayoutVerified::<_, IndirectBlock>::new(&raw[..])
            .expect("indirect block sector has wrong layout")
            .into_ref()
    }
}

struct InodeState {
    open_cnt: u32,
    write_cnt: u32,
    removed: bool,
    deny_write_cnt: u32,
}

/// The in-memory record for one open inode. A second `open` of the same
/// sector returns the same record with `open_cnt` bumped, matching
/// spec.md §3's "a second open of the same sector returns the existing
/// record".
pub struct Inode {
    pub sector: u32,
    state: Mutex<InodeState>,
    /// Serializes writers that would extend the file; non-extending writers
    /// and readers proceed without it.
    extension_lock: Mutex<()>,
    /// Signaled whenever `write_cnt` reaches zero, for `deny_write` to wait on.
    writers_drained: WaitChannel,
    /// Guards linear scans/mutations of this inode's payload when it is
    /// used as a directory. spec.md §4.4: "Lookup is a linear scan under a
    /// per-directory lock (held on the backing inode)."
    pub(super) dir_lock: Mutex<()>,
}

impl Inode {
    pub(super) fn new(sector: u32) -> Self {
        Self {
            sector,
            state: Mutex::new(InodeState {
                open_cnt: 1,
                write_cnt: 0,
                removed: false,
                deny_write_cnt: 0,
            }),
            extension_lock: Mutex::new(()),
            writers_drained: WaitChannel::new(),
            dir_lock: Mutex::new(()),
        }
    }

    pub(super) fn bump_open(&self) {
        self.state.lock().expect("inode lock poisoned").open_cnt += 1;
    }

    pub(super) fn open_cnt(&self) -> u32 {
        self.state.lock().expect("inode lock poisoned").open_cnt
    }

    pub(super) fn dec_open(&self) -> u32 {
        let mut st = self.state.lock().expect("inode lock poisoned");
        st.open_cnt -= 1;
        st.open_cnt
    }

    pub fn mark_removed(&self) {
        self.state.lock().expect("inode lock poisoned").removed = true;
    }

    pub(super) fn removed(&self) -> bool {
        self.state.lock().expect("inode lock poisoned").removed
    }

    fn read_disk_inode(&self, fs: &FileSystem) -> DiskInode {
        let h = fs.bcache.get(self.sector, AccessMode::Share);
        let inode = DiskInode::from_sector(h.data());
        h.release(false);
        inode
    }

    pub fn length(&self, fs: &FileSystem) -> usize {
        self.read_disk_inode(fs).length as usize
    }

    pub fn is_file(&self, fs: &FileSystem) -> bool {
        self.read_disk_inode(fs).is_file != 0
    }

    fn set_length(&self, fs: &FileSystem, length: i32) {
        let h = fs.bcache.get(self.sector, AccessMode::Excl);
        let mut inode = DiskInode::from_sector(h.data());
        inode.length = length;
        h.data_mut().copy_from_slice(zerocopy::AsBytes::as_bytes(&inode));
        h.release(true);
    }

    fn read_block_ptr(&self, fs: &FileSystem, slot: usize) -> u32 {
        self.read_disk_inode(fs).blocks[slot]
    }

    fn set_block_ptr(&self, fs: &FileSystem, slot: usize, value: u32) {
        let h = fs.bcache.get(self.sector, AccessMode::Excl);
        let mut inode = DiskInode::from_sector(h.data());
        inode.blocks[slot] = value;
        h.data_mut().copy_from_slice(zerocopy::AsBytes::as_bytes(&inode));
        h.release(true);
    }

    fn zero_init_sector(&self, fs: &FileSystem, sector: u32) {
        let h = fs.bcache.get(sector, AccessMode::Excl);
        *h.data_mut() = [0u8; SECTOR];
        h.release(true);
    }

    /// Builds a fresh indirect block with a single pointer set, writes it,
    /// and returns its sector. The block has no readers yet (nothing points
    /// to it), so there is no synchronization hazard in writing its full
    /// content in one shot.
    fn write_fresh_indirect(&self, fs: &FileSystem, sector: u32, slot: usize, value: u32) {
        let mut block = IndirectBlock::empty();
        block.pointers[slot] = value;
        let h = fs.bcache.get(sector, AccessMode::Excl);
        h.data_mut().copy_from_slice(zerocopy::AsBytes::as_bytes(&block));
        h.release(true);
    }

    fn read_indirect_ptr(&self, fs: &FileSystem, sector: u32, slot: usize) -> u32 {
        let h = fs.bcache.get(sector, AccessMode::Share);
        let block = IndirectBlock::from_sector(h.data());
        h.release(false);
        block.pointers[slot]
    }

    fn set_indirect_ptr(&self, fs: &FileSystem, sector: u32, slot: usize, value: u32) {
        let h = fs.bcache.get(sector, AccessMode::Excl);
        let mut block = IndirectBlock::from_sector(h.data());
        block.pointers[slot] = value;
        h.data_mut()[..mem::size_of::<IndirectBlock>()]
            .copy_from_slice(zerocopy::AsBytes::as_bytes(&block));
        h.release(true);
    }

    /// Resolves the data sector for logical block `lbi`. With `create`
    /// false, a sparse (zero) pointer anywhere on the path yields `None`.
    /// With `create` true, allocates every missing block on the path in a
    /// single free-map call, zero-initializes new blocks before linking
    /// them, and only touches an already-existing ancestor (the inode, or
    /// an existing indirect block) as the final step.
    fn get_data_sector(&self, fs: &FileSystem, lbi: usize, create: bool) -> Option<u32> {
        if lbi < NUM_DIRECT_POINTERS {
            let existing = self.read_block_ptr(fs, lbi);
            if existing != NO_BLOCK {
                return Some(existing);
            }
            if !create {
                return None;
            }
            let sectors = fs.free_map.allocate(1)?;
            let data = sectors[0];
            self.zero_init_sector(fs, data);
            self.set_block_ptr(fs, lbi, data);
            return Some(data);
        }

        if lbi < NUM_DIRECT_POINTERS + POINTERS_PER_BLOCK {
            let inner = lbi - NUM_DIRECT_POINTERS;
            let indirect = self.read_block_ptr(fs, SINGLE_INDIRECT_INDEX);
            if indirect != NO_BLOCK {
                let existing = self.read_indirect_ptr(fs, indirect, inner);
                if existing != NO_BLOCK {
                    return Some(existing);
                }
                if !create {
                    return None;
                }
                let sectors = fs.free_map.allocate(1)?;
                let data = sectors[0];
                self.zero_init_sector(fs, data);
                self.set_indirect_ptr(fs, indirect, inner, data);
                return Some(data);
            }
            if !create {
                return None;
            }
            let sectors = fs.free_map.allocate(2)?;
            let (indirect, data) = (sectors[0], sectors[1]);
            self.zero_init_sector(fs, data);
            self.write_fresh_indirect(fs, indirect, inner, data);
            self.set_block_ptr(fs, SINGLE_INDIRECT_INDEX, indirect);
            return Some(data);
        }

        // Double-indirect: L' = L - NUM_DIRECT_POINTERS - POINTERS_PER_BLOCK,
        // subtracted once, per spec.md §4.3 (the bug several historical
        // copies have is subtracting NUM_DIRECT_POINTERS a second time here).
        let l2 = lbi - NUM_DIRECT_POINTERS - POINTERS_PER_BLOCK;
        let outer = l2 / POINTERS_PER_BLOCK;
        let inner = l2 % POINTERS_PER_BLOCK;
        let double = self.read_block_ptr(fs, DOUBLE_INDIRECT_INDEX);
        if double != NO_BLOCK {
            let single = self.read_indirect_ptr(fs, double, outer);
            if single != NO_BLOCK {
                let existing = self.read_indirect_ptr(fs, single, inner);
                if existing != NO_BLOCK {
                    return Some(existing);
                }
                if !create {
                    return None;
                }
                let sectors = fs.free_map.allocate(1)?;
                let data = sectors[0];
                self.zero_init_sector(fs, data);
                self.set_indirect_ptr(fs, single, inner, data);
                return Some(data);
            }
            if !create {
                return None;
            }
            let sectors = fs.free_map.allocate(2)?;
            let (single, data) = (sectors[0], sectors[1]);
            self.zero_init_sector(fs, data);
            self.write_fresh_indirect(fs, single, inner, data);
            self.set_indirect_ptr(fs, double, outer, single);
            return Some(data);
        }
        if !create {
            return None;
        }
        let sectors = fs.free_map.allocate(3)?;
        let (double, single, data) = (sectors[0], sectors[1], sectors[2]);
        self.zero_init_sector(fs, data);
        self.write_fresh_indirect(fs, single, inner, data);
        self.write_fresh_indirect(fs, double, outer, single);
        self.set_block_ptr(fs, DOUBLE_INDIRECT_INDEX, double);
        Some(data)
    }

    /// Resolves the data sector backing the byte at `offset`, without
    /// allocating. Used by the read-ahead worker to turn a queued
    /// `(inode, offset)` hint into a sector to prefetch.
    pub(super) fn data_sector_for_offset(&self, fs: &FileSystem, offset: usize) -> Option<u32> {
        if offset >= self.length(fs) {
            return None;
        }
        self.get_data_sector(fs, offset / SECTOR, false)
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Bytes beyond the
    /// inode's length, or falling in a sparse hole, read as zero. Returns
    /// the number of bytes actually within range.
    pub fn read_at(&self, fs: &FileSystem, buf: &mut [u8], offset: usize) -> usize {
        let length = self.length(fs);
        if offset >= length {
            return 0;
        }
        let end = (offset + buf.len()).min(length);
        let mut pos = offset;
        let mut done = 0;
        while pos < end {
            let lbi = pos / SECTOR;
            let sector_off = pos % SECTOR;
            let chunk = (SECTOR - sector_off).min(end - pos);
            match self.get_data_sector(fs, lbi, false) {
                Some(sector) => {
                    let (h, was_miss) = fs.bcache.get_tracking(sector, AccessMode::Share);
                    buf[done..done + chunk]
                        .copy_from_slice(&h.data()[sector_off..sector_off + chunk]);
                    h.release(false);
                    if was_miss {
                        fs.enqueue_read_ahead(self.sector, pos + chunk);
                    }
                }
                None => buf[done..done + chunk].fill(0),
            }
            pos += chunk;
            done += chunk;
        }
        done
    }

    /// Writes `buf` at `offset`, extending the file (and allocating blocks)
    /// as needed, clamped to `MAX_FILE_BYTES`. Returns 0 without writing
    /// anything if `deny_write` is currently in effect.
    pub fn write_at(&self, fs: &FileSystem, buf: &[u8], offset: usize) -> usize {
        {
            let mut st = self.state.lock().expect("inode lock poisoned");
            if st.deny_write_cnt > 0 {
                return 0;
            }
            st.write_cnt += 1;
        }

        let target_end = offset.saturating_add(buf.len());
        let clamped_end = target_end.min(crate::param::MAX_FILE_BYTES);
        let mut pos = offset;
        let mut done = 0;

        while pos < clamped_end {
            let lbi = pos / SECTOR;
            let sector_off = pos % SECTOR;
            let chunk = (SECTOR - sector_off).min(clamped_end - pos);

            let snapshot_length = self.length(fs);
            let probably_extends = pos + chunk > snapshot_length;
            let _ext_guard = probably_extends
                .then(|| self.extension_lock.lock().expect("extension lock poisoned"));
            let current_length = self.length(fs);
            let will_extend = pos + chunk > current_length;

            let sector = match self.get_data_sector(fs, lbi, true) {
                Some(s) => s,
                None => break, // free map exhausted: short write
            };

            let h = fs.bcache.get(sector, AccessMode::Share);
            h.data_mut()[sector_off..sector_off + chunk]
                .copy_from_slice(&buf[done..done + chunk]);
            h.release(true);

            if will_extend {
                self.set_length(fs, (pos + chunk) as i32);
            }

            pos += chunk;
            done += chunk;
        }

        {
            let mut st = self.state.lock().expect("inode lock poisoned");
            st.write_cnt -= 1;
            if st.write_cnt == 0 {
                self.writers_drained.wakeup_all();
            }
        }
        done
    }

    /// Waits for every in-flight writer to finish, then blocks new writes
    /// from starting. Balanced by [`allow_write`](Self::allow_write).
    pub fn deny_write(&self, fs: &FileSystem) {
        let _ = fs;
        let mut st = self.state.lock().expect("inode lock poisoned");
        while st.write_cnt > 0 {
            st = self.writers_drained.sleep(st);
        }
        st.deny_write_cnt += 1;
    }

    pub fn allow_write(&self) {
        let mut st = self.state.lock().expect("inode lock poisoned");
        assert!(st.deny_write_cnt > 0, "allow_write without matching deny_write");
        st.deny_write_cnt -= 1;
    }

    /// Frees every block this inode reaches (data, then singly-indirect,
    /// then the doubly-indirect block), then the inode sector itself.
    /// Called once on the last close of a `removed` inode.
    pub(super) fn free_blocks(&self, fs: &FileSystem) {
        let inode = self.read_disk_inode(fs);

        for slot in 0..NUM_DIRECT_POINTERS {
            let sector = inode.blocks[slot];
            if sector != NO_BLOCK {
                fs.free_map.release(sector);
            }
        }

        let indirect = inode.blocks[SINGLE_INDIRECT_INDEX];
        if indirect != NO_BLOCK {
            self.free_indirect_block(fs, indirect);
        }

        let double = inode.blocks[DOUBLE_INDIRECT_INDEX];
        if double != NO_BLOCK {
            let block = {
                let h = fs.bcache.get(double, AccessMode::Share);
                let b = IndirectBlock::from_sector(h.data());
                h.release(false);
                b
            };
            for &single in block.pointers.iter() {
                if single != NO_BLOCK {
                    self.free_indirect_block(fs, single);
                }
            }
            fs.free_map.release(double);
        }

        fs.free_map.release(self.sector);
    }

    fn free_indirect_block(&self, fs: &FileSystem, sector: u32) {
        let block = {
            let h = fs.bcache.get(sector, AccessMode::Share);
            let b = IndirectBlock::from_sector(h.data());
            h.release(false);
            b
        };
        for &data in block.pointers.iter() {
            if data != NO_BLOCK {
                fs.free_map.release(data);
            }
        }
        fs.free_map.release(sector);
    }
}

/// A name suitable for a directory entry: non-empty and at most `NAME_MAX`
/// bytes.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= NAME_MAX && !name.contains('/')
}
