//! Directories: a directory is just an inode whose payload is a sequence of
//! fixed-size entries. Grounded in
//! `examples/original_source/src/filesys/directory.c` for the `.`/`..`
//! planting and linear-scan lookup, with the fixed-size `Dirent` layout
//! following the `#[repr(C)]` + `zerocopy` pattern of
//! `kernel-rs/src/fs/ufs/inode.rs`'s `Dirent`.

use std::mem;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::param::{NAME_MAX, NO_BLOCK};

use super::inode::{validate_name, Inode};
use super::FileSystem;

const NAME_FIELD: usize = NAME_MAX + 1;

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DirEntry {
    pub inode_sector: u32,
    pub name: [u8; NAME_FIELD],
    pub in_use: u8,
}

// NAME_FIELD is 15, so 4 (u32) + 15 + 1 = 20 bytes — already a multiple of
// the struct's 4-byte alignment, so there is no compiler-inserted padding
// for the derive macros to trip over.
const_assert_eq!(mem::size_of::<DirEntry>(), 20);

pub const DIR_ENTRY_SIZE: usize = mem::size_of::<DirEntry>();

impl DirEntry {
    fn new(name: &str, inode_sector: u32) -> Self {
        let mut bytes = [0u8; NAME_FIELD];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            inode_sector,
            name: bytes,
            in_use: 1,
        }
    }

    fn name_str(&self) -> &str {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).expect("directory entry name is not utf8")
    }
}

/// Creates a fresh directory's payload: `.` and `..` pre-planted. Called
/// right after a new inode is allocated for the directory.
pub fn init_directory(fs: &FileSystem, inode: &Inode, parent_sector: u32) {
    let dot = DirEntry::new(".", inode.sector);
    let dotdot = DirEntry::new("..", parent_sector);
    inode.write_at(fs, AsBytes::as_bytes(&dot), 0);
    inode.write_at(fs, AsBytes::as_bytes(&dotdot), DIR_ENTRY_SIZE);
}

fn read_entry(fs: &FileSystem, dir: &Inode, offset: usize) -> Option<DirEntry> {
    let mut raw = [0u8; DIR_ENTRY_SIZE];
    let n = dir.read_at(fs, &mut raw, offset);
    if n < DIR_ENTRY_SIZE {
        return None;
    }
    Some(
        *zerocopy::LayoutVerified::<_, DirEntry>::new(&raw[..])
            .expect("directory entry has wrong layout")
            .into_ref(),
    )
}

fn entry_count(fs: &FileSystem, dir: &Inode) -> usize {
    dir.length(fs) / DIR_ENTRY_SIZE
}

/// Scans `dir`'s payload linearly for `name`. Returns the matching entry's
/// inode sector and its byte offset within the directory.
pub fn lookup(fs: &FileSystem, dir: &Inode, name: &str) -> Option<(u32, usize)> {
    let _guard = dir.dir_lock.lock().expect("directory lock poisoned");
    lookup_locked(fs, dir, name)
}

/// Same as `lookup`, but assumes the caller already holds `dir.dir_lock` —
/// used by `FileSystem::remove` to fold lookup, the emptiness/open-count
/// decision, and the entry erase into one critical section.
pub(super) fn lookup_locked(fs: &FileSystem, dir: &Inode, name: &str) -> Option<(u32, usize)> {
    for i in 0..entry_count(fs, dir) {
        let offset = i * DIR_ENTRY_SIZE;
        if let Some(entry) = read_entry(fs, dir, offset) {
            if entry.in_use != 0 && entry.name_str() == name {
                return Some((entry.inode_sector, offset));
            }
        }
    }
    None
}

/// Adds a new entry to `dir`, reusing the first free (not-in-use) slot if
/// one exists, else appending. Fails if `name` is invalid or already
/// present.
pub fn add_entry(fs: &FileSystem, dir: &Inode, name: &str, inode_sector: u32) -> Result<(), crate::KernelError> {
    if !validate_name(name) {
        return Err(crate::KernelError::InvalidName);
    }
    let _guard = dir.dir_lock.lock().expect("directory lock poisoned");
    for i in 0..entry_count(fs, dir) {
        let offset = i * DIR_ENTRY_SIZE;
        if let Some(entry) = read_entry(fs, dir, offset) {
            if entry.in_use != 0 && entry.name_str() == name {
                return Err(crate::KernelError::FileExists);
            }
        }
    }

    let mut free_offset = None;
    for i in 0..entry_count(fs, dir) {
        let offset = i * DIR_ENTRY_SIZE;
        if let Some(entry) = read_entry(fs, dir, offset) {
            if entry.in_use == 0 {
                free_offset = Some(offset);
                break;
            }
        }
    }
    let offset = free_offset.unwrap_or_else(|| entry_count(fs, dir) * DIR_ENTRY_SIZE);
    let entry = DirEntry::new(name, inode_sector);
    dir.write_at(fs, AsBytes::as_bytes(&entry), offset);
    Ok(())
}

/// Marks the entry at `offset` unused. Does not free the target inode;
/// callers do that through the open-inode table once `open_cnt` drains.
pub fn remove_entry(fs: &FileSystem, dir: &Inode, offset: usize) {
    let _guard = dir.dir_lock.lock().expect("directory lock poisoned");
    remove_entry_locked(fs, dir, offset);
}

/// Same as `remove_entry`, but assumes the caller already holds
/// `dir.dir_lock` — see `lookup_locked`.
pub(super) fn remove_entry_locked(fs: &FileSystem, dir: &Inode, offset: usize) {
    if let Some(mut entry) = read_entry(fs, dir, offset) {
        entry.in_use = 0;
        entry.inode_sector = NO_BLOCK;
        dir.write_at(fs, AsBytes::as_bytes(&entry), offset);
    }
}

/// Lists every real entry (skipping `.` and `..`).
pub fn list(fs: &FileSystem, dir: &Inode) -> Vec<String> {
    let _guard = dir.dir_lock.lock().expect("directory lock poisoned");
    let mut names = Vec::new();
    for i in 0..entry_count(fs, dir) {
        let offset = i * DIR_ENTRY_SIZE;
        if let Some(entry) = read_entry(fs, dir, offset) {
            if entry.in_use != 0 {
                let name = entry.name_str();
                if name != "." && name != ".." {
                    names.push(name.to_string());
                }
            }
        }
    }
    names
}

/// Number of real entries (excluding `.`/`..`) — used by `remove`'s
/// empty-directory check.
pub fn real_entry_count(fs: &FileSystem, dir: &Inode) -> usize {
    list(fs, dir).len()
}
