//! Supplementary page table entries (SPTEs): how to materialize a user page
//! on fault. Grounded in the `VmAreaStruct`/`MmLoader` shape of
//! `casys-kaist-KeOS/keos-projects/keos-project3/src/lazy_pager.rs` (a
//! per-region "how do I load this" descriptor) and in
//! `kernel-rs/src/vm.rs`'s `UserMemory::load_file` for the lazy-executable
//! segment case this generalizes to MMAP and TMP pages as well.

use std::sync::{Arc, Mutex};

use crate::fs::inode::Inode;

use super::swap::SlotId;

/// Determines eviction policy (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpteKind {
    /// A lazily-loaded segment of the running executable.
    Exec,
    /// A page from an `mmap`-ed file.
    Mmap,
    /// An anonymous page (the stack). Created eagerly, zero-filled.
    Tmp,
}

/// Where a page's bytes come from when the filesystem is still
/// authoritative for it.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<Inode>,
    pub offset: usize,
    pub read_bytes: usize,
    pub writable: bool,
}

/// The discriminated backing-store union: spec.md §9's "duck-typed
/// variant" — `filesys_page` is implicit in which arm this is, rather than
/// a separate bool living alongside it.
#[derive(Clone)]
pub enum Backing {
    Filesystem(FileBacking),
    Swap(SlotId),
}

/// One supplementary page table entry.
pub struct Spte {
    pub kind: SpteKind,
    pub backing: Mutex<Backing>,
}

impl Spte {
    pub fn exec(file: Arc<Inode>, offset: usize, read_bytes: usize, writable: bool) -> Self {
        Self {
            kind: SpteKind::Exec,
            backing: Mutex::new(Backing::Filesystem(FileBacking {
                file,
                offset,
                read_bytes,
                writable,
            })),
        }
    }

    pub fn mmap(file: Arc<Inode>, offset: usize, read_bytes: usize) -> Self {
        Self {
            kind: SpteKind::Mmap,
            backing: Mutex::new(Backing::Filesystem(FileBacking {
                file,
                offset,
                read_bytes,
                writable: true,
            })),
        }
    }

    pub fn tmp() -> Self {
        Self {
            kind: SpteKind::Tmp,
            // A fresh TMP page has no backing store yet; it is materialized
            // zero-filled and only gets a swap slot on its first eviction.
            // `Backing` has no "none" arm, so TMP pages are installed
            // directly by the caller rather than going through `spt_load`'s
            // backing-store read path; see `AddressSpace::add_stack_page`.
            backing: Mutex::new(Backing::Swap(SlotId(u32::MAX))),
        }
    }
}
