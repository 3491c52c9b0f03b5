//! The paging virtual-memory subsystem: a per-process supplementary page
//! table and simulated hardware page table, a global frame table, a swap
//! store, and the page-fault handler that ties them together.
//!
//! There is no MMU to consult in this hosted simulation, so
//! [`AddressSpace`] carries a plain `BTreeMap`-backed page table
//! (`PteState`) exposing the same `present`/`writable`/`accessed`/`dirty`
//! bits a real page-table entry would, per `SPEC_FULL.md`'s hosted-mode
//! data-model note.

pub mod fault;
pub mod frame;
pub mod mmap;
pub mod spt;
pub mod swap;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::KernelError;
use crate::fs::inode::Inode;
use crate::fs::FileSystem;
use crate::param::PAGE;

use frame::FrameTable;
use mmap::{MapId, MmapTable};
use spt::{Backing, Spte, SpteKind};
use swap::SwapStore;

/// The simulated hardware page-table entry bits for one user page.
#[derive(Clone, Copy, Default)]
struct PteState {
    frame: Option<usize>,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A process's address space: its supplementary page table plus its
/// (simulated) hardware page table. Keyed by user-page base address.
pub struct AddressSpace {
    page_table: Mutex<BTreeMap<usize, PteState>>,
    spt: Mutex<BTreeMap<usize, Arc<Spte>>>,
    /// map-id → {start page, page count}, spec.md's Data Model "Mmap table
    /// entry". Populated by `add_mmap`, consulted by `munmap`.
    mmap_table: Mutex<MmapTable>,
    /// Current user stack pointer, consulted by the fault handler's
    /// stack-growth check.
    pub stack_pointer: Mutex<usize>,
}

impl AddressSpace {
    pub fn new(stack_pointer: usize) -> Arc<Self> {
        Arc::new(Self {
            page_table: Mutex::new(BTreeMap::new()),
            spt: Mutex::new(BTreeMap::new()),
            mmap_table: Mutex::new(MmapTable::new()),
            stack_pointer: Mutex::new(stack_pointer),
        })
    }

    fn accessed(&self, page: usize) -> bool {
        self.page_table
            .lock()
            .expect("page table lock poisoned")
            .get(&page)
            .is_some_and(|p| p.accessed)
    }

    fn clear_accessed(&self, page: usize) {
        if let Some(p) = self.page_table.lock().expect("page table lock poisoned").get_mut(&page) {
            p.accessed = false;
        }
    }

    fn dirty(&self, page: usize) -> bool {
        self.page_table
            .lock()
            .expect("page table lock poisoned")
            .get(&page)
            .is_some_and(|p| p.dirty)
    }

    /// Marks `page` accessed and (if `write`) dirty — stands in for what
    /// real hardware does on a memory reference. Test-only hook into an
    /// otherwise-implicit hardware behavior.
    pub fn touch(&self, page: usize, write: bool) {
        if let Some(p) = self.page_table.lock().expect("page table lock poisoned").get_mut(&page) {
            p.accessed = true;
            if write {
                p.dirty = true;
            }
        }
    }

    fn clear_page(&self, page: usize) {
        let mut pt = self.page_table.lock().expect("page table lock poisoned");
        let prior = pt.get(&page).copied().unwrap_or_default();
        pt.insert(page, PteState { frame: None, ..prior });
    }

    fn install(&self, page: usize, frame: usize, writable: bool) {
        self.page_table.lock().expect("page table lock poisoned").insert(
            page,
            PteState {
                frame: Some(frame),
                writable,
                accessed: false,
                dirty: false,
            },
        );
    }

    pub fn is_present(&self, page: usize) -> bool {
        self.page_table
            .lock()
            .expect("page table lock poisoned")
            .get(&page)
            .is_some_and(|p| p.frame.is_some())
    }

    pub fn frame_of(&self, page: usize) -> Option<usize> {
        self.page_table
            .lock()
            .expect("page table lock poisoned")
            .get(&page)
            .and_then(|p| p.frame)
    }

    /// Whether `page` is currently mapped writable — consulted by syscalls
    /// that would otherwise silently corrupt a read-only segment.
    pub fn is_writable(&self, page: usize) -> bool {
        self.page_table
            .lock()
            .expect("page table lock poisoned")
            .get(&page)
            .is_some_and(|p| p.writable)
    }

    fn spte(&self, page: usize) -> Option<Arc<Spte>> {
        self.spt.lock().expect("SPT lock poisoned").get(&page).cloned()
    }

    fn has_spte(&self, page: usize) -> bool {
        self.spt.lock().expect("SPT lock poisoned").contains_key(&page)
    }

    fn remove_spte(&self, page: usize) -> Option<Arc<Spte>> {
        self.spt.lock().expect("SPT lock poisoned").remove(&page)
    }

    /// Registers a lazily-loaded executable segment.
    pub fn add_exec_page(&self, page: usize, file: Arc<Inode>, offset: usize, read_bytes: usize, writable: bool) {
        self.spt
            .lock()
            .expect("SPT lock poisoned")
            .insert(page, Arc::new(Spte::exec(file, offset, read_bytes, writable)));
    }

    /// Registers a consecutive run of `page_count` memory-mapped pages
    /// starting at `start` and records the mapping in the mmap table. If
    /// any one page's SPTE insertion fails (only possible if the range
    /// overlaps an existing mapping), earlier pages in this call are
    /// rolled back and no mmap-table entry is created.
    pub fn add_mmap(
        &self,
        start: usize,
        file: Arc<Inode>,
        page_count: usize,
        final_read_bytes: usize,
    ) -> Result<MapId, KernelError> {
        let mut spt = self.spt.lock().expect("SPT lock poisoned");
        for i in 0..page_count {
            if spt.contains_key(&(start + i * PAGE)) {
                for j in 0..i {
                    spt.remove(&(start + j * PAGE));
                }
                return Err(KernelError::MappingOverlap);
            }
        }
        for i in 0..page_count {
            let read_bytes = if i + 1 == page_count { final_read_bytes } else { PAGE };
            spt.insert(
                start + i * PAGE,
                Arc::new(Spte::mmap(file.clone(), i * PAGE, read_bytes)),
            );
        }
        drop(spt);
        Ok(self
            .mmap_table
            .lock()
            .expect("mmap table lock poisoned")
            .insert(start, page_count))
    }

    /// Resolves `map_id` through the mmap table, writes back/frees its
    /// pages, and drops the table entry. Mirrors `mmap.c`'s
    /// `mmap_remove` + `spt_remove_mmap_pages` pair.
    pub fn munmap(&self, map_id: MapId, frames: &FrameTable, fs: &FileSystem, swap: &SwapStore) -> Result<(), KernelError> {
        let entry = self
            .mmap_table
            .lock()
            .expect("mmap table lock poisoned")
            .remove(map_id)
            .ok_or(KernelError::NoSuchEntry)?;
        self.unmap_range(entry.start_page, entry.page_count, frames, fs, swap);
        Ok(())
    }

    /// Eagerly allocates and installs a zero-filled stack page.
    pub fn add_stack_page(self: &Arc<Self>, page: usize, frames: &FrameTable, fs: &FileSystem, swap: &SwapStore) {
        self.spt.lock().expect("SPT lock poisoned").insert(page, Arc::new(Spte::tmp()));
        let index = frames.allocate(fs, swap);
        frames.install(index, self.clone(), page, &[0u8; PAGE], true);
        self.install(page, index, true);
        frames.unpin(index);
    }

    /// Writes back dirty MMAP pages and frees frames/swap slots for every
    /// page this address space owns in `[start, start + page_count*PAGE)`,
    /// then drops their SPTEs. Used by `munmap` and process exit.
    pub fn unmap_range(&self, start: usize, page_count: usize, frames: &FrameTable, fs: &FileSystem, swap: &SwapStore) {
        for i in 0..page_count {
            let page = start + i * PAGE;
            if let Some(frame) = self.frame_of(page) {
                if let Some(spte) = self.spt.lock().expect("SPT lock poisoned").get(&page) {
                    if spte.kind == SpteKind::Mmap && self.dirty(page) {
                        let backing = spte.backing.lock().expect("SPTE backing lock poisoned");
                        if let Backing::Filesystem(fb) = &*backing {
                            let mut content = [0u8; PAGE];
                            frames.read(frame, &mut content);
                            fb.file.write_at(fs, &content[..fb.read_bytes.min(PAGE)], fb.offset);
                        }
                    }
                }
                frames.clear_page(frame);
                frames.free(frame);
            } else if let Some(spte) = self.remove_spte(page) {
                let backing = spte.backing.lock().expect("SPTE backing lock poisoned");
                if let Backing::Swap(slot) = &*backing {
                    swap.free(*slot);
                }
                continue;
            }
            self.remove_spte(page);
            self.page_table.lock().expect("page table lock poisoned").remove(&page);
        }
    }

    /// Loads the page at `page` per its SPTE: gets a frame (possibly via
    /// eviction), reads its content from whichever store is currently
    /// authoritative, installs the mapping, and pins it iff `keep_pinned`.
    pub fn spt_load(self: &Arc<Self>, frames: &FrameTable, swap: &SwapStore, fs: &FileSystem, page: usize, keep_pinned: bool) -> Result<(), KernelError> {
        let (backing, writable) = {
            let spt = self.spt.lock().expect("SPT lock poisoned");
            let spte = spt.get(&page).ok_or(KernelError::NoSuchEntry)?;
            let backing = spte.backing.lock().expect("SPTE backing lock poisoned").clone_for_load();
            let writable = match &backing {
                Backing::Filesystem(fb) => fb.writable,
                Backing::Swap(_) => true,
            };
            (backing, writable)
        };

        let index = frames.allocate(fs, swap);
        let mut content = [0u8; PAGE];
        match &backing {
            Backing::Filesystem(fb) => {
                let read_bytes = fb.read_bytes.min(PAGE);
                fb.file.read_at(fs, &mut content[..read_bytes], fb.offset);
            }
            Backing::Swap(slot) => {
                // `swap.read` consumes the slot; a fresh one is allocated if
                // this page is evicted again.
                swap.read(*slot, &mut content);
            }
        }

        frames.install(index, self.clone(), page, &content, true);
        self.install(page, index, writable);
        if !keep_pinned {
            frames.unpin(index);
        }
        Ok(())
    }
}

impl Backing {
    fn clone_for_load(&self) -> Backing {
        match self {
            Backing::Filesystem(fb) => Backing::Filesystem(fb.clone()),
            Backing::Swap(s) => Backing::Swap(*s),
        }
    }
}

/// Bundles the frame table and swap store — the two pieces of VM state
/// that are process-wide rather than per-address-space.
pub struct VirtualMemory {
    pub frames: FrameTable,
    pub swap: SwapStore,
}

impl VirtualMemory {
    pub fn new(frame_capacity: usize, swap_device: Arc<dyn crate::device::BlockDevice>) -> Self {
        Self {
            frames: FrameTable::new(frame_capacity),
            swap: SwapStore::new(swap_device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::param::{PHYS_BASE, ROOT_DIR_SECTOR, SECTORS_PER_PAGE};

    fn harness(frame_capacity: usize) -> (Arc<FileSystem>, VirtualMemory) {
        let fs = FileSystem::format(Arc::new(MemBlockDevice::new(512)));
        let vm = VirtualMemory::new(
            frame_capacity,
            Arc::new(MemBlockDevice::new(16 * SECTORS_PER_PAGE as u32)),
        );
        (fs, vm)
    }

    #[test]
    fn exec_page_loads_file_bytes_and_zero_fills_the_remainder() {
        let (fs, vm) = harness(4);
        let root = fs.open(ROOT_DIR_SECTOR);
        let elf = fs.create(&root, "a.out", true).expect("create");
        elf.write_at(&fs, b"hi", 0);

        let space = AddressSpace::new(PHYS_BASE);
        space.add_exec_page(0x1000, elf.clone(), 0, 2, false);
        space.spt_load(&vm.frames, &vm.swap, &fs, 0x1000, false).expect("load");

        let frame = space.frame_of(0x1000).expect("page present after load");
        let mut content = [0u8; PAGE];
        vm.frames.read(frame, &mut content);
        assert_eq!(&content[..2], b"hi");
        assert!(content[2..].iter().all(|&b| b == 0));

        fs.close(elf);
        fs.close(root);
    }

    #[test]
    fn dirty_tmp_page_survives_an_eviction_round_trip() {
        let (fs, vm) = harness(1);
        let space = AddressSpace::new(PHYS_BASE);
        space.add_stack_page(PHYS_BASE - PAGE, &vm.frames, &fs, &vm.swap);
        let frame = space.frame_of(PHYS_BASE - PAGE).unwrap();
        let mut payload = [0u8; PAGE];
        payload[0] = 42;
        vm.frames.write(frame, &payload);
        space.touch(PHYS_BASE - PAGE, true);

        // The table has only one frame; allocating another forces eviction
        // of the stack page just installed.
        let other = AddressSpace::new(PHYS_BASE);
        other.add_exec_page(0x2000, fs.open(ROOT_DIR_SECTOR), 0, 0, false);
        other.spt_load(&vm.frames, &vm.swap, &fs, 0x2000, false).expect("load");
        fs.close(fs.open(ROOT_DIR_SECTOR));

        assert!(!space.is_present(PHYS_BASE - PAGE));
        space
            .spt_load(&vm.frames, &vm.swap, &fs, PHYS_BASE - PAGE, false)
            .expect("reload after eviction");
        let frame = space.frame_of(PHYS_BASE - PAGE).unwrap();
        let mut restored = [0u8; PAGE];
        vm.frames.read(frame, &mut restored);
        assert_eq!(restored[0], 42);
    }

    #[test]
    fn a_pinned_frame_is_never_chosen_by_eviction() {
        let (fs, vm) = harness(1);
        let space = AddressSpace::new(PHYS_BASE);
        space.add_stack_page(PHYS_BASE - PAGE, &vm.frames, &fs, &vm.swap);
        let pinned_frame = space.frame_of(PHYS_BASE - PAGE).unwrap();
        vm.frames.pin(pinned_frame);

        let other = AddressSpace::new(PHYS_BASE);
        other.add_exec_page(0x3000, fs.open(ROOT_DIR_SECTOR), 0, 0, false);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            other.spt_load(&vm.frames, &vm.swap, &fs, 0x3000, false)
        }));
        assert!(outcome.is_err(), "eviction must refuse to touch a pinned frame");
    }

    #[test]
    fn mmap_dirty_write_back_lands_in_the_backing_file() {
        let (fs, vm) = harness(4);
        let root = fs.open(ROOT_DIR_SECTOR);
        let backing_file = fs.create(&root, "m.dat", true).expect("create");
        backing_file.write_at(&fs, &[0u8; PAGE], 0);

        let space = AddressSpace::new(PHYS_BASE);
        let map_id = space
            .add_mmap(0x4000, backing_file.clone(), 1, PAGE)
            .expect("mmap");
        space.spt_load(&vm.frames, &vm.swap, &fs, 0x4000, false).expect("load");

        let frame = space.frame_of(0x4000).unwrap();
        let mut content = [0u8; PAGE];
        content[..5].copy_from_slice(b"dirty");
        vm.frames.write(frame, &content);
        space.touch(0x4000, true);

        space.munmap(map_id, &vm.frames, &fs, &vm.swap).expect("munmap");

        let mut readback = [0u8; 5];
        assert_eq!(backing_file.read_at(&fs, &mut readback, 0), 5);
        assert_eq!(&readback, b"dirty");

        fs.close(backing_file);
        fs.close(root);
    }

    #[test]
    fn munmap_resolves_through_the_mmap_table_and_rejects_a_stale_map_id() {
        let (fs, vm) = harness(4);
        let root = fs.open(ROOT_DIR_SECTOR);
        let backing_file = fs.create(&root, "m2.dat", true).expect("create");
        backing_file.write_at(&fs, &[0u8; 2 * PAGE], 0);

        let space = AddressSpace::new(PHYS_BASE);
        let map_id = space.add_mmap(0x5000, backing_file.clone(), 2, PAGE).expect("mmap");

        space.munmap(map_id, &vm.frames, &fs, &vm.swap).expect("first munmap succeeds");
        match space.munmap(map_id, &vm.frames, &fs, &vm.swap) {
            Err(KernelError::NoSuchEntry) => {}
            other => panic!("expected NoSuchEntry on a reused map-id, got {other:?}", other = other.is_ok()),
        }

        fs.close(backing_file);
        fs.close(root);
    }
}
