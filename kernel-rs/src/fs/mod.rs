//! The multilevel-index file layer: free map, inodes, directories, and path
//! resolution, layered on top of [`crate::bcache`].
//!
//! The open-inode table below is grounded in the teacher's `Itable`
//! (`kernel-rs/src/fs/ufs/mod.rs`): a global map from sector to in-memory
//! record, a second `open` of the same sector bumping a refcount rather
//! than creating a second record.

pub mod dir;
pub mod inode;
pub mod path;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::bcache::{AccessMode, BufferCache};
use crate::device::BlockDevice;
use crate::error::KernelError;
use crate::param::{ROOT_DIR_SECTOR, SECTOR};
use crate::sync::WaitChannel;

use freemap::FreeMap;
use inode::{DiskInode, Inode};
use path::Path;

pub mod freemap;

/// How many sectors the persisted free-map bitmap occupies for a device of
/// `num_sectors` sectors, rounded up.
fn free_map_sectors(num_sectors: u32) -> u32 {
    let bits_per_sector = (SECTOR * 8) as u32;
    num_sectors.div_ceil(bits_per_sector)
}

/// A pending read-ahead request: bring in the block at `offset` bytes into
/// the file rooted at `inode_sector`.
struct ReadAheadRequest {
    inode_sector: u32,
    offset: usize,
}

struct ReadAheadQueue {
    pending: Mutex<VecDeque<ReadAheadRequest>>,
    has_work: WaitChannel,
}

impl ReadAheadQueue {
    fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            has_work: WaitChannel::new(),
        }
    }

    fn enqueue(&self, inode_sector: u32, offset: usize) {
        let mut q = self.pending.lock().expect("read-ahead queue lock poisoned");
        q.push_back(ReadAheadRequest {
            inode_sector,
            offset,
        });
        self.has_work.wakeup_one();
    }

    fn dequeue(&self) -> ReadAheadRequest {
        let mut q = self.pending.lock().expect("read-ahead queue lock poisoned");
        loop {
            if let Some(req) = q.pop_front() {
                return req;
            }
            q = self.has_work.sleep(q);
        }
    }
}

/// The filesystem: buffer cache, free map, and the open-inode table.
/// Matches spec.md §9's "localize [global state] in a single kernel
/// services context object; subsystems take an explicit reference rather
/// than reaching into globals" — every `Inode` method that needs the cache
/// or the free map takes `&FileSystem` explicitly.
pub struct FileSystem {
    pub bcache: Arc<BufferCache>,
    pub free_map: FreeMap,
    open_inodes: Mutex<HashMap<u32, Arc<Inode>>>,
    read_ahead: ReadAheadQueue,
}

impl FileSystem {
    /// Formats a fresh filesystem on `device`: a new free map with the
    /// free-map-file and root-directory sectors reserved, the root
    /// directory inode initialized with `.`/`..` pointing to itself.
    pub fn format(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let num_sectors = device.num_sectors();
        let bcache = BufferCache::new(device);
        let free_map = FreeMap::format(num_sectors);
        // The free-map bitmap's own backing sectors are bootstrapped
        // outside the general inode machinery (the bitmap doesn't exist
        // yet to allocate blocks from) and are reserved directly,
        // immediately after the root directory sector.
        for s in 0..free_map_sectors(num_sectors) {
            let sector = ROOT_DIR_SECTOR + 1 + s;
            if (sector as usize) < num_sectors as usize {
                free_map.reserve(sector);
            }
        }

        let root_disk_inode = DiskInode::new(false);
        {
            let h = bcache.get(ROOT_DIR_SECTOR, AccessMode::Excl);
            h.data_mut()
                .copy_from_slice(zerocopy::AsBytes::as_bytes(&root_disk_inode));
            h.release(true);
        }

        let fs = Arc::new(Self {
            bcache,
            free_map,
            open_inodes: Mutex::new(HashMap::new()),
            read_ahead: ReadAheadQueue::new(),
        });

        let root = fs.open(ROOT_DIR_SECTOR);
        dir::init_directory(&fs, &root, ROOT_DIR_SECTOR);
        fs.close(root);
        fs.persist_free_map();
        fs
    }

    /// Reopens a filesystem previously formatted on `device`, restoring the
    /// free map from its persisted sectors.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let num_sectors = device.num_sectors();
        let bcache = BufferCache::new(device);
        let mut bits = vec![false; num_sectors as usize];
        let n = free_map_sectors(num_sectors);
        for s in 0..n {
            let sector = ROOT_DIR_SECTOR + 1 + s;
            if sector as usize >= bits.len() {
                break;
            }
            let h = bcache.get(sector, AccessMode::Share);
            let raw = *h.data();
            h.release(false);
            for (i, bit) in bits
                .iter_mut()
                .skip((s as usize) * SECTOR * 8)
                .take(SECTOR * 8)
                .enumerate()
            {
                let byte = raw[i / 8];
                *bit = (byte >> (i % 8)) & 1 != 0;
            }
        }
        let free_map = FreeMap::from_bits(bits);
        Arc::new(Self {
            bcache,
            free_map,
            open_inodes: Mutex::new(HashMap::new()),
            read_ahead: ReadAheadQueue::new(),
        })
    }

    fn persist_free_map(&self) {
        let bits = self.free_map.to_bits();
        let n = free_map_sectors(bits.len() as u32);
        for s in 0..n {
            let sector = ROOT_DIR_SECTOR + 1 + s;
            if sector as usize >= bits.len() {
                break;
            }
            let mut raw = [0u8; SECTOR];
            for (i, byte) in raw.iter_mut().enumerate() {
                let base = (s as usize) * SECTOR * 8 + i * 8;
                let mut b = 0u8;
                for bitpos in 0..8 {
                    if bits.get(base + bitpos).copied().unwrap_or(false) {
                        b |= 1 << bitpos;
                    }
                }
                *byte = b;
            }
            let h = self.bcache.get(sector, AccessMode::Excl);
            *h.data_mut() = raw;
            h.release(true);
        }
    }

    /// Opens the inode at `sector`, returning the shared in-memory record
    /// (creating it if this is the first open).
    pub fn open(self: &Arc<Self>, sector: u32) -> Arc<Inode> {
        let mut table = self.open_inodes.lock().expect("open-inodes lock poisoned");
        if let Some(existing) = table.get(&sector) {
            existing.bump_open();
            return existing.clone();
        }
        let inode = Arc::new(Inode::new(sector));
        table.insert(sector, inode.clone());
        inode
    }

    /// Closes one reference to `inode`. On the last close of a `removed`
    /// inode, releases every block it owns back to the free map.
    pub fn close(self: &Arc<Self>, inode: Arc<Inode>) {
        let mut table = self.open_inodes.lock().expect("open-inodes lock poisoned");
        let remaining = inode.dec_open();
        if remaining == 0 {
            table.remove(&inode.sector);
            drop(table);
            if inode.removed() {
                inode.free_blocks(self);
            }
        }
    }

    /// Enqueues a read-ahead hint: the caller just brought in the block at
    /// `offset` within the file rooted at `inode_sector` on a cache miss.
    pub(crate) fn enqueue_read_ahead(&self, inode_sector: u32, offset: usize) {
        self.read_ahead.enqueue(inode_sector, offset);
    }

    /// Runs the read-ahead worker loop: dequeue one request at a time,
    /// resolve it to a sector through the given inode, and fetch it in
    /// `R_AHEAD` mode. Intended to run on its own thread; `stop` ends the
    /// loop after the current wait.
    pub fn read_ahead_worker(self: &Arc<Self>) {
        loop {
            let req = self.read_ahead.dequeue();
            let inode = self.open(req.inode_sector);
            if let Some(sector) = inode.data_sector_for_offset(self, req.offset) {
                self.bcache.prefetch(sector);
            }
            self.close(inode);
        }
    }

    /// Creates a new file or directory named `name` inside `parent`.
    pub fn create(
        self: &Arc<Self>,
        parent: &Arc<Inode>,
        name: &str,
        is_file: bool,
    ) -> Result<Arc<Inode>, KernelError> {
        if !inode::validate_name(name) {
            return Err(KernelError::InvalidName);
        }
        if dir::lookup(self, parent, name).is_some() {
            return Err(KernelError::FileExists);
        }
        let sectors = self.free_map.allocate(1).ok_or(KernelError::NoSpace)?;
        let sector = sectors[0];
        {
            let h = self.bcache.get(sector, AccessMode::Excl);
            h.data_mut()
                .copy_from_slice(zerocopy::AsBytes::as_bytes(&DiskInode::new(is_file)));
            h.release(true);
        }
        let child = self.open(sector);
        if !is_file {
            dir::init_directory(self, &child, parent.sector);
        }
        dir::add_entry(self, parent, name, sector)?;
        Ok(child)
    }

    /// Removes `name` from `parent`. Only directories are required to be
    /// empty and not open elsewhere — spec.md §4.4's removal policy scopes
    /// those two checks to directories; removing an open *file* is the
    /// ordinary Unix "unlinked, vanishes on last close" case and must
    /// succeed. The whole lookup/check/erase sequence runs under
    /// `parent`'s directory lock so a concurrent `open`/`create` of the
    /// same name can't race the decision.
    pub fn remove(self: &Arc<Self>, parent: &Arc<Inode>, name: &str) -> Result<(), KernelError> {
        let _guard = parent.dir_lock.lock().expect("directory lock poisoned");
        let (sector, offset) = dir::lookup_locked(self, parent, name).ok_or(KernelError::NoSuchEntry)?;
        let target = self.open(sector);
        if !target.is_file(self) {
            let non_empty = dir::real_entry_count(self, &target) > 0;
            let open_elsewhere = target.open_cnt() > 1;
            if non_empty || open_elsewhere {
                self.close(target);
                return Err(KernelError::DirectoryNotEmpty);
            }
        }
        dir::remove_entry_locked(self, parent, offset);
        target.mark_removed();
        self.close(target);
        Ok(())
    }

    /// Resolves `path` starting from `root` (absolute) or `cwd` (relative),
    /// one component at a time, per spec.md §4.4.
    pub fn resolve(
        self: &Arc<Self>,
        root: &Arc<Inode>,
        cwd: &Arc<Inode>,
        path: &str,
    ) -> Result<Arc<Inode>, KernelError> {
        if path.is_empty() {
            return Err(KernelError::InvalidName);
        }
        let p = Path::new(path);
        if path.ends_with('/') && !p.is_root() {
            return Err(KernelError::InvalidName);
        }

        let mut owned = if p.is_absolute() {
            root.clone()
        } else {
            cwd.clone()
        };
        owned.bump_open();

        for name in p {
            if owned.is_file(self) {
                self.close(owned);
                return Err(KernelError::NotDirectory);
            }
            match dir::lookup(self, &owned, name) {
                Some((sector, _)) => {
                    let next = self.open(sector);
                    self.close(owned);
                    owned = next;
                }
                None => {
                    self.close(owned);
                    return Err(KernelError::NoSuchEntry);
                }
            }
        }
        Ok(owned)
    }

    /// Flushes all dirty cache entries; if `final_shutdown`, also persists
    /// the free map (the only flush point spec.md promises: `filesys_done`).
    pub fn shutdown(&self, final_shutdown: bool) {
        if final_shutdown {
            self.persist_free_map();
            crate::kprintln!("filesystem shutdown: free map persisted, flushing buffer cache");
        }
        self.bcache.flush(final_shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn fresh(num_sectors: u32) -> Arc<FileSystem> {
        FileSystem::format(Arc::new(MemBlockDevice::new(num_sectors)))
    }

    #[test]
    fn format_creates_an_empty_root_directory() {
        let fs = fresh(256);
        let root = fs.open(ROOT_DIR_SECTOR);
        assert!(!root.is_file(&fs));
        assert_eq!(dir::list(&fs, &root).len(), 0);
        fs.close(root);
    }

    #[test]
    fn create_write_read_round_trips_through_a_path_lookup() {
        let fs = fresh(256);
        let root = fs.open(ROOT_DIR_SECTOR);
        let file = fs.create(&root, "hello.txt", true).expect("create");
        let payload = b"hello, filesystem";
        assert_eq!(file.write_at(&fs, payload, 0), payload.len());
        fs.close(file);

        let found = fs.resolve(&root, &root, "hello.txt").expect("resolve");
        let mut buf = vec![0u8; payload.len()];
        assert_eq!(found.read_at(&fs, &mut buf, 0), payload.len());
        assert_eq!(&buf, payload);
        fs.close(found);
        fs.close(root);
    }

    #[test]
    fn sparse_reads_past_a_hole_are_zero() {
        let fs = fresh(256);
        let root = fs.open(ROOT_DIR_SECTOR);
        let file = fs.create(&root, "sparse", true).expect("create");
        file.write_at(&fs, b"A", 4096);
        let mut buf = [0xFFu8; 16];
        assert_eq!(file.read_at(&fs, &mut buf, 0), 16);
        assert_eq!(&buf, &[0u8; 16]);
        fs.close(file);
        fs.close(root);
    }

    #[test]
    fn create_rejects_a_duplicate_name() {
        let fs = fresh(256);
        let root = fs.open(ROOT_DIR_SECTOR);
        fs.create(&root, "dup", true).unwrap();
        match fs.create(&root, "dup", true) {
            Err(KernelError::FileExists) => {}
            other => panic!("expected FileExists, got {other:?}", other = other.is_ok()),
        }
        fs.close(root);
    }

    #[test]
    fn mkdir_then_resolve_nested_path() {
        let fs = fresh(256);
        let root = fs.open(ROOT_DIR_SECTOR);
        let sub = fs.create(&root, "sub", false).expect("mkdir");
        let leaf = fs.create(&sub, "leaf.txt", true).expect("create leaf");
        leaf.write_at(&fs, b"x", 0);
        fs.close(leaf);
        fs.close(sub);

        let found = fs.resolve(&root, &root, "/sub/leaf.txt").expect("resolve");
        let mut buf = [0u8; 1];
        found.read_at(&fs, &mut buf, 0);
        assert_eq!(&buf, b"x");
        fs.close(found);
        fs.close(root);
    }

    #[test]
    fn remove_fails_on_a_nonempty_directory() {
        let fs = fresh(256);
        let root = fs.open(ROOT_DIR_SECTOR);
        let sub = fs.create(&root, "sub", false).expect("mkdir");
        let leaf = fs.create(&sub, "leaf.txt", true).expect("create leaf");
        fs.close(leaf);
        fs.close(sub);
        match fs.remove(&root, "sub") {
            Err(KernelError::DirectoryNotEmpty) => {}
            other => panic!("expected DirectoryNotEmpty, got {other:?}", other = other.is_ok()),
        }
        fs.close(root);
    }

    #[test]
    fn remove_frees_blocks_once_the_last_handle_closes() {
        let fs = fresh(256);
        let root = fs.open(ROOT_DIR_SECTOR);
        let before = fs.free_map.num_sectors()
            - fs
                .free_map
                .to_bits()
                .iter()
                .filter(|b| !**b)
                .count() as u32;
        let file = fs.create(&root, "doomed", true).expect("create");
        file.write_at(&fs, &[1u8; 5000], 0);
        fs.close(file);
        fs.remove(&root, "doomed").expect("remove");
        let after = fs.free_map.num_sectors()
            - fs
                .free_map
                .to_bits()
                .iter()
                .filter(|b| !**b)
                .count() as u32;
        assert_eq!(before, after);
        fs.close(root);
    }

    #[test]
    fn remove_of_a_still_open_file_succeeds_and_frees_blocks_on_last_close() {
        let fs = fresh(256);
        let root = fs.open(ROOT_DIR_SECTOR);
        let before = fs.free_map.num_sectors()
            - fs
                .free_map
                .to_bits()
                .iter()
                .filter(|b| !**b)
                .count() as u32;
        let file = fs.create(&root, "unlinked.txt", true).expect("create");
        file.write_at(&fs, &[1u8; 5000], 0);

        // The caller's own handle is still open when `remove` runs — this
        // must succeed (the ordinary Unix unlink-an-open-file semantic),
        // not fail with `DirectoryNotEmpty`.
        fs.remove(&root, "unlinked.txt").expect("remove of an open file");
        assert!(dir::lookup(&fs, &root, "unlinked.txt").is_none());

        // Bytes are still readable through the held handle...
        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(&fs, &mut buf, 0), 5);

        // ...and blocks are only released once the last handle closes.
        let mid = fs.free_map.num_sectors()
            - fs
                .free_map
                .to_bits()
                .iter()
                .filter(|b| !**b)
                .count() as u32;
        assert!(mid > before);
        fs.close(file);
        let after = fs.free_map.num_sectors()
            - fs
                .free_map
                .to_bits()
                .iter()
                .filter(|b| !**b)
                .count() as u32;
        assert_eq!(before, after);
        fs.close(root);
    }

    #[test]
    fn path_resolution_rejects_a_component_under_a_file() {
        let fs = fresh(256);
        let root = fs.open(ROOT_DIR_SECTOR);
        let f = fs.create(&root, "plainfile", true).expect("create");
        fs.close(f);
        match fs.resolve(&root, &root, "/plainfile/nested") {
            Err(KernelError::NotDirectory) => {}
            other => panic!("expected NotDirectory, got {other:?}", other = other.is_ok()),
        }
        fs.close(root);
    }

    #[test]
    fn mount_restores_a_formatted_free_map() {
        let device = Arc::new(MemBlockDevice::new(256));
        {
            let fs = FileSystem::format(device.clone());
            let root = fs.open(ROOT_DIR_SECTOR);
            let f = fs.create(&root, "f", true).unwrap();
            fs.close(f);
            fs.close(root);
            fs.shutdown(true);
        }
        let fs = FileSystem::mount(device);
        let root = fs.open(ROOT_DIR_SECTOR);
        assert!(fs.resolve(&root, &root, "/f").is_ok() || dir::list(&fs, &root).contains(&"f".to_string()));
        fs.close(root);
    }

    #[test]
    fn read_ahead_hint_resolves_to_the_right_sector_on_a_miss() {
        let fs = fresh(256);
        let root = fs.open(ROOT_DIR_SECTOR);
        let file = fs.create(&root, "big", true).expect("create");
        file.write_at(&fs, &[7u8; 5000], 0);
        let sector = file.data_sector_for_offset(&fs, 0);
        assert!(sector.is_some());
        fs.close(file);
        fs.close(root);
    }
}
