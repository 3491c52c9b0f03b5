//! The buffer cache. Grounded in `kernel-rs/src/bio.rs`/`buf.rs` for the
//! entry/guard shape and in `examples/original_source/src/filesys/cache.c`
//! for the clock-hand eviction control flow, but the per-entry
//! synchronization state machine below follows spec.md §4.1's SHARE/EXCL/
//! R_AHEAD rules exactly rather than that file's older `write_refs`/
//! `total_refs` scheme (spec.md's own Open Questions flag that scheme as the
//! one NOT to port).
//!
//! The teacher's `Bcache` wraps each entry in a `Sleeplock`, which gives at
//! most one holder at a time; this cache needs genuine concurrent readers,
//! so the per-entry lock here only ever guards a few `u32` counters and a
//! couple of flags, never the sector data itself.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::{BlockDevice, Sector};
use crate::param::{MAX_CLOCK_PASSES, NBUF};
use crate::sync::WaitChannel;

/// The three ways a caller can touch a cached sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Any number of concurrent holders; none may assume exclusivity.
    Share,
    /// At most one holder; excludes every reader and every other writer.
    Excl,
}

struct EntryState {
    allocated: bool,
    sector: Option<u32>,
    dirty: bool,
    accessed: bool,
    shared_refs: u32,
    shared_waiters: u32,
    excl_held: bool,
    excl_waiters: u32,
}

impl EntryState {
    const fn new() -> Self {
        Self {
            allocated: false,
            sector: None,
            dirty: false,
            accessed: false,
            shared_refs: 0,
            shared_waiters: 0,
            excl_held: false,
            excl_waiters: 0,
        }
    }

    /// An entry with nobody currently holding or waiting on it — the only
    /// state eviction is allowed to repurpose.
    fn idle(&self) -> bool {
        self.shared_refs == 0
            && self.shared_waiters == 0
            && !self.excl_held
            && self.excl_waiters == 0
    }
}

struct Entry {
    state: Mutex<EntryState>,
    excl_done: WaitChannel,
    no_refs: WaitChannel,
    // Guarded by the access-mode protocol above, not by `state`: a SHARE
    // holder needs to read or write this without serializing on the entry
    // lock for the whole operation.
    data: std::cell::UnsafeCell<Sector>,
}

// SAFETY: `data` is only ever touched while the caller holds a Share or Excl
// handle, which `get`/`release` issue and retire through `state`. Two Excl
// holders, or a Share and an Excl holder, can never coexist by construction
// of `try_acquire` below.
unsafe impl Sync for Entry {}

impl Entry {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState::new()),
            excl_done: WaitChannel::new(),
            no_refs: WaitChannel::new(),
            data: std::cell::UnsafeCell::new([0u8; crate::param::SECTOR]),
        }
    }
}

/// A live handle on one cached sector. Must be retired with [`release`],
/// mirroring the teacher's `Buf`, whose `Drop` panics rather than let a lock
/// leak silently.
///
/// [`release`]: BufHandle::release
pub struct BufHandle<'a> {
    cache: &'a BufferCache,
    index: usize,
    mode: AccessMode,
    sector: u32,
    released: bool,
}

impl<'a> BufHandle<'a> {
    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn data(&self) -> &Sector {
        // SAFETY: see `unsafe impl Sync for Entry`.
        unsafe { &*self.cache.entries[self.index].data.get() }
    }

    /// Mutable access is available under `Share` too: spec.md §4.3's
    /// extending write deliberately writes new bytes into the cache while
    /// only holding Share, relying on the extension lock upstream to keep
    /// two extending writers from ever targeting the same sector at once.
    #[allow(clippy::mut_from_ref)]
    pub fn data_mut(&self) -> &mut Sector {
        // SAFETY: see `unsafe impl Sync for Entry`.
        unsafe { &mut *self.cache.entries[self.index].data.get() }
    }

    /// Retires the handle. `dirty` marks the sector as needing write-back.
    pub fn release(mut self, dirty: bool) {
        self.cache.release(self.index, self.mode, dirty);
        self.released = true;
    }
}

impl<'a> Drop for BufHandle<'a> {
    fn drop(&mut self) {
        if !self.released {
            panic!("BufHandle dropped without release()");
        }
    }
}

/// A fixed-size set of cached sectors backed by a [`BlockDevice`].
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    entries: Vec<Entry>,
    insert_lock: Mutex<()>,
    clock_hand: Mutex<usize>,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        Self::with_capacity(device, NBUF)
    }

    pub fn with_capacity(device: Arc<dyn BlockDevice>, capacity: usize) -> Arc<Self> {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, Entry::new);
        Arc::new(Self {
            device,
            entries,
            insert_lock: Mutex::new(()),
            clock_hand: Mutex::new(0),
        })
    }

    fn find_allocated(&self, sector: u32) -> Option<usize> {
        self.entries.iter().position(|e| {
            let st = e.state.lock().expect("entry lock poisoned");
            st.allocated && st.sector == Some(sector)
        })
    }

    /// Applies `mode`'s synchronization rule to the entry at `index`,
    /// provided it still holds `sector` (it may have been evicted out from
    /// under a concurrent caller between the scan and this call).
    fn try_acquire(&self, index: usize, sector: u32, mode: AccessMode) -> bool {
        let entry = &self.entries[index];
        let mut st = entry.state.lock().expect("entry lock poisoned");
        loop {
            if st.sector != Some(sector) {
                return false;
            }
            match mode {
                AccessMode::Share => {
                    if st.excl_held || st.excl_waiters > 0 {
                        st.shared_waiters += 1;
                        st = entry.excl_done.sleep(st);
                        st.shared_waiters -= 1;
                        continue;
                    }
                    st.shared_refs += 1;
                    st.accessed = true;
                    return true;
                }
                AccessMode::Excl => {
                    if st.excl_held || st.shared_refs > 0 {
                        st.excl_waiters += 1;
                        st = entry.no_refs.sleep(st);
                        st.excl_waiters -= 1;
                        continue;
                    }
                    st.excl_held = true;
                    st.accessed = true;
                    return true;
                }
            }
        }
    }

    fn release(&self, index: usize, mode: AccessMode, dirty: bool) {
        let entry = &self.entries[index];
        let mut st = entry.state.lock().expect("entry lock poisoned");
        if dirty {
            st.dirty = true;
        }
        match mode {
            AccessMode::Share => {
                st.shared_refs -= 1;
                if st.shared_refs == 0 && st.excl_waiters > 0 {
                    entry.no_refs.wakeup_one();
                }
            }
            AccessMode::Excl => {
                st.excl_held = false;
                if st.shared_waiters > 0 {
                    entry.excl_done.wakeup_all();
                }
                // Also wakes any other excl_waiters queued behind us: the
                // single no_refs signal spec.md §4.1 describes for the
                // SHARE path only covers the refs-reach-zero transition,
                // not the "an exclusive holder just stepped down" one.
                entry.no_refs.wakeup_all();
            }
        }
    }

    /// Brings `sector` into the cache and allocates it to a fresh entry.
    /// Returns the entry index, still holding `insert_lock`'s caller-visible
    /// effect (no other thread can have observed `sector` as allocated
    /// before this returns).
    fn fetch_into_free_entry(&self, sector: u32) -> usize {
        let index = self.reserve_entry();
        let mut buf = [0u8; crate::param::SECTOR];
        self.device.read(sector, &mut buf);
        // SAFETY: this entry has no other holder yet; `reserve_entry` only
        // hands back entries with a clean (idle) state.
        unsafe {
            *self.entries[index].data.get() = buf;
        }
        let mut st = self.entries[index].state.lock().expect("entry lock poisoned");
        st.sector = Some(sector);
        st.dirty = false;
        st.accessed = false;
        index
    }

    /// Finds a free entry, or evicts one via clock second-chance. The
    /// returned entry is `allocated` with `sector == None`, `idle()`, ready
    /// for a fresh load.
    fn reserve_entry(&self) -> usize {
        for (i, e) in self.entries.iter().enumerate() {
            let mut st = e.state.lock().expect("entry lock poisoned");
            if !st.allocated {
                st.allocated = true;
                return i;
            }
        }

        let n = self.entries.len();
        let mut hand = self.clock_hand.lock().expect("clock hand lock poisoned");
        for _pass in 0..MAX_CLOCK_PASSES {
            for _ in 0..n {
                let idx = *hand;
                *hand = (*hand + 1) % n;
                let mut st = self.entries[idx].state.lock().expect("entry lock poisoned");
                if !st.idle() {
                    continue;
                }
                if st.accessed {
                    st.accessed = false;
                    continue;
                }
                if st.dirty {
                    let sector = st.sector.expect("dirty entry has no sector");
                    // SAFETY: idle() guarantees no concurrent access.
                    let data = unsafe { &*self.entries[idx].data.get() };
                    self.device.write(sector, data);
                    st.dirty = false;
                }
                st.sector = None;
                return idx;
            }
        }
        crate::kwarn!("buffer cache eviction failed after {MAX_CLOCK_PASSES} passes: every entry is pinned");
        panic!("buffer cache eviction failed after {MAX_CLOCK_PASSES} passes: every entry is pinned");
    }

    /// Acquires `sector` for `mode`, loading it from the device on a miss.
    pub fn get(&self, sector: u32, mode: AccessMode) -> BufHandle<'_> {
        self.get_tracking(sector, mode).0
    }

    /// Same as [`get`](Self::get), but also reports whether this call
    /// actually pulled `sector` in from the device. The inode layer uses
    /// this to decide whether to enqueue a read-ahead hint (spec.md §4.1:
    /// "enqueue one entry when they bring a block in on a miss").
    pub fn get_tracking(&self, sector: u32, mode: AccessMode) -> (BufHandle<'_>, bool) {
        loop {
            if let Some(idx) = self.find_allocated(sector) {
                if self.try_acquire(idx, sector, mode) {
                    return (
                        BufHandle {
                            cache: self,
                            index: idx,
                            mode,
                            sector,
                            released: false,
                        },
                        false,
                    );
                }
                continue;
            }

            let _insert_guard: MutexGuard<'_, ()> =
                self.insert_lock.lock().expect("insert lock poisoned");
            if let Some(idx) = self.find_allocated(sector) {
                if self.try_acquire(idx, sector, mode) {
                    return (
                        BufHandle {
                            cache: self,
                            index: idx,
                            mode,
                            sector,
                            released: false,
                        },
                        false,
                    );
                }
                continue;
            }
            let idx = self.fetch_into_free_entry(sector);
            let acquired = self.try_acquire(idx, sector, mode);
            debug_assert!(acquired, "freshly loaded entry must not fail to acquire");
            return (
                BufHandle {
                    cache: self,
                    index: idx,
                    mode,
                    sector,
                    released: false,
                },
                true,
            );
        }
    }

    /// Brings `sector` into the cache without affecting its synchronization
    /// state — the R_AHEAD mode of spec.md §4.1. No release is needed or
    /// possible; the fetch either already happened or happens now, and
    /// either way the sector is simply resident afterward.
    pub fn prefetch(&self, sector: u32) {
        if self.find_allocated(sector).is_some() {
            return;
        }
        let _insert_guard = self.insert_lock.lock().expect("insert lock poisoned");
        if self.find_allocated(sector).is_some() {
            return;
        }
        self.fetch_into_free_entry(sector);
    }

    /// Writes back every dirty entry. `final_flush` additionally marks
    /// entries as unallocated once flushed, so a subsequent `get` re-reads
    /// from the device rather than trusting stale in-memory state — used at
    /// shutdown (`spec.md` §4.1's `flush(final)`).
    pub fn flush(&self, final_flush: bool) {
        for entry in &self.entries {
            let mut st = entry.state.lock().expect("entry lock poisoned");
            if !st.allocated || st.sector.is_none() {
                continue;
            }
            if st.dirty {
                let sector = st.sector.unwrap();
                // SAFETY: write-back only inspects entries nobody holds
                // exclusively; a concurrent Share writer racing this flush
                // is the same data race the teacher's own `Bcache` write-back
                // thread accepts (best-effort periodic flush, not a
                // snapshot).
                let data = unsafe { &*entry.data.get() };
                self.device.write(sector, data);
                st.dirty = false;
            }
            if final_flush {
                st.allocated = false;
                st.sector = None;
            }
        }
    }
}

/// Spawns the write-back task described in spec.md §4.1: wakes every
/// `period`, calls `flush(false)`, forever. Returns a handle whose `stop`
/// joins the thread, used by tests and by graceful shutdown.
pub struct WriteBackTask {
    stop: Arc<(Mutex<bool>, std::sync::Condvar)>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl WriteBackTask {
    pub fn spawn(cache: Arc<BufferCache>, period: std::time::Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), std::sync::Condvar::new()));
        let stop_clone = stop.clone();
        let handle = std::thread::spawn(move || {
            let (lock, cv) = &*stop_clone;
            let mut guard = lock.lock().expect("write-back stop lock poisoned");
            loop {
                let (g, timeout) = cv
                    .wait_timeout(guard, period)
                    .expect("write-back stop wait poisoned");
                guard = g;
                if *guard {
                    return;
                }
                if timeout.timed_out() {
                    cache.flush(false);
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        let (lock, cv) = &*self.stop;
        *lock.lock().expect("write-back stop lock poisoned") = true;
        cv.notify_all();
        if let Some(h) = self.handle.take() {
            h.join().expect("write-back thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use std::sync::Barrier;

    fn cache(n_sectors: u32) -> Arc<BufferCache> {
        BufferCache::with_capacity(Arc::new(MemBlockDevice::new(n_sectors)), 4)
    }

    #[test]
    fn share_then_excl_round_trips_through_device() {
        let bc = cache(8);
        let h = bc.get(3, AccessMode::Excl);
        h.data_mut()[0] = 0x42;
        h.release(true);

        bc.flush(true);

        let h = bc.get(3, AccessMode::Share);
        assert_eq!(h.data()[0], 0x42);
        h.release(false);
    }

    #[test]
    fn no_duplicate_loads_for_concurrent_hits() {
        let bc = cache(8);
        // warm one entry
        bc.get(1, AccessMode::Share).release(false);

        let barrier = Arc::new(Barrier::new(4));
        let mut threads = vec![];
        for _ in 0..4 {
            let bc = bc.clone();
            let barrier = barrier.clone();
            threads.push(std::thread::spawn(move || {
                barrier.wait();
                let h = bc.get(1, AccessMode::Share);
                std::thread::yield_now();
                h.release(false);
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn excl_excludes_concurrent_share() {
        let bc = cache(8);
        let order = Arc::new(Mutex::new(vec![]));

        let h = bc.get(2, AccessMode::Excl);
        let bc2 = bc.clone();
        let order2 = order.clone();
        let reader = std::thread::spawn(move || {
            let h = bc2.get(2, AccessMode::Share);
            order2.lock().unwrap().push("read");
            h.release(false);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        order.lock().unwrap().push("write");
        h.release(true);
        reader.join().unwrap();

        let seen = order.lock().unwrap();
        assert_eq!(*seen, vec!["write", "read"]);
    }

    #[test]
    fn writer_does_not_starve_between_readers() {
        let bc = cache(8);
        let h1 = bc.get(5, AccessMode::Share);

        let bc2 = bc.clone();
        let writer = std::thread::spawn(move || {
            let h = bc2.get(5, AccessMode::Excl);
            h.release(true);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        // A second reader queued after the writer must wait behind it.
        let bc3 = bc.clone();
        let order = Arc::new(Mutex::new(vec![]));
        let order2 = order.clone();
        let reader2 = std::thread::spawn(move || {
            let h = bc3.get(5, AccessMode::Share);
            order2.lock().unwrap().push("reader2");
            h.release(false);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        h1.release(false);
        writer.join().unwrap();
        reader2.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["reader2"]);
    }

    #[test]
    fn eviction_reuses_idle_entries_without_losing_dirty_data() {
        let bc = cache(8);
        for s in 0..6u32 {
            let h = bc.get(s, AccessMode::Excl);
            h.data_mut()[0] = s as u8 + 1;
            h.release(true);
        }
        // capacity is 4; sectors 0 and 1 should have been evicted and
        // written back by now.
        let h = bc.get(0, AccessMode::Share);
        assert_eq!(h.data()[0], 1);
        h.release(false);
    }

    #[test]
    fn prefetch_is_idempotent_and_untracked() {
        let bc = cache(4);
        bc.prefetch(2);
        bc.prefetch(2);
        let h = bc.get(2, AccessMode::Share);
        h.release(false);
    }

    #[test]
    #[should_panic(expected = "dropped without release")]
    fn handle_must_be_released() {
        let bc = cache(4);
        let h = bc.get(0, AccessMode::Share);
        drop(h);
    }
}
