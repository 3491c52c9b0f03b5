//! Synchronization primitives, named after the teacher's lock vocabulary
//! (`kernel-rs/src/lock/{spinlock,sleeplock}.rs`, `proc/wait_channel.rs`)
//! but backed by `std::sync::{Mutex, Condvar}` — see `SPEC_FULL.md` §0 for
//! why: the teacher's locks ultimately bottom out in the rv6 scheduler's own
//! `sleep`/`wakeup`, which is an external collaborator this crate does not
//! reimplement.
//!
//! `spec.md` draws a real distinction between a short-held metadata lock
//! (BC's per-entry lock, FL's extension/deny-write locks, VM's per-frame
//! lock) and the condition variables layered on top of it (`excl_done`,
//! `no_refs`, `no_writers`). That shape is kept: `Spinlock<T>` is the
//! metadata lock, `WaitChannel` is a condition variable that waits on and
//! re-acquires a `Spinlock`'s guard, exactly like the teacher's
//! `WaitChannel::sleep` takes and returns a lock guard.

use std::sync::{Condvar, Mutex, MutexGuard};

/// A mutual-exclusion lock protecting `T`'s metadata.
///
/// Named `Spinlock` after the teacher's `RawSpinlock`/`Spinlock<T>`; in the
/// hosted build it parks the OS thread instead of busy-waiting, which is the
/// correct substrate once there's a real scheduler underneath doing the
/// parking for you.
pub type Spinlock<T> = Mutex<T>;
pub type SpinlockGuard<'a, T> = MutexGuard<'a, T>;

/// A condition variable associated with one or more `Spinlock`s, matching
/// `proc::WaitChannel`'s sleep/wakeup pair. Every wait re-checks its
/// condition in a loop (spurious-wakeup safe), as `spec.md` §9 requires.
pub struct WaitChannel {
    cv: Condvar,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { cv: Condvar::new() }
    }

    /// Atomically releases `guard`'s lock and sleeps, reacquiring it before
    /// returning. Equivalent to `proc::WaitChannel::sleep`.
    pub fn sleep<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.cv.wait(guard).expect("wait channel poisoned")
    }

    /// Sleeps until `condition` holds, re-checking on every wakeup. This is
    /// the `while (...) sleep()` pattern spec.md §9 requires of every wait
    /// in the core, made impossible to get wrong.
    pub fn sleep_while<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        condition: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        self.cv
            .wait_while(guard, condition)
            .expect("wait channel poisoned")
    }

    /// Wakes exactly one sleeper. Used where spec.md calls for waking a
    /// single queued thread (e.g. the read-ahead worker's own wait, or
    /// `no_refs` waking the one excl_waiter it was reserved for).
    pub fn wakeup_one(&self) {
        self.cv.notify_one();
    }

    /// Wakes every sleeper. `spec.md` §4.1 requires this specifically for
    /// `excl_done`: an EXCL release must wake the *whole* queued reader
    /// batch in one shot, not one at a time, to satisfy the
    /// writer-does-not-starve / readers-not-starved pairing.
    pub fn wakeup_all(&self) {
        self.cv.notify_all();
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}
