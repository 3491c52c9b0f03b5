//! Compile-time configuration, in the teacher's idiom (`kernel-rs/src/param.rs`):
//! a flat module of `const`s rather than a runtime config layer.

/// Bytes per disk sector.
pub const SECTOR: usize = 512;

/// Bytes per virtual-memory page.
pub const PAGE: usize = 4096;

/// Pages are `SECTORS_PER_PAGE` sectors.
pub const SECTORS_PER_PAGE: usize = PAGE / SECTOR;

/// Sector 0 is reserved as "no block" — used as the sparse-pointer sentinel
/// and never allocated to a real file.
pub const NO_BLOCK: u32 = 0;

/// Sector 0: the free-map file's inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector 1: the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Number of direct block pointers in an on-disk inode.
pub const NUM_DIRECT_POINTERS: usize = 122;

/// Logical index of the singly-indirect pointer in an on-disk inode.
pub const SINGLE_INDIRECT_INDEX: usize = NUM_DIRECT_POINTERS;

/// Logical index of the doubly-indirect pointer in an on-disk inode.
pub const DOUBLE_INDIRECT_INDEX: usize = NUM_DIRECT_POINTERS + 1;

/// Total block pointers stored directly in an on-disk inode.
pub const NUM_BLOCK_POINTERS: usize = NUM_DIRECT_POINTERS + 2;

/// Sector-id pointers that fit in one indirect block.
pub const POINTERS_PER_BLOCK: usize = SECTOR / core::mem::size_of::<u32>();

/// Largest byte offset (exclusive) any file may reach.
pub const MAX_FILE_BYTES: usize =
    (NUM_DIRECT_POINTERS + POINTERS_PER_BLOCK + POINTERS_PER_BLOCK * POINTERS_PER_BLOCK) * SECTOR;

/// Maximum bytes in a directory entry name (excluding the terminator).
pub const NAME_MAX: usize = 14;

/// Number of entries in the buffer cache.
pub const NBUF: usize = 64;

/// Clock eviction is bounded to two full passes of the cache before panicking.
pub const MAX_CLOCK_PASSES: usize = 2;

/// Nominal write-back interval for the background flush task.
pub const WRITE_BACK_PERIOD_MS: u64 = 30_000;

/// Guard window below the user stack pointer that still counts as a stack
/// access (permits `push`/`pusha`-style pre-decrement instructions).
pub const STACK_GROWTH_GUARD_BYTES: usize = 32;

/// Hard upper bound on how far a process's stack may grow.
pub const STACK_SIZE_LIMIT: usize = 1024 * 1024;

/// Top of a user address space; the stack grows down from here. Addresses
/// at or above this line belong to the kernel.
pub const PHYS_BASE: usize = 0xC000_0000;

/// Default size of the simulated frame table (the user memory pool), in
/// frames.
pub const NUM_USER_FRAMES: usize = 32;

static_assertions::const_assert_eq!(SECTOR, 512);
static_assertions::const_assert_eq!(PAGE, 4096);
static_assertions::const_assert_eq!(NUM_BLOCK_POINTERS, 124);
static_assertions::const_assert_eq!(POINTERS_PER_BLOCK, 128);
