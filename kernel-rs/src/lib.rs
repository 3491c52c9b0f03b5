//! rv6-core: the storage and memory-management core of a small instructional
//! kernel — a buffer cache, a multilevel-index file layer, and a paging VM
//! subsystem.
//!
//! The scheduler, syscall dispatch, and boot glue that would normally host
//! these three subsystems are external collaborators (see `SPEC_FULL.md`)
//! and are not reimplemented here. This crate exposes the three subsystems
//! as a `std`-hosted library so that their concurrency discipline and
//! on-disk layout can be exercised with `cargo test` against a simulated
//! block device and a simulated frame table.

pub mod bcache;
pub mod device;
pub mod error;
pub mod fs;
#[macro_use]
pub mod printer;
pub mod param;
pub mod sync;
pub mod vm;

pub use device::{BlockDevice, FileBlockDevice, MemBlockDevice};
pub use error::KernelError;
