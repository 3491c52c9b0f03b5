//! Caller-visible error codes.
//!
//! `spec.md` §7 splits failures into three categories: fatal panics,
//! caller-visible failures that return a sentinel (`null`/`false`/`-1`/`0`)
//! without killing the process, and failures that terminate the faulting
//! process outright. The sentinel-return category is where callers need to
//! know *which* failure occurred (e.g. `mmap`'s "region overlaps an
//! existing mapping" vs. a bad file descriptor), so this crate carries a
//! small error enum for that one category, grounded in
//! `casys-kaist-KeOS/keos/src/lib.rs`'s `KernelError` (the sibling pack
//! member that already solved this problem for a closely related teaching
//! kernel; the xv6-style teacher just returns bare `Result<T, ()>`/`Option`
//! and leaves the "which error" question to the caller's own bookkeeping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// `open`/path resolution found no such file or directory.
    NoSuchEntry,
    /// `create`/`mkdir` named an entry that already exists.
    FileExists,
    /// A path component was not a directory, or was required to be one.
    NotDirectory,
    /// `remove` on a non-empty directory, or one that is a live cwd / open
    /// elsewhere.
    DirectoryNotEmpty,
    /// A name exceeded `NAME_MAX`, was empty, or a trailing `/` was used on
    /// a non-root path.
    InvalidName,
    /// `read`/`write`/`close` used a bad or closed file handle.
    BadFileDescriptor,
    /// `mmap`'s requested region overlaps an existing mapping.
    MappingOverlap,
    /// The free map does not have enough free sectors to satisfy a request.
    NoSpace,
    /// A write landed on a file with `deny_write_cnt > 0` (caller still
    /// gets a `0`-byte-written result per spec.md §4.3, this variant exists
    /// for callers that want to log *why*).
    WriteDenied,
    /// The underlying block or swap device reported unrecoverable I/O
    /// failure. `spec.md` §7 says this escalates to a panic at the device
    /// layer; this variant is for higher layers that catch it first.
    IoError,
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            KernelError::NoSuchEntry => "no such file or directory",
            KernelError::FileExists => "file exists",
            KernelError::NotDirectory => "not a directory",
            KernelError::DirectoryNotEmpty => "directory not empty",
            KernelError::InvalidName => "invalid name",
            KernelError::BadFileDescriptor => "bad file descriptor",
            KernelError::MappingOverlap => "mapping overlaps an existing mapping",
            KernelError::NoSpace => "no space left on device",
            KernelError::WriteDenied => "write denied: file is deny-write locked",
            KernelError::IoError => "I/O error",
        };
        f.write_str(msg)
    }
}
