//! Console output, in the teacher's idiom (`kernel-rs/src/printf.rs`,
//! `console.rs`): a thin macro pair rather than an external logging crate.
//! The teacher writes to a UART; the hosted build writes to stdout/stderr,
//! which is the nearest equivalent a hosted process has to "the console".

/// Prints an informational line, tagged the way the teacher's `println!`
/// output reads on the serial console.
#[macro_export]
macro_rules! kprintln {
    ($($arg:tt)*) => {
        println!("[rv6-core] {}", format_args!($($arg)*))
    };
}

/// Prints a warning line to stderr — used for conditions spec.md treats as
/// recoverable but noteworthy (e.g. a silently dropped read-ahead hint).
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        eprintln!("[rv6-core][warn] {}", format_args!($($arg)*))
    };
}
