//! The page-fault handler, spec.md §4.9: given a faulting address and the
//! pre-fault stack pointer, decide whether to lazily load an SPT-backed
//! page, grow the stack, or terminate the process.

use std::sync::Arc;

use crate::fs::FileSystem;
use crate::param::{PAGE, PHYS_BASE, STACK_GROWTH_GUARD_BYTES, STACK_SIZE_LIMIT};

use super::swap::SwapStore;
use super::frame::FrameTable;
use super::AddressSpace;

/// Why the fault could not be resolved; the caller terminates the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved,
    Terminate,
}

/// Entry point for the CPU exception path. `in_a_syscall` controls whether
/// the freshly loaded frame stays pinned (a syscall is about to touch the
/// buffer directly and must not have it evicted mid-copy).
pub fn handle_page_fault(
    space: &Arc<AddressSpace>,
    frames: &FrameTable,
    swap: &SwapStore,
    fs: &FileSystem,
    fault_addr: usize,
    in_a_syscall: bool,
) -> FaultOutcome {
    let page = fault_addr & !(PAGE - 1);

    if fault_addr >= PHYS_BASE {
        return FaultOutcome::Terminate;
    }

    if space.has_spte(page) {
        return match space.spt_load(frames, swap, fs, page, in_a_syscall) {
            Ok(()) => FaultOutcome::Resolved,
            Err(_) => FaultOutcome::Terminate,
        };
    }

    let stack_pointer = *space.stack_pointer.lock().expect("stack pointer lock poisoned");
    let is_stack_access = fault_addr + STACK_GROWTH_GUARD_BYTES >= stack_pointer;
    let within_limit = fault_addr >= PHYS_BASE.saturating_sub(STACK_SIZE_LIMIT);

    if is_stack_access && within_limit {
        space.add_stack_page(page, frames, fs, swap);
        FaultOutcome::Resolved
    } else {
        FaultOutcome::Terminate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::fs::FileSystem;
    use crate::param::SECTORS_PER_PAGE;

    fn harness() -> (Arc<FileSystem>, FrameTable, SwapStore, Arc<AddressSpace>) {
        let fs = FileSystem::format(Arc::new(MemBlockDevice::new(256)));
        let frames = FrameTable::new(4);
        let swap = SwapStore::new(Arc::new(MemBlockDevice::new(16 * SECTORS_PER_PAGE as u32)));
        let space = AddressSpace::new(PHYS_BASE - 16);
        (fs, frames, swap, space)
    }

    #[test]
    fn kernel_address_from_user_mode_terminates() {
        let (fs, frames, swap, space) = harness();
        let outcome = handle_page_fault(&space, &frames, &swap, &fs, PHYS_BASE, false);
        assert_eq!(outcome, FaultOutcome::Terminate);
    }

    #[test]
    fn small_gap_below_stack_pointer_grows_the_stack() {
        let (fs, frames, swap, space) = harness();
        let sp = PHYS_BASE - 16;
        let fault_addr = sp - 31;
        let outcome = handle_page_fault(&space, &frames, &swap, &fs, fault_addr, false);
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(space.is_present(fault_addr & !(PAGE - 1)));
    }

    #[test]
    fn large_gap_below_stack_pointer_terminates() {
        let (fs, frames, swap, space) = harness();
        let sp = PHYS_BASE - 16;
        let fault_addr = sp - 33 - PAGE;
        let outcome = handle_page_fault(&space, &frames, &swap, &fs, fault_addr, false);
        assert_eq!(outcome, FaultOutcome::Terminate);
    }

    #[test]
    fn stack_growth_is_capped_at_one_mebibyte() {
        let (fs, frames, swap, space) = harness();
        *space.stack_pointer.lock().unwrap() = PHYS_BASE - STACK_SIZE_LIMIT;
        let fault_addr = PHYS_BASE - STACK_SIZE_LIMIT - 2 * PAGE;
        let outcome = handle_page_fault(&space, &frames, &swap, &fs, fault_addr, false);
        assert_eq!(outcome, FaultOutcome::Terminate);
    }

    #[test]
    fn unmapped_non_stack_address_terminates() {
        let (fs, frames, swap, space) = harness();
        let outcome = handle_page_fault(&space, &frames, &swap, &fs, 0x1000, false);
        assert_eq!(outcome, FaultOutcome::Terminate);
    }
}
