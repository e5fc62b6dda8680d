//! Shared harness for the scenario tests.
#![allow(dead_code)]

use keos_vm::{
    MmStruct, VmConfig,
    addressing::{PAGE_SIZE, Va},
    dev::{BlockDevices, MemDisk},
    mm::UserPool,
    vm::{Vm, frame::FrameId},
};
use std::sync::Arc;

/// Sectors backing one swap slot.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / 512;

/// Installs the test logger once.
pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Boots a vm with `frames` user frames and room for `slots` swapped pages.
pub fn boot(frames: usize, slots: usize) -> Arc<Vm> {
    boot_with(frames, slots, VmConfig::default())
}

/// Same as [`boot`], with a custom configuration.
pub fn boot_with(frames: usize, slots: usize, config: VmConfig) -> Arc<Vm> {
    init_log();
    let mut devices = BlockDevices::new();
    devices.register(config.swap_disk(), MemDisk::new(slots * SECTORS_PER_SLOT));
    Vm::boot(&devices, UserPool::new(frames), config)
}

pub fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

/// The frame backing the page at `addr`, if resident.
pub fn frame(mm: &MmStruct, addr: usize) -> Option<FrameId> {
    mm.page_info(va(addr)).and_then(|info| info.frame)
}

/// Fills the page at `addr` with `byte`, faulting it in if needed.
pub fn fill(mm: &MmStruct, addr: usize, byte: u8) {
    access(mm, addr, true, |b| b.fill(byte));
}

/// Reads one byte at `addr`, faulting the page in if needed.
pub fn peek(mm: &MmStruct, addr: usize) -> u8 {
    access(mm, addr, false, |b| b[0])
}

/// Reads the whole page at `addr`, faulting it in if needed.
pub fn page(mm: &MmStruct, addr: usize) -> Vec<u8> {
    access(mm, addr, false, |b| b.to_vec())
}

// Retries the access until it hits, resolving each fault like the CPU would
// hand it to the kernel. Another thread may evict the page in between.
fn access<R>(mm: &MmStruct, addr: usize, is_write: bool, mut f: impl FnMut(&mut [u8]) -> R) -> R {
    use keos_vm::{addressing::USER_STACK, vm::PageFaultReason};

    loop {
        match mm.with_user_page(va(addr), is_write, &mut f) {
            Ok(r) => return r,
            Err(ec) => mm
                .handle_page_fault(&PageFaultReason::new(ec, va(addr), va(USER_STACK)))
                .unwrap(),
        }
    }
}
