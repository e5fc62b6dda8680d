//! # KeOS VM: Demand-Paged Virtual Memory
//!
//! This crate is the virtual memory manager of KeOS. It decides what backs
//! each user virtual page, loads pages lazily on the first access, evicts
//! physical frames when the user pool runs dry, persists evicted anonymous
//! pages to a swap disk, backs memory-mapped files, and duplicates address
//! spaces on `fork`.
//!
//! ## Layout
//!
//! The subsystem is built leaf-first:
//!
//! - [`vm::swap`]: a bitmap-indexed slot allocator over the swap disk.
//! - [`vm::page`]: the page object, polymorphic over the uninitialized,
//!   anonymous, and file-backed variants.
//! - [`vm::frame`]: the global frame table and its FIFO eviction engine.
//! - [`vm::spt`]: the per-address-space supplemental page table.
//! - [`vm::fault`]: the page-fault resolver, including stack growth.
//! - [`vm::file`]: `mmap` and `munmap`.
//! - [`vm::fork`]: address-space duplication.
//!
//! The hardware collaborators that a real kernel would provide are modelled
//! in-crate behind narrow interfaces: [`mm::page_table::PageTable`] plays the
//! MMU, [`mm::UserPool`] is the bounded physical pool, [`dev`] holds the
//! block devices, and [`fs`] exposes regular files.
//!
//! ## Getting Started
//!
//! Boot the VM service once with the registered block devices, then create an
//! address space per process:
//!
//! ```
//! use keos_vm::{
//!     Process, VmConfig,
//!     dev::{BlockDevices, MemDisk},
//!     mm::UserPool,
//!     vm::Vm,
//! };
//!
//! let mut devices = BlockDevices::new();
//! devices.register(1, MemDisk::new(64));
//! let vm = Vm::boot(&devices, UserPool::new(16), VmConfig::default());
//!
//! let mut process = Process::new(&vm).unwrap();
//! let rsp = process.rsp;
//! process.write_user(rsp - 8usize, &[0xAA; 8]).unwrap();
//! ```
//!
//! ## Locking
//!
//! All shared state is protected by [`sync::SpinLock`], which must be
//! released with an explicit [`sync::SpinLockGuard::unlock`]. Locks are
//! always taken in the following order:
//!
//! ```text
//! SPT -> frame table -> page -> page table -> swap / file
//! ```
//!
//! No thread acquires the frame table lock while holding a page lock.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod addressing;
pub mod config;
pub mod dev;
pub mod fs;
pub mod mm;
pub mod mm_struct;
pub mod process;
pub mod sync;
pub mod vm;

pub use config::VmConfig;
pub use mm_struct::MmStruct;
pub use process::Process;

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by the virtual memory
/// subsystem. Each variant corresponds to a specific type of error that might
/// occur during the handling of a memory operation. These errors can be
/// returned to the user program to indicate the nature of the failure.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// IO Error. (EIO)
    IOError,
    /// BAD file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::IOError => -5,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::FileExist => -17,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
            KernelError::NotSupportedOperation => -524,
        }) as usize
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -5 => Ok(Self::IOError),
            -9 => Ok(Self::BadFileDescriptor),
            -12 => Ok(Self::NoMemory),
            -13 => Ok(Self::InvalidAccess),
            -14 => Ok(Self::BadAddress),
            -16 => Ok(Self::Busy),
            -17 => Ok(Self::FileExist),
            -22 => Ok(Self::InvalidArgument),
            -28 => Ok(Self::NoSpace),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { e }),
        }
    }
}
