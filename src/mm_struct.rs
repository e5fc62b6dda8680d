//! # Memory State of a process
//!
//! The state of a process's memory is represented by the [`MmStruct`]
//! structure, similar to the Linux kernel's `struct mm_struct`. Each process
//! owns one [`MmStruct`], which holds:
//!
//! - **Page Table**: the hardware mappings of the resident pages. It is shared
//!   (by `Arc`) with the frame table, which must remove a mapping when it
//!   evicts one of this process's pages.
//! - **Supplemental Page Table**: every page the process has reserved,
//!   resident or not, together with the knowledge of how to materialize it.
//!
//! Pages are reserved lazily. [`MmStruct::alloc_page_with_initializer`] only
//! records an uninitialized page; the frame is obtained on the first fault
//! (see [`MmStruct::handle_page_fault`]) or on an explicit
//! [`MmStruct::claim_page`].
//!
//! ### Validating User Input
//!
//! **The kernel must never crash due to user input.** System calls that take
//! user buffers validate them with [`MmStruct::access_ok`] before touching
//! them.
//!
//! [`MmStruct::handle_page_fault`]: crate::MmStruct::handle_page_fault
use crate::{
    KernelError,
    addressing::{KERNEL_BASE, PAGE_SIZE, Va},
    mm::page_table::{PFErrorCode, PageTable},
    sync::SpinLock,
    vm::{
        Backing, MmLoader, PageMarker, Vm, VmPage, VmType, frame::FrameId,
        spt::SupplementalPageTable,
    },
};
use alloc::sync::Arc;
use core::ops::Range;

/// A snapshot of one page of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// The type of the page, looking through uninitialized pages.
    pub vm_type: VmType,
    /// Whether the page has never been faulted in.
    pub is_uninit: bool,
    /// Whether user code may write to the page.
    pub writable: bool,
    /// The markers attached to the page.
    pub markers: PageMarker,
    /// The frame backing the page, if it is resident.
    pub frame: Option<FrameId>,
}

/// The [`MmStruct`] represents the memory state for a specific process.
///
/// Dropping an [`MmStruct`] destroys the address space: dirty file pages are
/// written back, swap slots are freed, and frames return to the pool.
pub struct MmStruct {
    pub(crate) vm: Arc<Vm>,
    pub(crate) page_table: Arc<SpinLock<PageTable>>,
    pub(crate) spt: SpinLock<SupplementalPageTable>,
}

impl MmStruct {
    /// Creates an empty address space served by `vm`.
    pub fn new(vm: &Arc<Vm>) -> Self {
        Self {
            vm: vm.clone(),
            page_table: Arc::new(SpinLock::new(PageTable::new())),
            spt: SpinLock::new(SupplementalPageTable::new()),
        }
    }

    /// The virtual memory service of this address space.
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// The page table of this address space.
    pub fn page_table(&self) -> &Arc<SpinLock<PageTable>> {
        &self.page_table
    }

    /// Reserves an uninitialized page at `va`.
    ///
    /// # Parameters
    /// - `backing`: What the page becomes on its first fault.
    /// - `va`: The page-aligned user address of the page.
    /// - `writable`: Whether user code may write to the page.
    /// - `loader`: Fills the first frame of the page. `None` leaves the frame
    ///   zero-filled.
    ///
    /// # Returns
    /// - `Ok(())` on success.
    /// - `Err(KernelError::InvalidArgument)`: `va` is not a page-aligned user
    ///   address.
    /// - `Err(KernelError::FileExist)`: A page already exists at `va`.
    pub fn alloc_page_with_initializer(
        &self,
        backing: Backing,
        va: Va,
        writable: bool,
        loader: Option<Arc<dyn MmLoader>>,
    ) -> Result<(), KernelError> {
        if !va.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        self.insert_page(VmPage::new(va, writable, backing, loader))
    }

    /// Reserves an uninitialized page at `va` without a loader.
    pub fn alloc_page(&self, backing: Backing, va: Va, writable: bool) -> Result<(), KernelError> {
        self.alloc_page_with_initializer(backing, va, writable, None)
    }

    // `page` is already keyed by its page-aligned address.
    pub(crate) fn insert_page(&self, page: VmPage) -> Result<(), KernelError> {
        if !page.va().is_user() {
            return Err(KernelError::InvalidArgument);
        }
        let mut spt = self.spt.lock();
        let result = spt.insert(page).map(|_| ());
        spt.unlock();
        result
    }

    /// Makes the page at `va` resident immediately.
    ///
    /// # Returns
    /// - `Ok(())` on success, or if the page already is resident.
    /// - `Err(KernelError::BadAddress)`: No page is reserved at `va`.
    /// - `Err(KernelError)`: No frame could be obtained or the page could not
    ///   be loaded.
    pub fn claim_page(&self, va: Va) -> Result<(), KernelError> {
        let spt = self.spt.lock();
        let page = spt.find(va);
        let result = match page {
            Some(page) => {
                let mut ft = self.vm.frame_table().lock();
                let result = self.vm.do_claim(&mut ft, &page, &self.page_table);
                ft.unlock();
                result.map(|_| ())
            }
            None => Err(KernelError::BadAddress),
        };
        spt.unlock();
        result
    }

    /// Destroys every page of the address space.
    ///
    /// The address space stays usable and is empty afterwards.
    pub fn kill(&self) {
        let mut spt = self.spt.lock();
        spt.kill(&self.vm, &self.page_table);
        spt.unlock();
    }

    /// Checks whether a given memory range is accessible by the process.
    ///
    /// Every page overlapping `addr` must be reserved, and must be writable
    /// if `is_write` is set. Nothing is faulted in.
    ///
    /// # Returns
    /// - `true` if the memory range is valid.
    /// - `false` if the memory range is invalid or inaccessible.
    pub fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        if addr.start > addr.end || !addr.start.is_user() || addr.end.into_usize() > KERNEL_BASE {
            return false;
        }
        let spt = self.spt.lock();
        let mut va = addr.start.page_down();
        let mut ok = true;
        while ok && va < addr.end {
            ok = match spt.find(va) {
                Some(page) => {
                    let guard = page.lock();
                    let writable = guard.writable();
                    guard.unlock();
                    writable || !is_write
                }
                None => false,
            };
            va += PAGE_SIZE;
        }
        spt.unlock();
        ok
    }

    /// A snapshot of the page containing `va`.
    pub fn page_info(&self, va: Va) -> Option<PageInfo> {
        let spt = self.spt.lock();
        let page = spt.find(va);
        spt.unlock();
        let page = page?;
        let guard = page.lock();
        let info = PageInfo {
            vm_type: guard.vm_type(),
            is_uninit: guard.is_uninit(),
            writable: guard.writable(),
            markers: guard.markers(),
            frame: guard.frame(),
        };
        guard.unlock();
        Some(info)
    }

    /// The number of pages reserved in the address space.
    pub fn page_count(&self) -> usize {
        let spt = self.spt.lock();
        let n = spt.len();
        spt.unlock();
        n
    }

    /// Runs `f` on the bytes of the resident page backing `va`, starting at
    /// `va`, the way the CPU would access them.
    ///
    /// The access goes through the page table, so it sets the accessed bit,
    /// and the dirty bit if `is_write` is set.
    ///
    /// # Returns
    /// - `Ok(R)`: The result of `f`.
    /// - `Err(PFErrorCode)`: The access faults with this error code.
    pub fn with_user_page<R>(
        &self,
        va: Va,
        is_write: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, PFErrorCode> {
        let mut ft = self.vm.frame_table().lock();
        let mut pt = self.page_table.lock();
        let pa = pt.translate(va, is_write, true);
        pt.unlock();
        let result = pa.and_then(|pa| {
            let id = ft.frame_of(pa).ok_or(PFErrorCode::PRESENT | PFErrorCode::USER)?;
            let kva = ft
                .kva_mut(id)
                .map_err(|_| PFErrorCode::PRESENT | PFErrorCode::USER)?;
            Ok(f(&mut kva[va.offset()..]))
        });
        ft.unlock();
        result
    }
}

impl Drop for MmStruct {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        VmConfig,
        dev::{BlockDevices, MemDisk},
        mm::UserPool,
    };

    fn mm() -> MmStruct {
        let mut devices = BlockDevices::new();
        devices.register(1, MemDisk::new(8 * 4));
        MmStruct::new(&Vm::boot(&devices, UserPool::new(4), VmConfig::default()))
    }

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn alloc_rejects_bad_addresses() {
        let mm = mm();
        assert_eq!(mm.alloc_page(Backing::Anon, va(0), true), Err(KernelError::InvalidArgument));
        assert_eq!(mm.alloc_page(Backing::Anon, va(0x4010), true), Err(KernelError::InvalidArgument));
        assert_eq!(
            mm.alloc_page_with_initializer(Backing::Anon, va(0x4ff8), true, None),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(mm.page_count(), 0);
        assert_eq!(
            mm.alloc_page(Backing::Anon, va(KERNEL_BASE), true),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(mm.alloc_page(Backing::Anon, va(0x4000), true), Ok(()));
        assert_eq!(mm.alloc_page(Backing::Anon, va(0x4000), false), Err(KernelError::FileExist));
        assert_eq!(mm.page_count(), 1);
    }

    #[test]
    fn claim_materializes() {
        let mm = mm();
        assert_eq!(mm.claim_page(va(0x4000)), Err(KernelError::BadAddress));
        mm.alloc_page(Backing::Anon, va(0x4000), true).unwrap();
        assert!(mm.page_info(va(0x4000)).unwrap().is_uninit);

        mm.claim_page(va(0x4000)).unwrap();
        let info = mm.page_info(va(0x4123)).unwrap();
        assert!(!info.is_uninit);
        assert_eq!(info.vm_type, VmType::Anon);
        assert!(info.frame.is_some());

        assert_eq!(mm.with_user_page(va(0x4010), true, |b| b[0] = 3), Ok(()));
        assert_eq!(mm.with_user_page(va(0x4010), false, |b| b[0]), Ok(3));
        let pt = mm.page_table().lock();
        let dirty = pt.is_dirty(va(0x4000));
        pt.unlock();
        assert!(dirty);
    }

    #[test]
    fn access_ok_checks_every_page() {
        let mm = mm();
        mm.alloc_page(Backing::Anon, va(0x4000), true).unwrap();
        mm.alloc_page(Backing::Anon, va(0x5000), false).unwrap();
        assert!(mm.access_ok(va(0x4010)..va(0x5010), false));
        assert!(!mm.access_ok(va(0x4010)..va(0x5010), true));
        assert!(mm.access_ok(va(0x4010)..va(0x4020), true));
        assert!(!mm.access_ok(va(0x5ff0)..va(0x6010), false));
        assert!(!mm.access_ok(va(0)..va(0x10), false));
    }

    #[test]
    fn kill_releases_frames() {
        let mm = mm();
        for i in 1..=3 {
            mm.alloc_page(Backing::Anon, va(i * PAGE_SIZE), true).unwrap();
            mm.claim_page(va(i * PAGE_SIZE)).unwrap();
        }
        assert_eq!(mm.vm().frame_table().in_use(), 3);
        mm.kill();
        assert_eq!(mm.page_count(), 0);
        assert_eq!(mm.vm().frame_table().in_use(), 0);
        let pt = mm.page_table().lock();
        let empty = pt.is_empty();
        pt.unlock();
        assert!(empty);
    }
}
