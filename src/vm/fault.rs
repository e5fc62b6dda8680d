//! # Page-Fault Resolver
//!
//! Pages are loaded on demand. When a process touches a page that has no
//! hardware mapping, the CPU raises a page fault and the kernel resolves it
//! here:
//!
//! 1. A fault on a **present** page is a protection violation (e.g. a write
//!    to a read-only page) and is fatal to the process.
//! 2. A fault on a kernel address is fatal.
//! 3. If the supplemental page table has no page for the address, the fault
//!    may still be a legitimate **stack growth**: the address lies within
//!    the stack limit below [`USER_STACK`] and at most a few bytes below the
//!    user stack pointer (instructions such as `push` fault before moving
//!    `rsp`). A fresh anonymous stack page is reserved and claimed. Any other
//!    miss is fatal.
//! 4. A write to a page that is not writable is fatal.
//! 5. Otherwise, the page is claimed: a frame is obtained, filled by the page,
//!    and mapped.
//!
//! Fatal here means the resolver returns an error; the caller terminates the
//! process (see [`Process::page_fault`]).
//!
//! [`Process::page_fault`]: crate::Process::page_fault
use super::{Backing, PageMarker, VmPage, spt::SupplementalPageTable};
use crate::{
    KernelError, MmStruct, VmConfig,
    addressing::{USER_STACK, Va},
    mm::page_table::PFErrorCode,
};
use log::{debug, trace};

/// Represents the reason for a page fault in a virtual memory system.
///
/// This struct is used to capture various details about a page fault,
/// including the faulting address, the type of access that caused the fault
/// (read or write), and the user stack pointer at the time of the fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultReason {
    /// The address that caused the page fault.
    pub fault_addr: Va,

    /// Indicates whether the fault was caused by a write access.
    pub is_write_access: bool,

    /// Indicates whether the page that caused the fault is present in memory.
    ///
    /// A value of `true` means that the page is mapped and the fault is a
    /// protection violation. A value of `false` means the page is not
    /// mapped (e.g. it was never loaded or has been evicted).
    pub is_present: bool,

    /// Indicates whether the access came from user mode.
    pub is_user: bool,

    /// The user stack pointer when the fault occurred.
    pub rsp: Va,
}

impl PageFaultReason {
    /// Probe the cause of page fault into a [`PageFaultReason`].
    ///
    /// This function decodes a hardware-provided [`PFErrorCode`], generated
    /// by the CPU when a page fault occurs, into a structured
    /// [`PageFaultReason`] that the kernel can interpret.
    pub fn new(ec: PFErrorCode, cr2: Va, rsp: Va) -> Self {
        PageFaultReason {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
            is_user: ec.contains(PFErrorCode::USER),
            rsp,
        }
    }

    /// Returns `true` if the fault is due to **demand paging**.
    ///
    /// # Returns
    /// - `true` if this fault was caused by an access to a page without a
    ///   hardware mapping.
    /// - `false` otherwise.
    #[inline]
    pub fn is_demand_paging_fault(&self) -> bool {
        !self.is_present
    }

    /// Returns `true` if the fault can be served by growing the user stack.
    pub fn is_stack_growth(&self, config: &VmConfig) -> bool {
        let addr = self.fault_addr.into_usize();
        let bottom = USER_STACK.saturating_sub(config.stack_limit());
        self.is_demand_paging_fault()
            && (bottom..USER_STACK).contains(&addr)
            && addr
                .checked_add(config.stack_slack())
                .is_some_and(|reach| reach >= self.rsp.into_usize())
    }
}

impl MmStruct {
    /// Handles a page fault of this address space.
    ///
    /// # Returns
    /// - `Ok(())`: The faulting page is now resident; the access can be
    ///   retried.
    /// - `Err(KernelError::InvalidAccess)`: The access violates the page's
    ///   protection.
    /// - `Err(KernelError::BadAddress)`: No page exists at the address and
    ///   the fault is not a stack growth.
    /// - `Err(KernelError)`: The page could not be brought in (e.g. memory
    ///   and swap are both exhausted).
    pub fn handle_page_fault(&self, reason: &PageFaultReason) -> Result<(), KernelError> {
        if reason.is_present {
            return Err(KernelError::InvalidAccess);
        }
        if !reason.fault_addr.is_user() {
            return Err(KernelError::BadAddress);
        }
        let mut spt = self.spt.lock();
        let result = self.resolve_fault(&mut spt, reason);
        spt.unlock();
        result
    }

    fn resolve_fault(
        &self,
        spt: &mut SupplementalPageTable,
        reason: &PageFaultReason,
    ) -> Result<(), KernelError> {
        let addr = reason.fault_addr;
        let page = match spt.find(addr) {
            Some(page) => page,
            None if reason.is_stack_growth(self.vm.config()) => {
                debug!("fault: grow stack to {:?} (rsp {:?})", addr.page_down(), reason.rsp);
                spt.insert(
                    VmPage::new(addr, true, Backing::Anon, None).with_markers(PageMarker::STACK),
                )?
            }
            None => return Err(KernelError::BadAddress),
        };

        let guard = page.lock();
        let writable = guard.writable();
        guard.unlock();
        if reason.is_write_access && !writable {
            return Err(KernelError::InvalidAccess);
        }

        trace!("fault: claim {:?}", addr.page_down());
        let mut ft = self.vm.frame_table().lock();
        let result = self.vm.do_claim(&mut ft, &page, &self.page_table);
        ft.unlock();
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addressing::PAGE_SIZE,
        dev::{BlockDevices, MemDisk},
        mm::UserPool,
        vm::{Vm, VmType},
    };

    fn mm() -> MmStruct {
        let mut devices = BlockDevices::new();
        devices.register(1, MemDisk::new(8 * 4));
        MmStruct::new(&Vm::boot(&devices, UserPool::new(4), VmConfig::default()))
    }

    fn reason(addr: usize, write: bool, rsp: usize) -> PageFaultReason {
        let mut ec = PFErrorCode::USER;
        ec.set(PFErrorCode::WRITE_ACCESS, write);
        PageFaultReason::new(ec, Va::new(addr).unwrap(), Va::new(rsp).unwrap())
    }

    #[test]
    fn stack_growth_bounds() {
        let config = VmConfig::default();
        let rsp = USER_STACK - PAGE_SIZE;
        assert!(reason(rsp - 8, true, rsp).is_stack_growth(&config));
        assert!(reason(rsp + 16, true, rsp).is_stack_growth(&config));
        assert!(!reason(rsp - 9, true, rsp).is_stack_growth(&config));
        assert!(!reason(USER_STACK, true, rsp).is_stack_growth(&config));
        let low = USER_STACK - (1 << 20);
        assert!(reason(low, true, low).is_stack_growth(&config));
        assert!(!reason(low - 1, true, low - 1).is_stack_growth(&config));
    }

    #[test]
    fn present_fault_is_fatal() {
        let mm = mm();
        let mut r = reason(USER_STACK - 8, true, USER_STACK - 8);
        r.is_present = true;
        assert_eq!(mm.handle_page_fault(&r), Err(KernelError::InvalidAccess));
        assert_eq!(mm.page_count(), 0);
    }

    #[test]
    fn grows_stack() {
        let mm = mm();
        let rsp = USER_STACK - 0x20;
        mm.handle_page_fault(&reason(rsp - 4, true, rsp)).unwrap();
        let info = mm.page_info(Va::new(rsp).unwrap()).unwrap();
        assert_eq!(info.vm_type, VmType::Anon);
        assert!(info.markers.contains(PageMarker::STACK));
        assert!(info.frame.is_some());
        assert_eq!(mm.page_count(), 1);

        assert_eq!(
            mm.handle_page_fault(&reason(0x1000, false, rsp)),
            Err(KernelError::BadAddress)
        );
    }

    #[test]
    fn write_to_read_only_page() {
        let mm = mm();
        let va = Va::new(0x4000).unwrap();
        mm.alloc_page(Backing::Anon, va, false).unwrap();
        assert_eq!(
            mm.handle_page_fault(&reason(0x4008, true, USER_STACK)),
            Err(KernelError::InvalidAccess)
        );
        assert!(mm.page_info(va).unwrap().is_uninit);
        mm.handle_page_fault(&reason(0x4008, false, USER_STACK)).unwrap();
        assert!(!mm.page_info(va).unwrap().is_uninit);
    }
}
