//! # Demand-Paged Virtual Memory
//!
//! The [`Vm`] service ties together the pieces shared by every address space:
//! the global [`FrameTable`] that owns all user frames, the [`SwapTable`]
//! that persists evicted anonymous pages, and the system [`VmConfig`]. It is
//! created once by [`Vm::boot`] and handed to each [`MmStruct`] by `Arc`.
//!
//! Per-address-space state lives in the [`MmStruct`]: its page table and its
//! [`SupplementalPageTable`]. The operations on an address space are spread
//! over the submodules by concern:
//!
//! | Module     | Operations                                              |
//! |------------|---------------------------------------------------------|
//! | [`fault`]  | [`MmStruct::handle_page_fault`], stack growth           |
//! | [`file`]   | [`MmStruct::do_mmap`], [`MmStruct::do_munmap`]          |
//! | [`fork`]   | [`MmStruct::copy_spt`], [`MmStruct::fork`]              |
//! | [`loader`] | [`MmStruct::load_segment`], [`MmStruct::setup_stack`]   |
//!
//! ## Claiming a page
//!
//! A page becomes resident through [`Vm::do_claim`]: a frame is acquired
//! (possibly by evicting another page), mapped in the owner's page table,
//! filled by the page's [`VmPage::swap_in`], and linked back to the page in
//! the frame table. If filling fails, the mapping is removed again. The whole sequence runs under the frame table
//! lock, so a frame is never visible to the eviction engine before it holds
//! the page's content.
//!
//! [`MmStruct`]: crate::MmStruct
//! [`MmStruct::handle_page_fault`]: crate::MmStruct::handle_page_fault
//! [`MmStruct::do_mmap`]: crate::MmStruct::do_mmap
//! [`MmStruct::do_munmap`]: crate::MmStruct::do_munmap
//! [`MmStruct::copy_spt`]: crate::MmStruct::copy_spt
//! [`MmStruct::fork`]: crate::MmStruct::fork
//! [`MmStruct::load_segment`]: crate::MmStruct::load_segment
//! [`MmStruct::setup_stack`]: crate::MmStruct::setup_stack
//! [`SupplementalPageTable`]: spt::SupplementalPageTable
pub mod anon;
pub mod fault;
pub mod file;
pub mod fork;
pub mod frame;
pub mod loader;
pub mod page;
pub mod spt;
pub mod swap;
pub mod uninit;

pub use fault::PageFaultReason;
pub use page::{Backing, PageMarker, PageOps, PageState, VmPage, VmType};
pub use uninit::{AnonLoader, FileBackedLoader, MmLoader};

use crate::{
    KernelError, VmConfig,
    dev::BlockDevices,
    mm::{UserPool, page_table::PageTable},
    sync::SpinLock,
};
use alloc::sync::Arc;
use frame::{FrameId, FrameOwner, FrameTable, FrameTableState};
use log::{error, info, warn};
use swap::SwapTable;

/// The virtual memory service shared by all address spaces.
pub struct Vm {
    frame_table: FrameTable,
    swap: SwapTable,
    config: VmConfig,
}

impl Vm {
    /// Sets up the virtual memory service.
    ///
    /// # Parameters
    /// - `devices`: The registered block devices. The swap disk is looked up
    ///   at the slot named by [`VmConfig::swap_disk`].
    /// - `pool`: The pool of user frames.
    /// - `config`: The system configuration.
    ///
    /// # Returns
    /// - `Ok(Arc<Vm>)` on success.
    /// - `Err(KernelError::IOError)`: No swap disk is registered.
    /// - `Err(KernelError::NoSpace)`: The swap disk cannot hold a single page.
    pub fn try_new(
        devices: &BlockDevices,
        pool: UserPool,
        config: VmConfig,
    ) -> Result<Arc<Self>, KernelError> {
        let disk = devices
            .disk(config.swap_disk())
            .ok_or(KernelError::IOError)?;
        let swap = SwapTable::new(disk)?;
        info!(
            "vm: {} swap slots on block device {}, {} user frames",
            swap.capacity(),
            config.swap_disk(),
            pool.capacity()
        );
        Ok(Arc::new(Self {
            frame_table: FrameTable::new(pool),
            swap,
            config,
        }))
    }

    /// Boots the virtual memory service.
    ///
    /// Same as [`Vm::try_new`], but a missing or unusable swap disk is a
    /// fatal configuration error.
    pub fn boot(devices: &BlockDevices, pool: UserPool, config: VmConfig) -> Arc<Self> {
        match Self::try_new(devices, pool, config) {
            Ok(vm) => vm,
            Err(e) => {
                error!("vm: no usable swap disk at slot {}", config.swap_disk());
                panic!("Failed to boot vm: swap disk unavailable ({:?}).", e)
            }
        }
    }

    /// The global frame table.
    pub fn frame_table(&self) -> &FrameTable {
        &self.frame_table
    }

    /// The swap table.
    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// The system configuration.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Makes `page` resident in the address space of `page_table`.
    ///
    /// The caller must hold the frame table lock (`ft`) and must not hold
    /// the page lock.
    ///
    /// # Returns
    /// - `Ok(FrameId)`: The frame now backing the page. If the page was
    ///   already resident, its current frame.
    /// - `Err(KernelError)`: No frame could be obtained or the page content
    ///   could not be loaded. The page stays non-resident and no frame leaks.
    pub(crate) fn do_claim(
        &self,
        ft: &mut FrameTableState,
        page: &Arc<SpinLock<VmPage>>,
        page_table: &Arc<SpinLock<PageTable>>,
    ) -> Result<FrameId, KernelError> {
        let mut guard = page.lock();
        let result = self.claim_locked(ft, page, &mut guard, page_table);
        guard.unlock();
        result
    }

    fn claim_locked(
        &self,
        ft: &mut FrameTableState,
        page: &Arc<SpinLock<VmPage>>,
        vm_page: &mut VmPage,
        page_table: &Arc<SpinLock<PageTable>>,
    ) -> Result<FrameId, KernelError> {
        if let Some(id) = vm_page.frame() {
            return Ok(id);
        }
        let id = ft.get_frame(&self.swap)?;
        let va = vm_page.va();
        let result = ft.pa(id).and_then(|pa| {
            let mut pt = page_table.lock();
            let mapped = pt.map(va, pa, vm_page.permission());
            pt.unlock();
            mapped.map_err(KernelError::from)?;
            let loaded = ft
                .kva_mut(id)
                .and_then(|kva| vm_page.swap_in(kva, &self.swap));
            if loaded.is_err() {
                let mut pt = page_table.lock();
                let _ = pt.unmap(va);
                pt.unlock();
            }
            loaded
        });
        if let Err(e) = result {
            warn!("vm: failed to claim {:?}: {:?}", va, e);
            ft.discard(id);
            return Err(e);
        }
        vm_page.set_frame(Some(id));
        ft.link(
            id,
            FrameOwner {
                page: Arc::downgrade(page),
                page_table: page_table.clone(),
                va,
            },
        );
        Ok(id)
    }

    /// Releases everything `page` holds: its frame, its hardware mapping in
    /// `page_table`, and its swap slot. A dirty file page is written back
    /// first.
    ///
    /// The page must already be unreachable from its supplemental page table.
    /// A failed writeback is logged; the page is released regardless.
    pub fn reclaim_page(&self, page: &Arc<SpinLock<VmPage>>, page_table: &Arc<SpinLock<PageTable>>) {
        let mut ft = self.frame_table.lock();
        let mut guard = page.lock();
        let mut pt = page_table.lock();
        let va = guard.va();
        let result = match guard.frame() {
            Some(id) => {
                let kva = ft.kva(id).ok();
                let result = guard.destroy(kva, &mut pt, &self.swap);
                let _ = pt.unmap(va);
                result
            }
            None => guard.destroy(None, &mut pt, &self.swap),
        };
        pt.unlock();
        ft.release(&mut guard);
        guard.unlock();
        ft.unlock();
        if let Err(e) = result {
            warn!("vm: failed to write back {:?}: {:?}", va, e);
        }
    }
}
