//! Address-space duplication for `fork`.
//!
//! The child receives a copy of every page of the parent:
//!
//! - A page the parent never touched stays lazy in the child and shares the
//!   parent's loader.
//! - A page holding data (resident, or anonymous and swapped out) is copied
//!   into a fresh frame of the child, so the two processes never observe each
//!   other's writes.
//! - A file page that is not resident becomes a lazy file page of the child
//!   and re-reads its range on first access.
//!
//! The copy is all-or-nothing: on failure, every page already inserted into
//! the child is destroyed again.
use super::{PageState, frame::FrameTableState, page::VmPage, spt::SupplementalPageTable};
use crate::{
    KernelError, MmStruct,
    addressing::PAGE_SIZE,
    sync::SpinLock,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use log::{debug, warn};

impl MmStruct {
    /// Copies every page of `src` into `dst`.
    ///
    /// Both address spaces must be served by the same [`Vm`].
    ///
    /// # Returns
    /// - `Ok(())` on success.
    /// - `Err(KernelError::InvalidArgument)`: `src` and `dst` belong to
    ///   different VM services.
    /// - `Err(KernelError)`: A page could not be copied. Every page inserted
    ///   into `dst` by this call has been destroyed; `src` is unchanged.
    ///
    /// [`Vm`]: super::Vm
    pub fn copy_spt(dst: &MmStruct, src: &MmStruct) -> Result<(), KernelError> {
        if !Arc::ptr_eq(&dst.vm, &src.vm) {
            return Err(KernelError::InvalidArgument);
        }
        let src_spt = src.spt.lock();
        let mut dst_spt = dst.spt.lock();
        let mut copied = Vec::new();
        let mut result = Ok(());
        for (va, page) in src_spt.iter() {
            result = dst.copy_page(&mut dst_spt, src, page);
            if result.is_err() {
                break;
            }
            copied.push(*va);
        }
        if let Err(e) = result {
            warn!("fork: copy failed after {} pages: {:?}", copied.len(), e);
            for va in copied {
                if let Some(page) = dst_spt.remove(va) {
                    dst.vm.reclaim_page(&page, &dst.page_table);
                }
            }
        } else {
            debug!("fork: copied {} pages", copied.len());
        }
        dst_spt.unlock();
        src_spt.unlock();
        result
    }

    /// Creates a child address space holding a copy of this one.
    pub fn fork(&self) -> Result<MmStruct, KernelError> {
        let child = MmStruct::new(&self.vm);
        MmStruct::copy_spt(&child, self)?;
        Ok(child)
    }

    // Copies one page of `src` into `dst_spt`, which belongs to `self`. A
    // resident copy keeps the dirty bit of the original mapping.
    fn copy_page(
        &self,
        dst_spt: &mut SupplementalPageTable,
        src: &MmStruct,
        page: &Arc<SpinLock<VmPage>>,
    ) -> Result<(), KernelError> {
        let mut ft = self.vm.frame_table().lock();
        let guard = page.lock();
        let va = guard.va();
        let snapshot = self.snapshot(&ft, &guard);
        let dirty = guard.frame().is_some() && {
            let pt = src.page_table.lock();
            let dirty = pt.is_dirty(va);
            pt.unlock();
            dirty
        };
        let copy = guard.duplicate();
        guard.unlock();

        let mut inserted = None;
        let result = snapshot.and_then(|snapshot| {
            let child = dst_spt.insert(copy)?;
            inserted = Some(child.clone());
            if let Some(snapshot) = snapshot {
                let id = self.vm.do_claim(&mut ft, &child, &self.page_table)?;
                ft.kva_mut(id)?.copy_from_slice(&snapshot[..]);
                if dirty {
                    let mut pt = self.page_table.lock();
                    let marked = pt.set_dirty(va, true);
                    pt.unlock();
                    marked?;
                }
            }
            Ok(())
        });
        ft.unlock();
        if let (Err(_), Some(child)) = (&result, inserted) {
            dst_spt.remove(va);
            self.vm.reclaim_page(&child, &self.page_table);
        }
        result
    }

    // The current content of a page that holds data, if any.
    fn snapshot(
        &self,
        ft: &FrameTableState,
        page: &VmPage,
    ) -> Result<Option<Box<[u8; PAGE_SIZE]>>, KernelError> {
        if let Some(id) = page.frame() {
            return Ok(Some(Box::new(*ft.kva(id)?)));
        }
        match page.state() {
            PageState::Anon(anon) => match anon.slot() {
                Some(slot) => {
                    let mut buf = Box::new([0; PAGE_SIZE]);
                    self.vm.swap().read(slot, &mut buf)?;
                    Ok(Some(buf))
                }
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        MmStruct, VmConfig,
        addressing::Va,
        dev::{BlockDevices, MemDisk},
        mm::UserPool,
        vm::{Backing, Vm},
    };

    fn mm(frames: usize) -> MmStruct {
        let mut devices = BlockDevices::new();
        devices.register(1, MemDisk::new(8 * 4));
        MmStruct::new(&Vm::boot(&devices, UserPool::new(frames), VmConfig::default()))
    }

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn lazy_pages_stay_lazy() {
        let parent = mm(4);
        parent.alloc_page(Backing::Anon, va(0x4000), true).unwrap();
        let child = parent.fork().unwrap();
        let info = child.page_info(va(0x4000)).unwrap();
        assert!(info.is_uninit);
        assert_eq!(info.frame, None);
        assert_eq!(parent.vm().frame_table().in_use(), 0);
    }

    #[test]
    fn resident_pages_get_own_frame() {
        let parent = mm(4);
        parent.alloc_page(Backing::Anon, va(0x4000), false).unwrap();
        parent.claim_page(va(0x4000)).unwrap();
        parent.with_user_page(va(0x4000), false, |_| ()).unwrap();

        let child = parent.fork().unwrap();
        let p = parent.page_info(va(0x4000)).unwrap();
        let c = child.page_info(va(0x4000)).unwrap();
        assert!(c.frame.is_some());
        assert_ne!(p.frame, c.frame);
        assert!(!c.writable);
        assert_eq!(parent.vm().frame_table().in_use(), 2);
    }

    #[test]
    fn different_vm_rejected() {
        let a = mm(1);
        let b = mm(1);
        assert_eq!(
            MmStruct::copy_spt(&a, &b),
            Err(crate::KernelError::InvalidArgument)
        );
    }
}
