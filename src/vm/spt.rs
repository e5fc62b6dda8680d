//! Supplemental page table.
//!
//! The page table only knows about resident pages. The supplemental page
//! table (SPT) records every page an address space has reserved, resident or
//! not, keyed by its page-aligned virtual address. The fault handler consults
//! it to decide how to materialize a missing page, and the teardown path walks
//! it to release everything the address space owns.
use super::{Vm, page::VmPage};
use crate::{
    KernelError,
    addressing::Va,
    mm::page_table::PageTable,
    sync::SpinLock,
};
use alloc::{collections::BTreeMap, sync::Arc};

/// The per-address-space map from page addresses to pages.
#[derive(Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<Va, Arc<SpinLock<VmPage>>>,
}

impl SupplementalPageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the page containing `va`.
    pub fn find(&self, va: Va) -> Option<Arc<SpinLock<VmPage>>> {
        self.pages.get(&va.page_down()).cloned()
    }

    /// Inserts `page`.
    ///
    /// # Returns
    /// - `Ok(page)`: The shared handle to the inserted page.
    /// - `Err(KernelError::FileExist)`: A page already exists at the same
    ///   address. The table is unchanged.
    pub fn insert(&mut self, page: VmPage) -> Result<Arc<SpinLock<VmPage>>, KernelError> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(KernelError::FileExist);
        }
        let page = Arc::new(SpinLock::new(page));
        self.pages.insert(va, page.clone());
        Ok(page)
    }

    /// Removes the page containing `va` from the table and returns it.
    ///
    /// The page's resources are not released; see [`Vm::reclaim_page`].
    pub fn remove(&mut self, va: Va) -> Option<Arc<SpinLock<VmPage>>> {
        self.pages.remove(&va.page_down())
    }

    /// Iterates over the pages in address order.
    pub fn iter(&self) -> impl Iterator<Item = (&Va, &Arc<SpinLock<VmPage>>)> {
        self.pages.iter()
    }

    /// The number of pages in the table.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if the table holds no page.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Destroys every page of the table.
    ///
    /// Each page is written back or has its swap slot freed as its variant
    /// requires, loses its hardware mapping, and returns its frame to the
    /// pool. The table is empty afterwards.
    pub fn kill(&mut self, vm: &Vm, page_table: &Arc<SpinLock<PageTable>>) {
        while let Some((_, page)) = self.pages.pop_first() {
            vm.reclaim_page(&page, page_table);
        }
    }
}
