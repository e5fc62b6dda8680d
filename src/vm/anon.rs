//! Anonymous pages.
//!
//! An anonymous page has no backing file. While resident its content lives
//! only in its frame; once evicted, it lives in a swap slot until the next
//! fault brings it back.
use super::{PageOps, VmType, swap::{SwapSlot, SwapTable}};
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    mm::page_table::PageTable,
};

/// The payload of an anonymous page.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnonPage {
    slot: Option<SwapSlot>,
}

impl AnonPage {
    /// Creates a page that has never been swapped out.
    pub fn new() -> Self {
        Self::default()
    }

    /// The swap slot holding this page's content, if it is swapped out.
    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }
}

impl PageOps for AnonPage {
    fn vm_type(&self) -> VmType {
        VmType::Anon
    }

    fn swap_in(
        &mut self,
        _va: Va,
        kva: &mut [u8; PAGE_SIZE],
        swap: &SwapTable,
    ) -> Result<(), KernelError> {
        if let Some(slot) = self.slot {
            swap.swap_in(slot, kva)?;
            self.slot = None;
        }
        Ok(())
    }

    fn swap_out(
        &mut self,
        va: Va,
        kva: &[u8; PAGE_SIZE],
        page_table: &mut PageTable,
        swap: &SwapTable,
    ) -> Result<(), KernelError> {
        page_table.walk(va)?;
        let slot = swap.swap_out(kva)?;
        page_table.unmap(va)?;
        self.slot = Some(slot);
        Ok(())
    }

    fn destroy(
        &mut self,
        _va: Va,
        _kva: Option<&[u8; PAGE_SIZE]>,
        _page_table: &mut PageTable,
        swap: &SwapTable,
    ) -> Result<(), KernelError> {
        if let Some(slot) = self.slot.take() {
            swap.free(slot);
        }
        Ok(())
    }
}
