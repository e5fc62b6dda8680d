//! Lazy program loading and the initial user stack.
//!
//! A program segment is not read when the process starts. Instead, each page
//! of the segment is reserved as an uninitialized anonymous page whose
//! [`FileBackedLoader`] reads the page's share of the segment from the
//! executable on the first fault. The page is anonymous, not file-backed: once
//! loaded, modifications belong to the process and are swapped, never written
//! back to the executable.
//!
//! The first stack page is the exception to laziness. It is claimed right
//! away so the process can push its arguments before running.
use super::{Backing, PageMarker, VmPage, uninit::FileBackedLoader};
use crate::{
    KernelError, MmStruct,
    addressing::{PAGE_SIZE, USER_STACK, Va},
    fs::RegularFile,
};
use alloc::sync::Arc;
use log::debug;

impl MmStruct {
    /// Reserves the pages of a program segment.
    ///
    /// # Parameters
    /// - `file`: The executable.
    /// - `offset`: The file offset of the segment.
    /// - `upage`: The page-aligned user address of the segment.
    /// - `read_bytes`: The number of bytes of the segment taken from the file.
    /// - `zero_bytes`: The number of zero bytes following them.
    ///   `read_bytes + zero_bytes` must be a multiple of [`PAGE_SIZE`].
    /// - `writable`: Whether user code may write to the segment.
    ///
    /// # Returns
    /// - `Ok(())` on success.
    /// - `Err(KernelError::InvalidArgument)`: `upage` is not a page-aligned
    ///   user address or the segment size is not a multiple of the page size.
    /// - `Err(KernelError::FileExist)`: The segment overlaps a reserved page.
    pub fn load_segment(
        &self,
        file: &RegularFile,
        offset: usize,
        upage: Va,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), KernelError> {
        if (read_bytes + zero_bytes) % PAGE_SIZE != 0 || !upage.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        let pages = (read_bytes + zero_bytes) / PAGE_SIZE;
        let mut remaining = read_bytes;
        for i in 0..pages {
            let page_read_bytes = remaining.min(PAGE_SIZE);
            let loader = FileBackedLoader::new(file.clone(), offset + i * PAGE_SIZE, page_read_bytes);
            self.alloc_page_with_initializer(
                Backing::Anon,
                upage + i * PAGE_SIZE,
                writable,
                Some(Arc::new(loader)),
            )?;
            remaining -= page_read_bytes;
        }
        debug!("loader: segment at {:?}, {} pages", upage, pages);
        Ok(())
    }

    /// Creates the first page of the user stack.
    ///
    /// # Returns
    /// - `Ok(Va)`: The initial stack pointer, [`USER_STACK`].
    /// - `Err(KernelError)`: The stack page could not be created.
    pub fn setup_stack(&self) -> Result<Va, KernelError> {
        let stack_page = Va::new(USER_STACK - PAGE_SIZE).ok_or(KernelError::BadAddress)?;
        self.insert_page(
            VmPage::new(stack_page, true, Backing::Anon, None).with_markers(PageMarker::STACK),
        )?;
        self.claim_page(stack_page)?;
        Va::new(USER_STACK).ok_or(KernelError::BadAddress)
    }
}
