//! Uninitialized pages and their loaders.
//!
//! Every page starts its life *uninitialized*: the address is reserved in the
//! supplemental page table, but no frame backs it yet. The page remembers
//! what it will become (its [`Backing`]) and, optionally, an [`MmLoader`]
//! that fills the frame on the first fault.
//!
//! The [`MmLoader`] trait defines how the contents of a page should be
//! supplied when the page is first accessed. Each loader carries its own
//! state, so the "callback" and its "argument" travel together as one trait
//! object. File-backed regions use a [`FileBackedLoader`], which reads
//! contents from a file, while anonymous regions use an [`AnonLoader`], which
//! supplies zero-filled pages.
//!
//! Loaders are shared by `Arc`: a forked address space points at the same
//! loader as its parent, so lazy state is shared by construction.
use super::{Backing, PageState};
use crate::{KernelError, addressing::{PAGE_SIZE, Va}, fs::RegularFile};
use alloc::sync::Arc;

/// A trait for loading the contents of a virtual memory page on demand.
///
/// This trait abstracts the mechanism for supplying the contents of a page
/// during **demand paging**. The frame handed to the loader is already
/// zero-filled.
pub trait MmLoader
where
    Self: Send + Sync,
{
    /// Loads the content for the page at the given virtual address into
    /// `kva`.
    ///
    /// # Parameters
    /// - `addr`: The page-aligned virtual address of the page being loaded.
    /// - `kva`: The frame that will back the page.
    ///
    /// # Returns
    /// - `Ok(())` if the frame now holds the page content.
    /// - `Err(KernelError)` if the content could not be produced.
    fn load(&self, addr: Va, kva: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError>;
}

/// A loader for anonymous memory regions.
///
/// [`AnonLoader`] is used for memory that is not backed by any file, such as
/// the stack. The page is simply zero-filled.
pub struct AnonLoader {}

impl MmLoader for AnonLoader {
    fn load(&self, _addr: Va, kva: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        kva.fill(0);
        Ok(())
    }
}

/// A loader for a page whose initial content comes from a file.
///
/// The loader reads `read_bytes` bytes starting at `offset` and zero-fills
/// the remaining `zero_bytes` bytes of the page. It serves both file
/// mappings and lazily loaded program segments.
#[derive(Clone)]
pub struct FileBackedLoader {
    file: RegularFile,
    offset: usize,
    read_bytes: usize,
}

impl FileBackedLoader {
    /// Creates a loader that reads `read_bytes` bytes of `file` at `offset`.
    ///
    /// `read_bytes` is capped at [`PAGE_SIZE`].
    pub fn new(file: RegularFile, offset: usize, read_bytes: usize) -> Self {
        Self {
            file,
            offset,
            read_bytes: read_bytes.min(PAGE_SIZE),
        }
    }

    /// The number of bytes that the loader copies from the file.
    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    /// The number of trailing bytes that the loader zero-fills.
    pub fn zero_bytes(&self) -> usize {
        PAGE_SIZE - self.read_bytes
    }
}

impl MmLoader for FileBackedLoader {
    fn load(&self, _addr: Va, kva: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let read = self.file.read(self.offset, &mut kva[..self.read_bytes])?;
        kva[read..].fill(0);
        Ok(())
    }
}

/// The payload of an uninitialized page.
#[derive(Clone)]
pub struct UninitPage {
    backing: Backing,
    loader: Option<Arc<dyn MmLoader>>,
}

impl UninitPage {
    /// Creates a payload that will become `backing`, initialized by `loader`.
    pub fn new(backing: Backing, loader: Option<Arc<dyn MmLoader>>) -> Self {
        Self { backing, loader }
    }

    /// What this page turns into on the first fault.
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// The loader run on the first fault, if any.
    pub fn loader(&self) -> Option<&Arc<dyn MmLoader>> {
        self.loader.as_ref()
    }

    /// Builds the target variant and runs the loader into `kva`.
    ///
    /// The returned state replaces this payload even if the loader fails;
    /// the page never reverts to uninitialized.
    pub(super) fn initialize(
        self,
        va: Va,
        kva: &mut [u8; PAGE_SIZE],
    ) -> (PageState, Result<(), KernelError>) {
        let state = self.backing.into_state();
        let result = match self.loader {
            Some(loader) => loader.load(va, kva),
            None => Ok(()),
        };
        (state, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ramfs::MemFile;

    #[test]
    fn file_loader_zero_fills_tail() {
        let file = RegularFile::new(MemFile::from_bytes(&[5; 100]));
        let loader = FileBackedLoader::new(file, 10, 50);
        assert_eq!(loader.zero_bytes(), PAGE_SIZE - 50);

        let mut kva = [0xee; PAGE_SIZE];
        loader.load(Va::new(0x1000).unwrap(), &mut kva).unwrap();
        assert!(kva[..50].iter().all(|b| *b == 5));
        assert!(kva[50..].iter().all(|b| *b == 0));
    }

    #[test]
    fn file_loader_short_file() {
        let file = RegularFile::new(MemFile::from_bytes(&[5; 30]));
        let loader = FileBackedLoader::new(file, 10, 50);
        let mut kva = [0xee; PAGE_SIZE];
        loader.load(Va::new(0x1000).unwrap(), &mut kva).unwrap();
        assert!(kva[..20].iter().all(|b| *b == 5));
        assert!(kva[20..].iter().all(|b| *b == 0));
    }

    #[test]
    fn anon_loader_zeroes() {
        let mut kva = [0xee; PAGE_SIZE];
        AnonLoader {}.load(Va::new(0x1000).unwrap(), &mut kva).unwrap();
        assert_eq!(kva, [0; PAGE_SIZE]);
    }
}
