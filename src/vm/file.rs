//! # Memory-Mapped Files
//!
//! `mmap` maps a range of an open file into the address space of a process.
//! Nothing is read at `mmap` time: the range is split into page-sized chunks
//! and each chunk is registered as an uninitialized page that will become a
//! [`FilePage`] on its first fault.
//!
//! A file page never consumes swap. When it is evicted or unmapped, its
//! content is written back to the file if (and only if) the hardware dirty
//! bit says it was modified; otherwise the frame is simply dropped, since the
//! file still holds the same bytes.
//!
//! Every page of a mapping records the mapping's first address and its page
//! count, so `munmap` can tear down the whole mapping given any page of it.
use super::{
    Backing, PageOps, VmType,
    page::VmPage,
    spt::SupplementalPageTable,
    swap::SwapTable,
    uninit::FileBackedLoader,
};
use crate::{
    KernelError, MmStruct,
    addressing::{KERNEL_BASE, PAGE_SIZE, Va},
    fs::RegularFile,
    mm::page_table::PageTable,
};
use alloc::sync::Arc;
use log::debug;

/// The payload of a file-backed page.
#[derive(Clone)]
pub struct FilePage {
    file: RegularFile,
    offset: usize,
    read_bytes: usize,
    zero_bytes: usize,
    page_count: usize,
    mapping: Va,
}

impl FilePage {
    /// Creates the payload for one chunk of a file mapping.
    ///
    /// # Parameters
    /// - `file`: The mapped file.
    /// - `offset`: The file offset of this chunk.
    /// - `read_bytes`: The number of bytes of this chunk taken from the file.
    ///   The rest of the page is zero-filled.
    /// - `mapping`: The first address of the whole mapping.
    /// - `page_count`: The number of pages of the whole mapping.
    pub fn new(
        file: RegularFile,
        offset: usize,
        read_bytes: usize,
        mapping: Va,
        page_count: usize,
    ) -> Self {
        let read_bytes = read_bytes.min(PAGE_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
            page_count,
            mapping,
        }
    }

    /// The mapped file.
    pub fn file(&self) -> &RegularFile {
        &self.file
    }

    /// The file offset of this chunk.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The number of bytes of this chunk taken from the file.
    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    /// The number of trailing zero bytes of this chunk.
    pub fn zero_bytes(&self) -> usize {
        self.zero_bytes
    }

    /// The number of pages of the mapping this chunk belongs to.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// The first address of the mapping this chunk belongs to.
    pub fn mapping(&self) -> Va {
        self.mapping
    }

    /// A loader that reads this chunk from the file.
    pub fn loader(&self) -> FileBackedLoader {
        FileBackedLoader::new(self.file.clone(), self.offset, self.read_bytes)
    }

    fn write_back(&self, kva: &[u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let written = self.file.write(self.offset, &kva[..self.read_bytes])?;
        if written == self.read_bytes {
            Ok(())
        } else {
            Err(KernelError::IOError)
        }
    }
}

impl PageOps for FilePage {
    fn vm_type(&self) -> VmType {
        VmType::File
    }

    fn swap_in(
        &mut self,
        _va: Va,
        kva: &mut [u8; PAGE_SIZE],
        _swap: &SwapTable,
    ) -> Result<(), KernelError> {
        let read = self.file.read(self.offset, &mut kva[..self.read_bytes])?;
        kva[read..].fill(0);
        Ok(())
    }

    fn swap_out(
        &mut self,
        va: Va,
        kva: &[u8; PAGE_SIZE],
        page_table: &mut PageTable,
        _swap: &SwapTable,
    ) -> Result<(), KernelError> {
        if page_table.is_dirty(va) {
            self.write_back(kva)?;
        }
        page_table.unmap(va)?;
        Ok(())
    }

    fn destroy(
        &mut self,
        va: Va,
        kva: Option<&[u8; PAGE_SIZE]>,
        page_table: &mut PageTable,
        _swap: &SwapTable,
    ) -> Result<(), KernelError> {
        match kva {
            Some(kva) if page_table.is_dirty(va) => self.write_back(kva),
            _ => Ok(()),
        }
    }
}

impl MmStruct {
    /// Maps `length` bytes of `file`, starting at `offset`, at `addr`.
    ///
    /// The mapping is lazy: each page is read from the file on its first
    /// access. Bytes past `length` in the last page read as zero.
    ///
    /// # Parameters
    /// - `addr`: The page-aligned, non-null user address of the mapping.
    /// - `length`: The number of bytes to map.
    /// - `writable`: Whether user code may write to the mapping.
    /// - `file`: The file to map.
    /// - `offset`: The file offset of the first mapped byte.
    ///
    /// # Returns
    /// - `Ok(Va)`: The address of the mapping.
    /// - `Err(KernelError::BadFileDescriptor)`: `file` is `None`.
    /// - `Err(KernelError::InvalidArgument)`: The file is empty, the range
    ///   starts at or after the end of the file or extends past it, `addr` is
    ///   null, unaligned or not in user space, `length` is zero, or the range
    ///   overlaps an existing page.
    pub fn do_mmap(
        &self,
        addr: Va,
        length: usize,
        writable: bool,
        file: Option<&RegularFile>,
        offset: usize,
    ) -> Result<Va, KernelError> {
        let file = file.ok_or(KernelError::BadFileDescriptor)?;
        let file_len = file.size();
        if file_len == 0 || offset >= file_len || length > file_len - offset {
            return Err(KernelError::InvalidArgument);
        }
        if length == 0 || !addr.is_user() || !addr.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        let page_count = length.div_ceil(PAGE_SIZE);
        match addr.into_usize().checked_add(page_count * PAGE_SIZE) {
            Some(end) if end <= KERNEL_BASE => (),
            _ => return Err(KernelError::InvalidArgument),
        }

        let mut spt = self.spt.lock();
        let result = self.mmap_locked(&mut spt, addr, length, writable, file, offset, page_count);
        spt.unlock();
        if result.is_ok() {
            debug!("mmap: {:?} + {:#x} (offset {:#x}, {} pages)", addr, length, offset, page_count);
        }
        result.map(|_| addr)
    }

    #[allow(clippy::too_many_arguments)]
    fn mmap_locked(
        &self,
        spt: &mut SupplementalPageTable,
        addr: Va,
        length: usize,
        writable: bool,
        file: &RegularFile,
        offset: usize,
        page_count: usize,
    ) -> Result<(), KernelError> {
        if (0..page_count).any(|i| spt.find(addr + i * PAGE_SIZE).is_some()) {
            return Err(KernelError::InvalidArgument);
        }
        for i in 0..page_count {
            let read_bytes = (length - i * PAGE_SIZE).min(PAGE_SIZE);
            let chunk = FilePage::new(
                file.clone(),
                offset + i * PAGE_SIZE,
                read_bytes,
                addr,
                page_count,
            );
            let loader = chunk.loader();
            spt.insert(VmPage::new(
                addr + i * PAGE_SIZE,
                writable,
                Backing::File(chunk),
                Some(Arc::new(loader)),
            ))?;
        }
        Ok(())
    }

    /// Unmaps the file mapping containing `addr`.
    ///
    /// Every page of the mapping is written back to the file if it is dirty,
    /// removed from the page table, freed from its frame, and removed from
    /// the supplemental page table.
    ///
    /// # Returns
    /// - `Ok(())` on success, including when nothing is mapped at `addr`.
    /// - `Err(KernelError::InvalidArgument)`: `addr` is mapped but is not part
    ///   of a file mapping.
    pub fn do_munmap(&self, addr: Va) -> Result<(), KernelError> {
        let mut spt = self.spt.lock();
        let result = self.munmap_locked(&mut spt, addr);
        spt.unlock();
        result
    }

    fn munmap_locked(&self, spt: &mut SupplementalPageTable, addr: Va) -> Result<(), KernelError> {
        let Some(page) = spt.find(addr) else {
            return Ok(());
        };
        let guard = page.lock();
        let mapping = guard.file_page().map(|f| (f.mapping(), f.page_count()));
        guard.unlock();
        let (start, page_count) = mapping.ok_or(KernelError::InvalidArgument)?;

        for i in 0..page_count {
            let va = start + i * PAGE_SIZE;
            let Some(sibling) = spt.find(va) else {
                continue;
            };
            let guard = sibling.lock();
            let same_mapping = guard.file_page().is_some_and(|f| f.mapping() == start);
            guard.unlock();
            if same_mapping {
                spt.remove(va);
                self.vm.reclaim_page(&sibling, &self.page_table);
            }
        }
        debug!("munmap: {:?} ({} pages)", start, page_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{addressing::Pa, dev::MemDisk, fs::{Disk, ramfs::MemFile}, mm::page_table::Permission};

    #[test]
    fn chunk_geometry() {
        let file = RegularFile::new(MemFile::from_bytes(&[1; 10]));
        let chunk = FilePage::new(file, 0, 10, Va::new(0x4000).unwrap(), 1);
        assert_eq!(chunk.read_bytes(), 10);
        assert_eq!(chunk.zero_bytes(), PAGE_SIZE - 10);
        assert_eq!(chunk.read_bytes() + chunk.zero_bytes(), PAGE_SIZE);
    }

    #[test]
    fn clean_eviction_skips_writeback() {
        let swap = SwapTable::new(Disk::new(Arc::new(MemDisk::new(8)))).unwrap();
        let file = RegularFile::new(MemFile::from_bytes(&[1; 100]));
        let va = Va::new(0x4000).unwrap();
        let mut chunk = FilePage::new(file.clone(), 0, 100, va, 1);
        let mut pt = PageTable::new();
        pt.map(va, Pa::new(0x1000_0000).unwrap(), Permission::READ | Permission::USER)
            .unwrap();

        chunk.swap_out(va, &[9; PAGE_SIZE], &mut pt, &swap).unwrap();
        let mut buf = [0; 100];
        file.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1; 100]);
        assert!(pt.is_empty());
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn dirty_eviction_writes_back() {
        let swap = SwapTable::new(Disk::new(Arc::new(MemDisk::new(8)))).unwrap();
        let file = RegularFile::new(MemFile::from_bytes(&[1; 100]));
        let va = Va::new(0x4000).unwrap();
        let mut chunk = FilePage::new(file.clone(), 50, 50, va, 1);
        let mut pt = PageTable::new();
        pt.map(
            va,
            Pa::new(0x1000_0000).unwrap(),
            Permission::READ | Permission::WRITE | Permission::USER,
        )
        .unwrap();
        pt.set_dirty(va, true).unwrap();

        chunk.swap_out(va, &[9; PAGE_SIZE], &mut pt, &swap).unwrap();
        let mut buf = [0; 100];
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..50], &[1; 50]);
        assert_eq!(&buf[50..], &[9; 50]);
        assert_eq!(file.size(), 100);
    }
}
