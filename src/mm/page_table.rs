//! Entries of Page Table and thier permissions.
//!
//! The [`PageTable`] in this module is the software model of the hardware
//! MMU that the virtual memory subsystem drives. It holds one [`Pte`] per
//! mapped virtual page and exposes exactly the capabilities the VM layer
//! needs: install a mapping, clear it, and query or clear the dirty bit.
//!
//! [`PageTable::translate`] plays the role of the CPU: it walks the table for
//! a user access, sets the accessed and dirty bits the way the hardware would,
//! and reports a [`PFErrorCode`] when the access must fault.
//!
//! The page table is a *derived cache* of the supplemental page table: it may
//! only contain mappings for virtual pages that the supplemental page table
//! knows about and that currently own a frame.
use crate::{
    KernelError,
    addressing::{PAGE_MASK, Pa, Va},
};
use alloc::collections::BTreeMap;

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page.
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry.
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry.
        const US = 1 << 2;
        /// Accessed; indicates whether software has accessed the 4-KByte page referenced by this entry.
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry.
        const D = 1 << 6;
        /// Execute-disable; if 1, instruction fetches are not allowed from the 4-KByte page controlled by this entry.
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Possible memory permissions for a page.
    ///
    /// This defines the various permissions that can be assigned
    /// to memory pages in a page table. Each permission is represented by a
    /// single bit, allowing for efficient bitwise operations to check or
    /// modify permissions.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page is executable.
        const EXECUTABLE = 1 << 2;
        /// Page can be referred by user application.
        const USER = 1 << 3;
    }
}

bitflags::bitflags! {
    /// The error code pushed by the CPU on a page fault.
    pub struct PFErrorCode: usize {
        /// The fault was caused by a page-level protection violation. If
        /// clear, the fault was caused by a non-present page.
        const PRESENT = 1 << 0;
        /// The access causing the fault was a write.
        const WRITE_ACCESS = 1 << 1;
        /// The access causing the fault originated in user mode.
        const USER = 1 << 2;
    }
}

impl From<Permission> for PteFlags {
    fn from(perm: Permission) -> Self {
        let mut flags = PteFlags::P;
        if perm.contains(Permission::WRITE) {
            flags |= PteFlags::RW;
        }
        if perm.contains(Permission::USER) {
            flags |= PteFlags::US;
        }
        if !perm.contains(Permission::EXECUTABLE) {
            flags |= PteFlags::XD;
        }
        flags
    }
}

/// Errors that can occur during page table operations.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PageTableMappingError {
    /// Unaligned address.
    ///
    /// This error is returned when an address provided for a page table entry
    /// is not aligned to the page size.
    Unaligned,

    /// Not exist.
    ///
    /// This error is returned when a requested page table entry does not exist
    /// or is invalid.
    NotExist,

    /// Duplicated mapping.
    ///
    /// This error is returned when an attempt is made to create a duplicate
    /// mapping for an address that already has an existing mapping.
    Duplicated,
}

impl From<PageTableMappingError> for KernelError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::Unaligned => KernelError::InvalidArgument,
            PageTableMappingError::NotExist => KernelError::BadAddress,
            PageTableMappingError::Duplicated => KernelError::FileExist,
        }
    }
}

/// Page Table Entry (PTE).
///
/// The entry packs the physical address of the 4-KByte frame together with
/// its [`PteFlags`].
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub usize);

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pte({:016x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

impl Pte {
    /// Get the physical address pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(Pa)` if the page is present, containing the physical address.
    /// - `None` if the page is not present (i.e., the "P" flag is not set).
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new(self.0 & !PteFlags::all().bits() & !PAGE_MASK)
        } else {
            None
        }
    }

    /// Get the flags associated with this page table entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Set the physical address for this entry.
    ///
    /// This method updates the physical address of the entry, preserving the
    /// current flags.
    ///
    /// # Returns
    /// - `Ok(&mut Self)` if the address is valid and the update is successful.
    /// - `Err(PageTableMappingError::Unaligned)` if the provided physical
    ///   address is not aligned.
    #[inline]
    pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, PageTableMappingError> {
        let pa = pa.into_usize();
        if pa & PAGE_MASK != 0 {
            Err(PageTableMappingError::Unaligned)
        } else {
            self.0 = pa | self.flags().bits() | PteFlags::P.bits();
            Ok(self)
        }
    }

    /// Set the flags for this entry.
    ///
    /// The physical address remains unchanged.
    #[inline]
    pub fn set_flags(&mut self, perm: PteFlags) -> &mut Self {
        self.0 = self.pa().map(|n| n.into_usize()).unwrap_or(0) | perm.bits();
        self
    }

    /// Clears the entry.
    ///
    /// # Returns
    /// - `Some(Pa)`: The physical address that was previously stored in the
    ///   entry, if it existed.
    /// - `None`: If the entry did not contain a valid physical address.
    #[inline]
    pub fn clear(&mut self) -> Option<Pa> {
        self.pa().inspect(|_| {
            self.0 = 0;
        })
    }
}

/// A per-address-space page table.
///
/// Entries are keyed by page-aligned virtual address.
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<Va, Pte>,
}

impl PageTable {
    /// Create an empty page table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a virtual page to a physical frame with the given permissions.
    ///
    /// # Returns
    /// - `Ok(())` on success.
    /// - `Err(PageTableMappingError::Unaligned)` if either address is not
    ///   page-aligned.
    /// - `Err(PageTableMappingError::Duplicated)` if `va` is already mapped.
    pub fn map(&mut self, va: Va, pa: Pa, perm: Permission) -> Result<(), PageTableMappingError> {
        if !va.is_page_aligned() || pa.offset() != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        if self.entries.contains_key(&va) {
            return Err(PageTableMappingError::Duplicated);
        }
        let mut pte = Pte(0);
        pte.set_flags(PteFlags::from(perm)).set_pa(pa)?;
        self.entries.insert(va, pte);
        Ok(())
    }

    /// Remove the mapping of a virtual page.
    ///
    /// # Returns
    /// - `Ok(Pa)` holding the physical frame the page was mapped to.
    /// - `Err(PageTableMappingError::NotExist)` if `va` was not mapped.
    pub fn unmap(&mut self, va: Va) -> Result<Pa, PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        self.entries
            .remove(&va)
            .and_then(|mut pte| pte.clear())
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Find the entry of the page containing `va`.
    pub fn walk(&self, va: Va) -> Result<&Pte, PageTableMappingError> {
        self.entries
            .get(&va.page_down())
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Find the entry of the page containing `va`, mutably.
    pub fn walk_mut(&mut self, va: Va) -> Result<&mut Pte, PageTableMappingError> {
        self.entries
            .get_mut(&va.page_down())
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Returns `true` if the page containing `va` is mapped and has been
    /// written since the dirty bit was last cleared.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.walk(va)
            .map(|pte| pte.flags().contains(PteFlags::D))
            .unwrap_or(false)
    }

    /// Returns `true` if the page containing `va` is mapped and has been
    /// accessed.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.walk(va)
            .map(|pte| pte.flags().contains(PteFlags::A))
            .unwrap_or(false)
    }

    /// Set or clear the dirty bit of the page containing `va`.
    pub fn set_dirty(&mut self, va: Va, dirty: bool) -> Result<(), PageTableMappingError> {
        let pte = self.walk_mut(va)?;
        let mut flags = pte.flags();
        flags.set(PteFlags::D, dirty);
        pte.set_flags(flags);
        Ok(())
    }

    /// Translate an access to `va` the way the MMU does.
    ///
    /// On success, the accessed bit (and the dirty bit for a write) of the
    /// entry is set and the physical address of the accessed byte is
    /// returned.
    ///
    /// # Returns
    /// - `Ok(Pa)` if the access is allowed.
    /// - `Err(PFErrorCode)` describing the fault the CPU would raise.
    pub fn translate(&mut self, va: Va, is_write: bool, is_user: bool) -> Result<Pa, PFErrorCode> {
        let mut ec = PFErrorCode::empty();
        ec.set(PFErrorCode::WRITE_ACCESS, is_write);
        ec.set(PFErrorCode::USER, is_user);

        let pte = match self.entries.get_mut(&va.page_down()) {
            Some(pte) => pte,
            None => return Err(ec),
        };
        let Some(pa) = pte.pa() else {
            return Err(ec);
        };
        let mut flags = pte.flags();
        if (is_user && !flags.contains(PteFlags::US)) || (is_write && !flags.contains(PteFlags::RW))
        {
            return Err(ec | PFErrorCode::PRESENT);
        }
        flags |= PteFlags::A;
        if is_write {
            flags |= PteFlags::D;
        }
        pte.set_flags(flags);
        Ok(pa + va.offset())
    }

    /// The number of installed mappings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no mapping is installed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over every installed mapping.
    pub fn iter(&self) -> impl Iterator<Item = (&Va, &Pte)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    fn pa(addr: usize) -> Pa {
        Pa::new(addr).unwrap()
    }

    #[test]
    fn map_and_unmap() {
        let mut pt = PageTable::new();
        let perm = Permission::READ | Permission::WRITE | Permission::USER;
        assert_eq!(pt.map(va(0x4000), pa(0x1000_0000), perm), Ok(()));
        assert_eq!(
            pt.map(va(0x4000), pa(0x1000_1000), perm),
            Err(PageTableMappingError::Duplicated)
        );
        assert_eq!(
            pt.map(va(0x4001), pa(0x1000_1000), perm),
            Err(PageTableMappingError::Unaligned)
        );
        assert_eq!(pt.walk(va(0x4123)).unwrap().pa(), Some(pa(0x1000_0000)));
        assert_eq!(pt.unmap(va(0x4000)), Ok(pa(0x1000_0000)));
        assert_eq!(pt.unmap(va(0x4000)), Err(PageTableMappingError::NotExist));
        assert!(pt.is_empty());
    }

    #[test]
    fn translate_sets_accessed_and_dirty() {
        let mut pt = PageTable::new();
        pt.map(va(0x4000), pa(0x1000_0000), Permission::READ | Permission::WRITE | Permission::USER)
            .unwrap();
        assert!(!pt.is_accessed(va(0x4000)));
        assert_eq!(pt.translate(va(0x4010), false, true), Ok(pa(0x1000_0010)));
        assert!(pt.is_accessed(va(0x4000)));
        assert!(!pt.is_dirty(va(0x4000)));
        pt.translate(va(0x4fff), true, true).unwrap();
        assert!(pt.is_dirty(va(0x4000)));
        pt.set_dirty(va(0x4000), false).unwrap();
        assert!(!pt.is_dirty(va(0x4000)));
        assert_eq!(pt.walk(va(0x4000)).unwrap().pa(), Some(pa(0x1000_0000)));
    }

    #[test]
    fn translate_faults() {
        let mut pt = PageTable::new();
        pt.map(va(0x4000), pa(0x1000_0000), Permission::READ | Permission::USER)
            .unwrap();
        pt.map(va(0x5000), pa(0x1000_1000), Permission::READ | Permission::WRITE)
            .unwrap();
        assert_eq!(
            pt.translate(va(0x8000), false, true),
            Err(PFErrorCode::USER)
        );
        assert_eq!(
            pt.translate(va(0x4000), true, true),
            Err(PFErrorCode::PRESENT | PFErrorCode::WRITE_ACCESS | PFErrorCode::USER)
        );
        assert_eq!(
            pt.translate(va(0x5000), false, true),
            Err(PFErrorCode::PRESENT | PFErrorCode::USER)
        );
        assert!(pt.translate(va(0x5000), true, false).is_ok());
    }
}
