//! # Swap
//!
//! Anonymous pages have no file to fall back on, so when one is evicted its
//! content is persisted to the swap disk. The disk is carved into page-sized
//! *slots*: slot `i` occupies sectors `[8i, 8i + 8)`. A bitmap records which
//! slots currently hold a page.
//!
//! Every operation of the [`SwapTable`] runs under one lock that covers both
//! the bitmap and the disk transfer, serializing all swap traffic.
use crate::{
    KernelError,
    addressing::PAGE_SIZE,
    dev::{SECTOR_SIZE, Sector},
    fs::Disk,
    sync::SpinLock,
};
use alloc::{vec, vec::Vec};

/// The number of sectors that hold one page.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// An index of a page-sized slot on the swap disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// The slot index.
    pub fn index(&self) -> usize {
        self.0
    }

    /// The first sector of the slot.
    pub fn sector(&self) -> Sector {
        Sector(self.0 * SECTORS_PER_PAGE)
    }
}

/// A fixed-size bitmap.
struct Bitmap {
    words: Vec<u64>,
    bits: usize,
}

impl Bitmap {
    fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
            bits,
        }
    }

    fn test(&self, idx: usize) -> bool {
        idx < self.bits && self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: usize, value: bool) {
        if idx < self.bits {
            if value {
                self.words[idx / 64] |= 1 << (idx % 64);
            } else {
                self.words[idx / 64] &= !(1 << (idx % 64));
            }
        }
    }

    /// Finds the first clear bit, sets it, and returns its index.
    fn scan_and_flip(&mut self) -> Option<usize> {
        let (w, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let idx = w * 64 + word.trailing_ones() as usize;
        if idx >= self.bits {
            return None;
        }
        *word |= 1 << (idx % 64);
        Some(idx)
    }

    fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

struct SwapInner {
    disk: Disk,
    used: Bitmap,
}

impl SwapInner {
    fn write(&self, slot: SwapSlot, buf: &[u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let mut sector = [0; SECTOR_SIZE];
        for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            sector.copy_from_slice(chunk);
            self.disk.write(slot.sector() + i, &sector)?;
        }
        Ok(())
    }

    fn read(&self, slot: SwapSlot, buf: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let mut sector = [0; SECTOR_SIZE];
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.disk.read(slot.sector() + i, &mut sector)?;
            chunk.copy_from_slice(&sector);
        }
        Ok(())
    }
}

/// The swap slot table.
pub struct SwapTable {
    inner: SpinLock<SwapInner>,
    slots: usize,
}

impl SwapTable {
    /// Binds `disk` as the swap area.
    ///
    /// # Returns
    /// - `Ok(SwapTable)` with `sectors / 8` slots, all free.
    /// - `Err(KernelError::NoSpace)` if the disk cannot hold a single page.
    pub fn new(disk: Disk) -> Result<Self, KernelError> {
        let slots = disk.sector_cnt() / SECTORS_PER_PAGE;
        if slots == 0 {
            return Err(KernelError::NoSpace);
        }
        Ok(Self {
            inner: SpinLock::new(SwapInner {
                disk,
                used: Bitmap::new(slots),
            }),
            slots,
        })
    }

    /// The number of slots on the swap disk.
    pub fn capacity(&self) -> usize {
        self.slots
    }

    /// The number of slots currently holding a page.
    pub fn used_slots(&self) -> usize {
        let guard = self.inner.lock();
        let used = guard.used.count_ones();
        guard.unlock();
        used
    }

    /// Returns `true` if `slot` currently holds a page.
    pub fn is_used(&self, slot: SwapSlot) -> bool {
        let guard = self.inner.lock();
        let used = guard.used.test(slot.0);
        guard.unlock();
        used
    }

    /// Reserves the first free slot.
    ///
    /// # Returns
    /// - `Some(SwapSlot)` on success.
    /// - `None` if every slot is in use.
    pub fn allocate_slot(&self) -> Option<SwapSlot> {
        let mut guard = self.inner.lock();
        let slot = guard.used.scan_and_flip().map(SwapSlot);
        guard.unlock();
        slot
    }

    /// Writes one page into `slot`.
    pub fn write(&self, slot: SwapSlot, buf: &[u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let guard = self.inner.lock();
        let result = guard.write(slot, buf);
        guard.unlock();
        result
    }

    /// Reads one page out of `slot`. The slot stays reserved.
    pub fn read(&self, slot: SwapSlot, buf: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let guard = self.inner.lock();
        let result = guard.read(slot, buf);
        guard.unlock();
        result
    }

    /// Releases `slot`. Its content becomes garbage.
    pub fn free(&self, slot: SwapSlot) {
        let mut guard = self.inner.lock();
        guard.used.set(slot.0, false);
        guard.unlock();
    }

    /// Persists a page into a fresh slot.
    ///
    /// The slot is released again if the transfer fails.
    ///
    /// # Returns
    /// - `Ok(SwapSlot)` holding the page content.
    /// - `Err(KernelError::NoSpace)` if the swap disk is full.
    /// - `Err(KernelError::IOError)` if the disk transfer fails.
    pub fn swap_out(&self, buf: &[u8; PAGE_SIZE]) -> Result<SwapSlot, KernelError> {
        let mut guard = self.inner.lock();
        let result = match guard.used.scan_and_flip().map(SwapSlot) {
            Some(slot) => match guard.write(slot, buf) {
                Ok(()) => Ok(slot),
                Err(e) => {
                    guard.used.set(slot.0, false);
                    Err(e)
                }
            },
            None => Err(KernelError::NoSpace),
        };
        guard.unlock();
        result
    }

    /// Loads the page held in `slot` and releases the slot.
    ///
    /// The slot stays reserved if the transfer fails.
    pub fn swap_in(&self, slot: SwapSlot, buf: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let result = guard.read(slot, buf);
        if result.is_ok() {
            guard.used.set(slot.0, false);
        }
        guard.unlock();
        result
    }
}
