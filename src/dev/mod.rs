//! Devices.
//!
//! Block devices are registered into a small slot table, [`BlockDevices`],
//! at boot. The virtual memory subsystem binds a fixed slot as its swap disk.
//!
//! - Slot 0: Kernel image.
//! - Slot 1: Swap disk.
mod mem;

pub use mem::MemDisk;

use crate::fs::Disk;
use alloc::sync::Arc;

/// The number of block device slots.
pub const MAX_BLOCK_DEVS: usize = 4;

/// Sector, an access granuality for the disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sector(pub usize);

/// The size of a [`Sector`] in bytes.
pub const SECTOR_SIZE: usize = 512;

impl Sector {
    /// Get offset that represented by the sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 * SECTOR_SIZE
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Sector {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// Operations of a block device.
pub trait BlockOps
where
    Self: Send + Sync,
{
    /// Get total block count of this device.
    fn block_cnt(&self) -> usize;
    /// Read 512 bytes from disk starting from sector.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> bool;
    /// Write 512 bytes to disk starting from sector.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> bool;
}

/// The block device slot table.
#[derive(Default)]
pub struct BlockDevices {
    slots: [Option<Arc<dyn BlockOps>>; MAX_BLOCK_DEVS],
}

impl BlockDevices {
    /// Creates an empty slot table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a block device into `slot`, replacing any previous one.
    ///
    /// Registration into a slot out of range is ignored.
    pub fn register(&mut self, slot: usize, dev: impl BlockOps + 'static) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = Some(Arc::new(dev));
        }
    }

    /// Get block device.
    pub fn get_bdev(&self, slot: usize) -> Option<Arc<dyn BlockOps>> {
        self.slots.get(slot).and_then(|n| n.clone())
    }

    /// Opens the block device in `slot` as a [`Disk`].
    pub fn disk(&self, slot: usize) -> Option<Disk> {
        self.get_bdev(slot).map(Disk::new)
    }
}
