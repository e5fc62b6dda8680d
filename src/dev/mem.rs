//! RAM-backed block device.
use super::{BlockOps, SECTOR_SIZE, Sector};
use crate::sync::SpinLock;
use alloc::{vec, vec::Vec};

/// A block device backed by main memory.
pub struct MemDisk {
    sectors: SpinLock<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    /// Creates a zero-filled disk of `sectors` sectors.
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors: SpinLock::new(vec![[0; SECTOR_SIZE]; sectors]),
        }
    }
}

impl BlockOps for MemDisk {
    fn block_cnt(&self) -> usize {
        let guard = self.sectors.lock();
        let cnt = guard.len();
        guard.unlock();
        cnt
    }

    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> bool {
        let guard = self.sectors.lock();
        let ok = match guard.get(sector.into_usize()) {
            Some(data) => {
                buf.copy_from_slice(data);
                true
            }
            None => false,
        };
        guard.unlock();
        ok
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> bool {
        let mut guard = self.sectors.lock();
        let ok = match guard.get_mut(sector.into_usize()) {
            Some(data) => {
                data.copy_from_slice(buf);
                true
            }
            None => false,
        };
        guard.unlock();
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sectors_are_independent() {
        let disk = MemDisk::new(4);
        assert_eq!(disk.block_cnt(), 4);
        assert!(disk.write(Sector(1), &[7; SECTOR_SIZE]));
        let mut buf = [0; SECTOR_SIZE];
        assert!(disk.read(Sector(0), &mut buf));
        assert_eq!(buf, [0; SECTOR_SIZE]);
        assert!(disk.read(Sector(1), &mut buf));
        assert_eq!(buf, [7; SECTOR_SIZE]);
        assert!(!disk.read(Sector(4), &mut buf));
    }
}
