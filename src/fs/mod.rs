//! Filesystem abstraction.
//!
//! The virtual memory subsystem consumes two storage capabilities:
//! byte-range access to an open [`RegularFile`] (for memory-mapped files and
//! lazily loaded program segments), and sector access to a raw [`Disk`] (for
//! the swap area).
pub mod ramfs;

use crate::{
    KernelError,
    addressing::PAGE_SIZE,
    dev::{BlockOps, SECTOR_SIZE, Sector},
};
use alloc::{boxed::Box, sync::Arc};

/// Defines traits for file system operations.
pub mod traits {
    use super::FileBlockNumber;
    use crate::{KernelError, addressing::PAGE_SIZE};

    /// Trait representing a regular file in the filesystem.
    ///
    /// A regular file contains user data and supports basic read and write
    /// operations.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads data from the file into the provided buffer.
        ///
        /// # Parameters
        /// - `fba`: The `FileBlockNumber` which to read.
        /// - `buf`: A mutable array where the file content will be stored.
        ///
        /// # Returns
        /// - `Ok(true)`: If the block lies within the file.
        /// - `Ok(false)`: If the block lies past the end of the file; `buf` is
        ///   zero-filled.
        /// - `Err(Error)`: An error occured while the read operation.
        fn read(&self, fba: FileBlockNumber, buf: &mut [u8; PAGE_SIZE]) -> Result<bool, KernelError>;

        /// Writes a 4096-byte page of data into the specified file block.
        ///
        /// If the target block lies beyond the current end of the file, the
        /// file is extended up to `min_size` bytes to accommodate the write.
        ///
        /// # Parameters
        /// - `fba`: The `FileBlockNumber` indicating the block to write to.
        /// - `buf`: A buffer containing exactly 4096 bytes of data to write.
        /// - `min_size`: The desired minimum file size (in bytes) after the
        ///   write. If this value is less than or equal to the current file
        ///   size, no growth occurs.
        fn write(
            &self,
            fba: FileBlockNumber,
            buf: &[u8; PAGE_SIZE],
            min_size: usize,
        ) -> Result<(), KernelError>;
    }
}

/// Represents a file block number within a file.
///
/// Each block contains 4096 bytes of contents.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct FileBlockNumber(pub usize);

impl FileBlockNumber {
    /// Computes the file block number from a byte offset within a file.
    pub const fn from_offset(offset: usize) -> Self {
        Self(offset / PAGE_SIZE)
    }
}

/// A handle to an open regular file.
///
/// This struct provides a reference-counted handle to a file that supports
/// byte-granular reading and writing. Cloning the handle is how a mapping
/// keeps its own reference to the file.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Creates a new [`RegularFile`] handle from a given implementation of
    /// [`traits::RegularFile`].
    pub fn new(r: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(r))
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Reads data from the file at `position` into the provided buffer.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes read. This is short when the read
    ///   crosses the end of the file.
    /// - `Err(Error)`: An error if the read operation fails.
    pub fn read(&self, mut position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut bounce_buffer = Box::new([0; PAGE_SIZE]);
        let max_read = self
            .size()
            .min(position + buf.len())
            .saturating_sub(position);
        let mut read_bytes = 0;
        while read_bytes < max_read {
            let in_block = position % PAGE_SIZE;
            self.0
                .read(FileBlockNumber::from_offset(position), &mut bounce_buffer)?;
            let chunk = (PAGE_SIZE - in_block).min(max_read - read_bytes);
            buf[read_bytes..read_bytes + chunk]
                .copy_from_slice(&bounce_buffer[in_block..in_block + chunk]);
            position += chunk;
            read_bytes += chunk;
        }
        Ok(read_bytes)
    }

    /// Writes data from the buffer into the file at `position`.
    ///
    /// If the write position is beyond the current file size, file will be
    /// extended to minimum size required to reflect the update.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes written.
    /// - `Err(Error)`: An error if the write operation fails.
    pub fn write(&self, mut position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        let mut bounce_buffer = Box::new([0; PAGE_SIZE]);
        let mut write_bytes = 0;
        while write_bytes < buf.len() {
            let in_block = position % PAGE_SIZE;
            let chunk = (PAGE_SIZE - in_block).min(buf.len() - write_bytes);
            let fba = FileBlockNumber::from_offset(position);
            if chunk != PAGE_SIZE {
                // Partial block: read-modify-write.
                self.0.read(fba, &mut bounce_buffer)?;
            }
            bounce_buffer[in_block..in_block + chunk]
                .copy_from_slice(&buf[write_bytes..write_bytes + chunk]);
            self.0.write(fba, &bounce_buffer, position + chunk)?;
            position += chunk;
            write_bytes += chunk;
        }
        Ok(write_bytes)
    }
}

impl core::fmt::Debug for RegularFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegularFile")
            .field("size", &self.size())
            .finish()
    }
}

// The type for disk hooking.
#[doc(hidden)]
pub type Hook = Arc<
    dyn Fn(Sector, &[u8; SECTOR_SIZE], bool) -> Result<(), KernelError> + Send + Sync + 'static,
>;

/// The disk, a device that has byte sink.
#[derive(Clone)]
pub struct Disk {
    dev: Arc<dyn BlockOps>,
    is_ro: bool,
    hook: Option<Hook>,
}

impl Disk {
    /// Create a new Disk from the block device.
    pub fn new(dev: Arc<dyn BlockOps>) -> Self {
        Self {
            dev,
            is_ro: false,
            hook: None,
        }
    }

    /// Make the disk read-only.
    pub fn ro(self) -> Self {
        Self {
            is_ro: true,
            ..self
        }
    }

    /// Add a hook for the disk.
    ///
    /// The hook runs before every sector transfer and receives the sector,
    /// the buffer, and whether the access is a write. Returning an error
    /// fails the transfer.
    pub fn hook(self, hook: Hook) -> Self {
        Self {
            hook: Some(hook),
            ..self
        }
    }

    /// The number of sectors on the disk.
    pub fn sector_cnt(&self) -> usize {
        self.dev.block_cnt()
    }

    /// Read 512 bytes from disk starting from sector.
    pub fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, false)?;
        }
        if self.dev.read(sector, buf) {
            Ok(())
        } else {
            Err(KernelError::IOError)
        }
    }

    /// Write 512 bytes to disk starting from sector.
    pub fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if self.is_ro {
            return Err(KernelError::NotSupportedOperation);
        }
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, true)?;
        }
        if self.dev.write(sector, buf) {
            Ok(())
        } else {
            Err(KernelError::IOError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ramfs::MemFile, *};
    use crate::dev::MemDisk;

    #[test]
    fn byte_range_access() {
        let file = RegularFile::new(MemFile::new());
        assert_eq!(file.write(100, &[1; 5000]), Ok(5000));
        assert_eq!(file.size(), 5100);

        let mut buf = [0xff; 6000];
        assert_eq!(file.read(0, &mut buf), Ok(5100));
        assert!(buf[..100].iter().all(|b| *b == 0));
        assert!(buf[100..5100].iter().all(|b| *b == 1));

        assert_eq!(file.read(5100, &mut buf), Ok(0));
        assert_eq!(file.read(5000, &mut buf[..50]), Ok(50));
    }

    #[test]
    fn overwrite_in_place() {
        let file = RegularFile::new(MemFile::from_bytes(&[9; PAGE_SIZE * 2]));
        assert_eq!(file.write(PAGE_SIZE - 2, &[1, 2, 3, 4]), Ok(4));
        assert_eq!(file.size(), PAGE_SIZE * 2);
        let mut buf = [0; 6];
        file.read(PAGE_SIZE - 3, &mut buf).unwrap();
        assert_eq!(buf, [9, 1, 2, 3, 4, 9]);
    }

    #[test]
    fn disk_hook_and_ro() {
        let disk = Disk::new(Arc::new(MemDisk::new(8)));
        let mut buf = [0; SECTOR_SIZE];
        assert_eq!(disk.write(Sector(2), &[3; SECTOR_SIZE]), Ok(()));
        assert_eq!(disk.read(Sector(2), &mut buf), Ok(()));
        assert_eq!(buf, [3; SECTOR_SIZE]);
        assert_eq!(disk.read(Sector(8), &mut buf), Err(KernelError::IOError));

        let hooked = disk.clone().hook(Arc::new(|sector: Sector, _: &[u8; SECTOR_SIZE], is_write: bool| {
            if is_write && sector == Sector(5) {
                Err(KernelError::IOError)
            } else {
                Ok(())
            }
        }));
        assert_eq!(hooked.write(Sector(5), &buf), Err(KernelError::IOError));
        assert_eq!(hooked.write(Sector(4), &buf), Ok(()));
        assert_eq!(
            disk.ro().write(Sector(0), &buf),
            Err(KernelError::NotSupportedOperation)
        );
    }
}
