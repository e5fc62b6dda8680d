//! In-memory regular files.
use super::{FileBlockNumber, traits};
use crate::{KernelError, addressing::PAGE_SIZE, sync::SpinLock};
use alloc::vec::Vec;

/// A regular file whose contents live in main memory.
#[derive(Default)]
pub struct MemFile {
    data: SpinLock<Vec<u8>>,
}

impl MemFile {
    /// Creates an empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a file holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: SpinLock::new(bytes.to_vec()),
        }
    }
}

impl traits::RegularFile for MemFile {
    fn size(&self) -> usize {
        let guard = self.data.lock();
        let size = guard.len();
        guard.unlock();
        size
    }

    fn read(&self, fba: FileBlockNumber, buf: &mut [u8; PAGE_SIZE]) -> Result<bool, KernelError> {
        let guard = self.data.lock();
        let start = fba.0 * PAGE_SIZE;
        buf.fill(0);
        let in_file = start < guard.len();
        if in_file {
            let end = guard.len().min(start + PAGE_SIZE);
            buf[..end - start].copy_from_slice(&guard[start..end]);
        }
        guard.unlock();
        Ok(in_file)
    }

    fn write(
        &self,
        fba: FileBlockNumber,
        buf: &[u8; PAGE_SIZE],
        min_size: usize,
    ) -> Result<(), KernelError> {
        let mut guard = self.data.lock();
        let start = fba.0 * PAGE_SIZE;
        let size = guard.len().max(min_size);
        let result = if start >= size {
            Err(KernelError::InvalidArgument)
        } else {
            if guard.len() < size {
                guard.resize(size, 0);
            }
            let end = size.min(start + PAGE_SIZE);
            guard[start..end].copy_from_slice(&buf[..end - start]);
            Ok(())
        };
        guard.unlock();
        result
    }
}
