//! Memory Management.
//!
//! This module models the physical side of memory management: a bounded
//! [`UserPool`] of page frames and the [`Page`] handle that owns one of them.
//!
//! Memory allocation and deallocation is closely tied to Rust's ownership and
//! lifetime system: A page is allocated by [`UserPool::alloc`]. Once the
//! [`Page`] instance is dropped, the page is automatically returned to the
//! pool it came from, ensuring proper memory management and preventing memory
//! leaks.
//!
//! The pool is deliberately small and bounded. When it runs dry, the frame
//! table (see [`crate::vm::frame`]) must evict a resident page to make room.
pub mod page_table;

use crate::addressing::{PAGE_SHIFT, PAGE_SIZE, Pa};
use alloc::{boxed::Box, sync::Arc};
use core::mem::ManuallyDrop;
use crossbeam_queue::ArrayQueue;

/// The physical address of the first frame in every user pool.
const USER_POOL_BASE: usize = 0x1000_0000;

struct RawFrame {
    pa: Pa,
    buf: Box<[u8; PAGE_SIZE]>,
}

struct PoolInner {
    free: ArrayQueue<RawFrame>,
    capacity: usize,
}

/// A bounded pool of physical page frames for user memory.
///
/// Every frame has a fixed physical address assigned at construction time.
/// The pool hands frames out as [`Page`]s, which return themselves to the pool
/// when dropped. Cloning a [`UserPool`] yields another handle to the same pool.
///
/// ## Example:
/// ```
/// use keos_vm::mm::UserPool;
///
/// let pool = UserPool::new(2);
/// let a = pool.alloc().unwrap();
/// let _b = pool.alloc().unwrap();
/// assert!(pool.alloc().is_none());
/// drop(a);
/// assert_eq!(pool.free_pages(), 1);
/// ```
#[derive(Clone)]
pub struct UserPool {
    inner: Arc<PoolInner>,
}

impl UserPool {
    /// Creates a pool holding `pages` zeroed page frames.
    pub fn new(pages: usize) -> Self {
        let free = ArrayQueue::new(pages.max(1));
        for i in 0..pages {
            let _ = free.push(RawFrame {
                pa: Pa::new(USER_POOL_BASE + (i << PAGE_SHIFT)).unwrap_or(Pa::ZERO),
                buf: Box::new([0; PAGE_SIZE]),
            });
        }
        Self {
            inner: Arc::new(PoolInner {
                free,
                capacity: pages,
            }),
        }
    }

    /// Allocates a zero-filled page from the pool.
    ///
    /// # Returns
    /// - `Some(Page)` if a free frame exists.
    /// - `None` if the pool is exhausted.
    pub fn alloc(&self) -> Option<Page> {
        let RawFrame { pa, mut buf } = self.inner.free.pop()?;
        buf.fill(0);
        Some(Page {
            pa,
            buf: ManuallyDrop::new(buf),
            pool: self.inner.clone(),
        })
    }

    /// The total number of frames managed by this pool.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// The number of frames currently free.
    pub fn free_pages(&self) -> usize {
        self.inner.free.len()
    }

    /// Converts a physical address handed out by this pool into the index of
    /// its frame.
    ///
    /// # Returns
    /// - `Some(index)` if `pa` is the first byte of one of this pool's frames.
    /// - `None` otherwise.
    pub fn index_of(&self, pa: Pa) -> Option<usize> {
        let pa = pa.into_usize();
        if pa < USER_POOL_BASE || pa & (PAGE_SIZE - 1) != 0 {
            return None;
        }
        let index = (pa - USER_POOL_BASE) >> PAGE_SHIFT;
        (index < self.inner.capacity).then_some(index)
    }
}

/// A single physical page frame taken from a [`UserPool`].
///
/// The [`Page`] struct encapsulates a single memory page, providing methods to
/// access and manipulate the underlying page's contents. Dropping the page
/// returns the frame to its pool.
pub struct Page {
    pa: Pa,
    buf: ManuallyDrop<Box<[u8; PAGE_SIZE]>>,
    pool: Arc<PoolInner>,
}

impl Page {
    /// Get the physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Get a reference to the contents of the page (read-only).
    #[inline]
    pub fn inner(&self) -> &[u8; PAGE_SIZE] {
        &self.buf
    }

    /// Get a mutable reference to the contents of the page.
    #[inline]
    pub fn inner_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.buf
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // SAFETY: `buf` is never touched again after this point.
        let buf = unsafe { ManuallyDrop::take(&mut self.buf) };
        let _ = self.pool.free.push(RawFrame { pa: self.pa, buf });
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page").field("pa", &self.pa).finish()
    }
}
