//! # Frame Table
//!
//! The frame table is the global registry of every physical frame currently
//! carved out of the user pool. Frames are stored in an arena indexed by
//! [`FrameId`] (the frame's slot in the pool); a [`VmPage`] refers to its
//! frame only by that index, and the frame refers back to its page through a
//! weak pointer. The frame table alone owns the physical buffers.
//!
//! Frames are also kept in a FIFO queue in the order they were handed out.
//! When the pool is exhausted, [`FrameTableState::get_frame`] evicts the
//! oldest frame: its page is asked to save its content (to swap or to its
//! file) and the freed buffer is reused. Accessing a page does not move its
//! frame in the queue.
//!
//! The whole table lives behind one [`SpinLock`]. Acquiring, releasing, and
//! evicting frames, as well as filling a freshly acquired frame, happen while
//! that lock is held, so two threads can never pick the same victim.
use super::{page::VmPage, swap::SwapTable};
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Pa, Va},
    mm::{Page, UserPool, page_table::PageTable},
    sync::{SpinLock, SpinLockGuard},
};
use alloc::{
    collections::VecDeque,
    sync::{Arc, Weak},
    vec::Vec,
};
use log::{debug, error, trace};

/// The index of a frame in the frame table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameId(usize);

impl FrameId {
    #[cfg(test)]
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The index of the frame.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The page currently using a frame.
pub struct FrameOwner {
    /// The page backed by the frame.
    pub page: Weak<SpinLock<VmPage>>,
    /// The page table of the address space the page belongs to.
    pub page_table: Arc<SpinLock<PageTable>>,
    /// The virtual address of the page.
    pub va: Va,
}

/// A physical frame in use.
pub struct Frame {
    page: Page,
    owner: Option<FrameOwner>,
}

impl Frame {
    /// The physical address of the frame.
    pub fn pa(&self) -> Pa {
        self.page.pa()
    }

    /// The page currently using the frame.
    pub fn owner(&self) -> Option<&FrameOwner> {
        self.owner.as_ref()
    }
}

/// The state of the frame table, accessible while its lock is held.
pub struct FrameTableState {
    pool: UserPool,
    frames: Vec<Option<Frame>>,
    fifo: VecDeque<FrameId>,
}

/// The global frame table.
pub struct FrameTable {
    state: SpinLock<FrameTableState>,
}

impl FrameTable {
    /// Creates a frame table that hands out frames from `pool`.
    pub fn new(pool: UserPool) -> Self {
        let mut frames = Vec::new();
        frames.resize_with(pool.capacity(), || None);
        Self {
            state: SpinLock::new(FrameTableState {
                pool,
                frames,
                fifo: VecDeque::new(),
            }),
        }
    }

    /// Locks the frame table.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, FrameTableState> {
        self.state.lock()
    }

    /// The number of frames currently in use.
    pub fn in_use(&self) -> usize {
        let guard = self.state.lock();
        let n = guard.fifo.len();
        guard.unlock();
        n
    }

    /// The frames currently in use, oldest first.
    pub fn fifo_order(&self) -> Vec<FrameId> {
        let guard = self.state.lock();
        let order = guard.fifo.iter().copied().collect();
        guard.unlock();
        order
    }
}

impl FrameTableState {
    /// Acquires a zero-filled frame.
    ///
    /// The frame is taken from the pool if possible. Otherwise, the oldest
    /// frame in use is evicted and reused. The returned frame has no owner
    /// and sits at the tail of the FIFO queue.
    ///
    /// # Returns
    /// - `Ok(FrameId)` on success.
    /// - `Err(KernelError)` if the pool is exhausted and no frame could be
    ///   evicted. Every frame keeps its page in that case.
    pub fn get_frame(&mut self, swap: &SwapTable) -> Result<FrameId, KernelError> {
        let id = match self.pool.alloc() {
            Some(page) => {
                let id = self
                    .pool
                    .index_of(page.pa())
                    .map(FrameId)
                    .ok_or(KernelError::NoMemory)?;
                self.frames[id.0] = Some(Frame { page, owner: None });
                id
            }
            None => self.evict_frame(swap)?,
        };
        self.fifo.push_back(id);
        trace!("frame: acquire {:?}", id);
        Ok(id)
    }

    /// Picks the next eviction victim: the oldest frame in use.
    ///
    /// The victim is removed from the FIFO queue.
    pub fn get_victim(&mut self) -> Option<FrameId> {
        self.fifo.pop_front()
    }

    /// Evicts the oldest frame in use and returns it zero-filled and unowned.
    /// The frame is no longer in the FIFO queue.
    ///
    /// The victim is always the head of the queue. If its page is locked,
    /// eviction waits for it.
    ///
    /// # Returns
    /// - `Ok(FrameId)` of the reclaimed frame.
    /// - `Err(KernelError)` if the victim could not save its content (e.g.
    ///   swap is full) or no frame is in use. The victim keeps its frame and
    ///   its place at the head of the queue.
    pub fn evict_frame(&mut self, swap: &SwapTable) -> Result<FrameId, KernelError> {
        while let Some(id) = self.get_victim() {
            let Some(frame) = self.frames[id.0].as_mut() else {
                continue;
            };
            let Some(owner) = frame.owner.take() else {
                frame.page.inner_mut().fill(0);
                return Ok(id);
            };
            let Some(page) = owner.page.upgrade() else {
                frame.page.inner_mut().fill(0);
                return Ok(id);
            };

            let mut guard = page.lock();
            let mut page_table = owner.page_table.lock();
            let result = guard.swap_out(frame.page.inner(), &mut page_table, swap);
            page_table.unlock();
            return match result {
                Ok(()) => {
                    guard.set_frame(None);
                    guard.unlock();
                    frame.page.inner_mut().fill(0);
                    debug!("frame: evict {:?} from {:?}", id, owner.va);
                    Ok(id)
                }
                Err(e) => {
                    guard.unlock();
                    error!("frame: failed to evict {:?} from {:?}: {:?}", id, owner.va, e);
                    frame.owner = Some(owner);
                    self.fifo.push_front(id);
                    Err(e)
                }
            };
        }
        Err(KernelError::NoMemory)
    }

    /// Records `owner` as the page using frame `id`.
    pub fn link(&mut self, id: FrameId, owner: FrameOwner) {
        if let Some(frame) = self.frames[id.0].as_mut() {
            frame.owner = Some(owner);
        }
    }

    /// Releases the frame of `page` back to the pool and clears the page's
    /// frame pointer.
    ///
    /// Does nothing if the page is not resident.
    pub fn release(&mut self, page: &mut VmPage) {
        let Some(id) = page.frame() else {
            return;
        };
        match self.frames[id.0].as_ref().and_then(|f| f.owner.as_ref()) {
            Some(owner) if owner.va != page.va() => {
                error!("frame: {:?} is not owned by {:?}", id, page.va());
                return;
            }
            _ => (),
        }
        page.set_frame(None);
        self.fifo.retain(|f| *f != id);
        self.frames[id.0] = None;
        trace!("frame: release {:?}", id);
    }

    /// Returns an unowned frame straight to the pool.
    pub(crate) fn discard(&mut self, id: FrameId) {
        if self.frames[id.0].as_ref().is_some_and(|f| f.owner.is_none()) {
            self.fifo.retain(|f| *f != id);
            self.frames[id.0] = None;
        }
    }

    /// The frame `id`, if it is in use.
    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id.0).and_then(|f| f.as_ref())
    }

    /// The physical address of frame `id`.
    pub fn pa(&self, id: FrameId) -> Result<Pa, KernelError> {
        self.frame(id).map(Frame::pa).ok_or(KernelError::BadAddress)
    }

    /// The content of frame `id`.
    pub fn kva(&self, id: FrameId) -> Result<&[u8; PAGE_SIZE], KernelError> {
        self.frame(id)
            .map(|f| f.page.inner())
            .ok_or(KernelError::BadAddress)
    }

    /// The content of frame `id`, mutably.
    pub fn kva_mut(&mut self, id: FrameId) -> Result<&mut [u8; PAGE_SIZE], KernelError> {
        self.frames
            .get_mut(id.0)
            .and_then(|f| f.as_mut())
            .map(|f| f.page.inner_mut())
            .ok_or(KernelError::BadAddress)
    }

    /// The frame holding physical address `pa`.
    pub fn frame_of(&self, pa: Pa) -> Option<FrameId> {
        let id = FrameId(self.pool.index_of(pa.page_down())?);
        self.frame(id).map(|_| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addressing::Va,
        dev::MemDisk,
        fs::Disk,
        mm::page_table::Permission,
        vm::page::Backing,
    };

    struct Fixture {
        swap: SwapTable,
        table: FrameTable,
        page_table: Arc<SpinLock<PageTable>>,
        pages: Vec<Arc<SpinLock<VmPage>>>,
    }

    impl Fixture {
        fn new(frames: usize, swap_slots: usize) -> Self {
            Self {
                swap: SwapTable::new(Disk::new(Arc::new(MemDisk::new(8 * swap_slots)))).unwrap(),
                table: FrameTable::new(UserPool::new(frames)),
                page_table: Arc::new(SpinLock::new(PageTable::new())),
                pages: Vec::new(),
            }
        }

        // Acquire a frame, fill it with `fill`, and hand it to a new
        // anonymous page.
        fn resident_page(&mut self, va: usize, fill: u8) -> Result<FrameId, KernelError> {
            let va = Va::new(va).unwrap();
            let page = Arc::new(SpinLock::new(VmPage::new(va, true, Backing::Anon, None)));
            self.pages.push(page.clone());

            let mut ft = self.table.lock();
            let id = match ft.get_frame(&self.swap) {
                Ok(id) => id,
                Err(e) => {
                    ft.unlock();
                    return Err(e);
                }
            };
            let pa = ft.pa(id).unwrap();
            let kva = ft.kva_mut(id).unwrap();
            let mut guard = page.lock();
            guard.swap_in(kva, &self.swap).unwrap();
            kva.fill(fill);
            guard.set_frame(Some(id));
            guard.unlock();
            let mut pt = self.page_table.lock();
            pt.map(va, pa, Permission::READ | Permission::WRITE | Permission::USER)
                .unwrap();
            pt.unlock();
            ft.link(
                id,
                FrameOwner {
                    page: Arc::downgrade(&page),
                    page_table: self.page_table.clone(),
                    va,
                },
            );
            ft.unlock();
            Ok(id)
        }

        fn frame_of(&self, i: usize) -> Option<FrameId> {
            let guard = self.pages[i].lock();
            let frame = guard.frame();
            guard.unlock();
            frame
        }
    }

    #[test]
    fn fifo_victims() {
        let mut fx = Fixture::new(2, 8);
        let f1 = fx.resident_page(0x1000, 1).unwrap();
        let f2 = fx.resident_page(0x2000, 2).unwrap();
        assert_eq!(fx.table.fifo_order(), [f1, f2]);

        // The third page evicts the first one, the fourth the second one.
        let f3 = fx.resident_page(0x3000, 3).unwrap();
        assert_eq!(f3, f1);
        assert_eq!(fx.frame_of(0), None);
        assert_eq!(fx.frame_of(1), Some(f2));

        let f4 = fx.resident_page(0x4000, 4).unwrap();
        assert_eq!(f4, f2);
        assert_eq!(fx.frame_of(1), None);
        assert_eq!(fx.frame_of(2), Some(f3));
        assert_eq!(fx.swap.used_slots(), 2);
        assert_eq!(fx.table.fifo_order(), [f3, f4]);
    }

    #[test]
    fn exhausted_swap_keeps_victim() {
        let mut fx = Fixture::new(1, 1);
        let f1 = fx.resident_page(0x1000, 1).unwrap();
        // Fill the only swap slot.
        let slot = fx.swap.allocate_slot().unwrap();

        assert_eq!(fx.resident_page(0x2000, 2), Err(KernelError::NoSpace));
        assert_eq!(fx.frame_of(0), Some(f1));
        let ft = fx.table.lock();
        let content = ft.kva(f1).map(|k| k[0]);
        ft.unlock();
        assert_eq!(content, Ok(1));
        let pt = fx.page_table.lock();
        let still_mapped = pt.walk(Va::new(0x1000).unwrap()).is_ok();
        pt.unlock();
        assert!(still_mapped);
        fx.swap.free(slot);
    }

    #[test]
    fn release_returns_frame() {
        let mut fx = Fixture::new(2, 1);
        fx.resident_page(0x1000, 1).unwrap();
        assert_eq!(fx.table.in_use(), 1);

        let page = fx.pages[0].clone();
        let mut ft = fx.table.lock();
        let mut guard = page.lock();
        ft.release(&mut guard);
        let frame = guard.frame();
        guard.unlock();
        ft.unlock();
        assert_eq!(frame, None);
        assert_eq!(fx.table.in_use(), 0);
    }

    #[test]
    fn mismatched_release_keeps_frame() {
        let mut fx = Fixture::new(2, 1);
        let f1 = fx.resident_page(0x1000, 1).unwrap();

        // A page at another address that claims the same frame.
        let mut stranger = VmPage::new(Va::new(0x5000).unwrap(), true, Backing::Anon, None);
        stranger.set_frame(Some(f1));
        let mut ft = fx.table.lock();
        ft.release(&mut stranger);
        ft.unlock();

        assert_eq!(stranger.frame(), Some(f1));
        assert_eq!(fx.frame_of(0), Some(f1));
        assert_eq!(fx.table.fifo_order(), [f1]);
    }

    #[test]
    fn busy_victim_is_waited_for() {
        let mut fx = Fixture::new(2, 4);
        let f1 = fx.resident_page(0x1000, 1).unwrap();
        let f2 = fx.resident_page(0x2000, 2).unwrap();

        let busy = fx.pages[0].clone();
        let table = &fx.table;
        let swap = &fx.swap;
        let victim = std::thread::scope(|s| {
            let guard = busy.lock();
            let evictor = s.spawn(|| {
                let mut ft = table.lock();
                let victim = ft.evict_frame(swap);
                ft.unlock();
                victim
            });
            std::thread::sleep(std::time::Duration::from_millis(50));
            guard.unlock();
            evictor.join().unwrap()
        });

        assert_eq!(victim, Ok(f1));
        assert_eq!(fx.frame_of(0), None);
        assert_eq!(fx.frame_of(1), Some(f2));
        assert_eq!(fx.table.fifo_order(), [f2]);
    }
}
