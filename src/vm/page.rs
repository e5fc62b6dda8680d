//! # Page Object
//!
//! A [`VmPage`] describes one virtual page of an address space: where it
//! lives, whether it may be written, which frame (if any) currently backs it,
//! and where its content comes from when it is not resident.
//!
//! The content source is the page's [`PageState`], one of three variants:
//!
//! - [`PageState::Uninit`]: the page has never been touched. It knows which
//!   variant it will become and how to fill its first frame.
//! - [`PageState::Anon`]: the page is anonymous memory, persisted to swap
//!   when evicted.
//! - [`PageState::File`]: the page mirrors a range of a file and is written
//!   back to it when evicted dirty.
//!
//! The resolved variants share one interface, [`PageOps`]. The transition
//! out of [`PageState::Uninit`] happens exactly once, in
//! [`VmPage::swap_in`], and is never undone.
use super::{
    anon::AnonPage,
    file::FilePage,
    frame::FrameId,
    swap::SwapTable,
    uninit::{MmLoader, UninitPage},
};
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    mm::page_table::{PageTable, Permission},
};
use alloc::sync::Arc;

/// The type of a virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    /// A page that has not been initialized yet.
    Uninit,
    /// A page not related to a file, aka anonymous page.
    Anon,
    /// A page that is related to a file.
    File,
}

bitflags::bitflags! {
    /// Auxiliary markers attached to a page.
    pub struct PageMarker: u8 {
        /// The page belongs to the user stack.
        const STACK = 1 << 3;
    }
}

/// The variant-specific behavior of a resolved page.
///
/// Implemented by [`AnonPage`] and [`FilePage`]. Every method is called with
/// the frame table lock held and the page locked.
pub trait PageOps {
    /// The type of this page.
    fn vm_type(&self) -> VmType;

    /// Fills `kva`, the frame that now backs the page at `va`.
    fn swap_in(
        &mut self,
        va: Va,
        kva: &mut [u8; PAGE_SIZE],
        swap: &SwapTable,
    ) -> Result<(), KernelError>;

    /// Saves the content of `kva` so the frame can be reused, and removes the
    /// hardware mapping of `va`.
    ///
    /// On failure the page is left untouched and still owns its frame.
    fn swap_out(
        &mut self,
        va: Va,
        kva: &[u8; PAGE_SIZE],
        page_table: &mut PageTable,
        swap: &SwapTable,
    ) -> Result<(), KernelError>;

    /// Releases the resources held by the page before it is freed.
    ///
    /// `kva` is the frame backing the page, if it is resident.
    fn destroy(
        &mut self,
        va: Va,
        kva: Option<&[u8; PAGE_SIZE]>,
        page_table: &mut PageTable,
        swap: &SwapTable,
    ) -> Result<(), KernelError>;
}

/// The variant a page resolves into on its first fault.
#[derive(Clone)]
pub enum Backing {
    /// An anonymous page.
    Anon,
    /// A page mirroring a range of a file.
    File(FilePage),
}

impl Backing {
    /// The type of page this backing produces.
    pub fn vm_type(&self) -> VmType {
        match self {
            Backing::Anon => VmType::Anon,
            Backing::File(_) => VmType::File,
        }
    }

    /// Builds the payload of the resolved page.
    pub fn into_state(self) -> PageState {
        match self {
            Backing::Anon => PageState::Anon(AnonPage::new()),
            Backing::File(file) => PageState::File(file),
        }
    }
}

/// The variant payload of a page.
#[derive(Clone)]
pub enum PageState {
    /// Never faulted.
    Uninit(UninitPage),
    /// Anonymous memory.
    Anon(AnonPage),
    /// File-backed memory.
    File(FilePage),
}

/// A page of a virtual address space.
pub struct VmPage {
    va: Va,
    writable: bool,
    markers: PageMarker,
    frame: Option<FrameId>,
    state: PageState,
}

impl VmPage {
    /// Creates an uninitialized page at `va`.
    ///
    /// `va` is rounded down to its page boundary.
    pub fn new(
        va: Va,
        writable: bool,
        backing: Backing,
        loader: Option<Arc<dyn MmLoader>>,
    ) -> Self {
        Self {
            va: va.page_down(),
            writable,
            markers: PageMarker::empty(),
            frame: None,
            state: PageState::Uninit(UninitPage::new(backing, loader)),
        }
    }

    /// Attach `markers` to the page.
    pub fn with_markers(self, markers: PageMarker) -> Self {
        Self { markers, ..self }
    }

    /// The page-aligned virtual address of the page.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    /// Whether user code may write to the page.
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// The markers attached to the page.
    #[inline]
    pub fn markers(&self) -> PageMarker {
        self.markers
    }

    /// The frame backing the page, if it is resident.
    #[inline]
    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub(crate) fn set_frame(&mut self, frame: Option<FrameId>) {
        self.frame = frame;
    }

    /// The variant payload of the page.
    pub fn state(&self) -> &PageState {
        &self.state
    }

    /// The type of the page.
    ///
    /// An uninitialized page reports the type it will become.
    pub fn vm_type(&self) -> VmType {
        match &self.state {
            PageState::Uninit(uninit) => uninit.backing().vm_type(),
            PageState::Anon(anon) => anon.vm_type(),
            PageState::File(file) => file.vm_type(),
        }
    }

    /// Returns `true` if the page has never been faulted in.
    pub fn is_uninit(&self) -> bool {
        matches!(self.state, PageState::Uninit(_))
    }

    /// The file mapping this page belongs to, whether or not it has been
    /// faulted in yet.
    pub fn file_page(&self) -> Option<&FilePage> {
        match &self.state {
            PageState::Uninit(uninit) => match uninit.backing() {
                Backing::File(file) => Some(file),
                Backing::Anon => None,
            },
            PageState::File(file) => Some(file),
            PageState::Anon(_) => None,
        }
    }

    /// The permission used for the hardware mapping of this page.
    pub fn permission(&self) -> Permission {
        if self.writable {
            Permission::READ | Permission::WRITE | Permission::USER
        } else {
            Permission::READ | Permission::USER
        }
    }

    /// Builds a copy of this page for another address space.
    ///
    /// The copy is never resident. An uninitialized page keeps sharing its
    /// loader. A resolved page becomes an uninitialized page of the same
    /// type; a file page re-reads its range from the file on first access.
    pub(crate) fn duplicate(&self) -> VmPage {
        let state = match &self.state {
            PageState::Uninit(uninit) => PageState::Uninit(uninit.clone()),
            PageState::Anon(_) => PageState::Uninit(UninitPage::new(Backing::Anon, None)),
            PageState::File(file) => PageState::Uninit(UninitPage::new(
                Backing::File(file.clone()),
                Some(Arc::new(file.loader())),
            )),
        };
        VmPage {
            va: self.va,
            writable: self.writable,
            markers: self.markers,
            frame: None,
            state,
        }
    }

    /// Materializes the page into `kva`, the frame that now backs it.
    ///
    /// An uninitialized page first turns into its target variant and then
    /// runs its loader. This is the only place where a page changes variant.
    pub fn swap_in(&mut self, kva: &mut [u8; PAGE_SIZE], swap: &SwapTable) -> Result<(), KernelError> {
        match &mut self.state {
            PageState::Uninit(uninit) => {
                let uninit = uninit.clone();
                let (state, result) = uninit.initialize(self.va, kva);
                self.state = state;
                result
            }
            PageState::Anon(anon) => anon.swap_in(self.va, kva, swap),
            PageState::File(file) => file.swap_in(self.va, kva, swap),
        }
    }

    /// Evicts the page out of `kva`.
    pub fn swap_out(
        &mut self,
        kva: &[u8; PAGE_SIZE],
        page_table: &mut PageTable,
        swap: &SwapTable,
    ) -> Result<(), KernelError> {
        match &mut self.state {
            PageState::Uninit(_) => Err(KernelError::InvalidArgument),
            PageState::Anon(anon) => anon.swap_out(self.va, kva, page_table, swap),
            PageState::File(file) => file.swap_out(self.va, kva, page_table, swap),
        }
    }

    /// Releases the variant-specific resources of the page.
    ///
    /// Tolerates every state; an uninitialized page has nothing to release.
    pub fn destroy(
        &mut self,
        kva: Option<&[u8; PAGE_SIZE]>,
        page_table: &mut PageTable,
        swap: &SwapTable,
    ) -> Result<(), KernelError> {
        match &mut self.state {
            PageState::Uninit(_) => Ok(()),
            PageState::Anon(anon) => anon.destroy(self.va, kva, page_table, swap),
            PageState::File(file) => file.destroy(self.va, kva, page_table, swap),
        }
    }
}

impl core::fmt::Debug for VmPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmPage")
            .field("va", &self.va)
            .field("writable", &self.writable)
            .field("type", &self.vm_type())
            .field("uninit", &self.is_uninit())
            .field("frame", &self.frame)
            .finish()
    }
}
