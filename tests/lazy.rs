mod common;

use common::{boot, fill, frame, page, peek, va};
use keos_vm::{
    KernelError, MmStruct,
    addressing::{PAGE_SIZE, Va},
    fs::{RegularFile, ramfs::MemFile},
    vm::{Backing, MmLoader, VmType},
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

const BASE: usize = 0x40_0000;

/// Fills a page with the low byte of its page number and counts its calls.
#[derive(Default)]
struct PatternLoader {
    calls: AtomicUsize,
}

impl MmLoader for PatternLoader {
    fn load(&self, addr: Va, kva: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        kva.fill((addr.into_usize() / PAGE_SIZE) as u8);
        Ok(())
    }
}

struct FailingLoader;

impl MmLoader for FailingLoader {
    fn load(&self, _addr: Va, _kva: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        Err(KernelError::IOError)
    }
}

#[test]
fn nothing_loads_before_first_access() {
    let vm = boot(4, 4);
    let mm = MmStruct::new(&vm);
    let loader = Arc::new(PatternLoader::default());
    for i in 0..3 {
        mm.alloc_page_with_initializer(
            Backing::Anon,
            va(BASE + i * PAGE_SIZE),
            true,
            Some(loader.clone()),
        )
        .unwrap();
    }
    assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    assert_eq!(vm.frame_table().in_use(), 0);

    assert_eq!(peek(&mm, BASE + PAGE_SIZE + 5), ((BASE + PAGE_SIZE) / PAGE_SIZE) as u8);
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    let info = mm.page_info(va(BASE + PAGE_SIZE)).unwrap();
    assert!(!info.is_uninit);
    assert_eq!(info.vm_type, VmType::Anon);
    assert!(mm.page_info(va(BASE)).unwrap().is_uninit);
}

#[test]
fn loader_runs_once() {
    let vm = boot(1, 4);
    let mm = MmStruct::new(&vm);
    let loader = Arc::new(PatternLoader::default());
    mm.alloc_page_with_initializer(Backing::Anon, va(BASE), true, Some(loader.clone()))
        .unwrap();
    mm.alloc_page(Backing::Anon, va(BASE + PAGE_SIZE), true).unwrap();

    peek(&mm, BASE);
    mm.with_user_page(va(BASE), true, |b| b[0] = 0xff).unwrap();
    // Evict the loaded page, then bring it back from swap.
    fill(&mm, BASE + PAGE_SIZE, 1);
    assert_eq!(frame(&mm, BASE), None);
    let content = page(&mm, BASE);
    assert_eq!(content[0], 0xff);
    assert_eq!(content[1], (BASE / PAGE_SIZE) as u8);
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn segment_from_file() {
    let vm = boot(4, 4);
    let mm = MmStruct::new(&vm);
    let bytes: Vec<u8> = (0..PAGE_SIZE + 10).map(|i| (i % 251) as u8).collect();
    let file = RegularFile::new(MemFile::from_bytes(&bytes));
    mm.load_segment(&file, 0, va(BASE), PAGE_SIZE + 10, PAGE_SIZE - 10, true)
        .unwrap();

    let second = page(&mm, BASE + PAGE_SIZE);
    assert_eq!(&second[..10], &bytes[PAGE_SIZE..]);
    assert!(second[10..].iter().all(|b| *b == 0));
    assert_eq!(page(&mm, BASE), &bytes[..PAGE_SIZE]);

    // Segment pages are private: writes never reach the executable.
    fill(&mm, BASE, 0);
    mm.kill();
    let mut head = [0; 4];
    file.read(0, &mut head).unwrap();
    assert_eq!(head, [0, 1, 2, 3]);
}

#[test]
fn failed_load_leaves_no_frame() {
    let vm = boot(2, 4);
    let mm = MmStruct::new(&vm);
    mm.alloc_page_with_initializer(Backing::Anon, va(BASE), true, Some(Arc::new(FailingLoader)))
        .unwrap();
    assert_eq!(mm.claim_page(va(BASE)), Err(KernelError::IOError));
    assert_eq!(frame(&mm, BASE), None);
    assert_eq!(vm.frame_table().in_use(), 0);
}
