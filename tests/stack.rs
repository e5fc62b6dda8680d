mod common;

use common::{boot, boot_with, va};
use keos_vm::{
    KernelError, Process, VmConfig,
    addressing::{PAGE_SIZE, USER_STACK},
    vm::PageMarker,
};

#[test]
fn initial_stack() {
    let vm = boot(4, 4);
    let mut p = Process::new(&vm).unwrap();
    assert_eq!(p.rsp, va(USER_STACK));
    assert_eq!(p.mm_struct.page_count(), 1);
    let info = p.mm_struct.page_info(va(USER_STACK - 1)).unwrap();
    assert!(info.markers.contains(PageMarker::STACK));
    assert!(info.frame.is_some());

    let mut word = [0xff; 8];
    p.read_user(va(USER_STACK - 8), &mut word).unwrap();
    assert_eq!(word, [0; 8]);
}

#[test]
fn push_below_rsp_grows() {
    let vm = boot(4, 4);
    let mut p = Process::new(&vm).unwrap();
    p.rsp = va(USER_STACK - PAGE_SIZE);
    p.write_user(p.rsp - 4usize, &[1, 2, 3, 4]).unwrap();
    assert_eq!(p.mm_struct.page_count(), 2);
    let info = p.mm_struct.page_info(p.rsp - 4usize).unwrap();
    assert!(info.markers.contains(PageMarker::STACK));
    assert!(info.writable);
    assert_eq!(p.exit_code(), None);
}

#[test]
fn far_below_rsp_is_fatal() {
    let vm = boot(4, 4);
    let mut p = Process::new(&vm).unwrap();
    p.rsp = va(USER_STACK - PAGE_SIZE);
    assert_eq!(
        p.write_user(p.rsp - 64usize, &[0; 8]),
        Err(KernelError::BadAddress)
    );
    assert_eq!(p.exit_code(), Some(-1));
}

#[test]
fn stack_limit() {
    let vm = boot(4, 4);
    let limit = USER_STACK - (1 << 20);

    let mut p = Process::new(&vm).unwrap();
    p.rsp = va(limit);
    p.write_user(va(limit), &[1]).unwrap();
    assert_eq!(p.mm_struct.page_count(), 2);

    let mut q = Process::new(&vm).unwrap();
    q.rsp = va(limit - 1);
    assert_eq!(q.write_user(va(limit - 1), &[1]), Err(KernelError::BadAddress));
    assert_eq!(q.exit_code(), Some(-1));
}

#[test]
fn configured_slack() {
    let vm = boot_with(4, 4, VmConfig::default().set_stack_slack(64));
    let mut p = Process::new(&vm).unwrap();
    p.rsp = va(USER_STACK - PAGE_SIZE);
    p.write_user(p.rsp - 64usize, &[0; 8]).unwrap();
    assert_eq!(p.mm_struct.page_count(), 2);
}
