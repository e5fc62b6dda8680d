//! A user process as seen by the virtual memory subsystem.
//!
//! A [`Process`] owns one address space and the snapshot of its user stack
//! pointer. It is also where user memory is *accessed*: [`Process::read_user`]
//! and [`Process::write_user`] walk the page table the way the CPU does,
//! raise a page fault on a missing mapping, and retry once the fault handler
//! has brought the page in. A fault the handler cannot resolve terminates the
//! process with exit code `-1`.
use crate::{
    KernelError, MmStruct,
    addressing::{PAGE_SIZE, Va},
    mm::page_table::PFErrorCode,
    vm::{PageFaultReason, Vm},
};
use alloc::sync::Arc;
use log::{debug, warn};

/// A user process.
pub struct Process {
    /// The address space of the process.
    pub mm_struct: MmStruct,
    /// The user stack pointer.
    pub rsp: Va,
    exit_code: Option<i32>,
}

impl Process {
    /// Creates a process with an empty address space and a one-page stack.
    pub fn new(vm: &Arc<Vm>) -> Result<Self, KernelError> {
        let mm_struct = MmStruct::new(vm);
        let rsp = mm_struct.setup_stack()?;
        Ok(Self {
            mm_struct,
            rsp,
            exit_code: None,
        })
    }

    /// Handles a page fault raised by this process.
    ///
    /// # Parameters
    /// - `ec`: The error code pushed by the CPU.
    /// - `cr2`: The faulting address.
    ///
    /// # Returns
    /// - `true` if the fault was resolved and the access can be retried.
    /// - `false` if the fault was fatal. The process has exited with `-1`.
    pub fn page_fault(&mut self, ec: PFErrorCode, cr2: Va) -> bool {
        let reason = PageFaultReason::new(ec, cr2, self.rsp);
        match self.mm_struct.handle_page_fault(&reason) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "process: unresolved page fault at {:?} (write: {}, present: {}): {:?}",
                    cr2, reason.is_write_access, reason.is_present, e
                );
                self.exit(-1);
                false
            }
        }
    }

    /// Reads `buf.len()` bytes of user memory at `va`.
    ///
    /// # Returns
    /// - `Ok(())` on success.
    /// - `Err(KernelError::BadAddress)`: The access faulted fatally. The
    ///   process has exited.
    pub fn read_user(&mut self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        let len = buf.len();
        self.access_user(va, len, false, |done, bytes| {
            buf[done..done + bytes.len()].copy_from_slice(bytes)
        })
    }

    /// Writes `buf` to user memory at `va`.
    ///
    /// # Returns
    /// - `Ok(())` on success.
    /// - `Err(KernelError::BadAddress)`: The access faulted fatally. The
    ///   process has exited.
    pub fn write_user(&mut self, va: Va, buf: &[u8]) -> Result<(), KernelError> {
        self.access_user(va, buf.len(), true, |done, bytes| {
            bytes.copy_from_slice(&buf[done..done + bytes.len()])
        })
    }

    fn access_user(
        &mut self,
        va: Va,
        len: usize,
        is_write: bool,
        mut f: impl FnMut(usize, &mut [u8]),
    ) -> Result<(), KernelError> {
        if self.exit_code.is_some() {
            return Err(KernelError::BadAddress);
        }
        let mut done = 0;
        while done < len {
            let cur = va
                .into_usize()
                .checked_add(done)
                .and_then(Va::new)
                .ok_or(KernelError::BadAddress)?;
            let chunk = (PAGE_SIZE - cur.offset()).min(len - done);
            match self
                .mm_struct
                .with_user_page(cur, is_write, |bytes| f(done, &mut bytes[..chunk]))
            {
                Ok(()) => done += chunk,
                Err(ec) => {
                    if !self.page_fault(ec, cur) {
                        return Err(KernelError::BadAddress);
                    }
                }
            }
        }
        Ok(())
    }

    /// Creates a child process with a copy of this process's address space.
    pub fn fork(&self) -> Result<Process, KernelError> {
        let mm_struct = self.mm_struct.fork()?;
        Ok(Process {
            mm_struct,
            rsp: self.rsp,
            exit_code: None,
        })
    }

    /// Terminates the process and destroys its address space.
    ///
    /// Only the first exit code is kept.
    pub fn exit(&mut self, code: i32) {
        if self.exit_code.is_none() {
            debug!("process: exit({})", code);
            self.exit_code = Some(code);
            self.mm_struct.kill();
        }
    }

    /// The exit code of the process, if it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}
