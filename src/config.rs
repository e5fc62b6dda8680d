//! Configuration of the virtual memory subsystem.
//!
//! A [`VmConfig`] is handed to [`Vm::boot`] once and is immutable afterwards.
//! The defaults reproduce the classic policy: swap on block device slot 1, a
//! 1 MiB stack limit, and 8 bytes of slack below the stack pointer for
//! instructions that fault before adjusting `rsp` (such as `push`).
//!
//! ```
//! use keos_vm::VmConfig;
//!
//! let config = VmConfig::default().set_stack_limit(2 << 20).set_stack_slack(32);
//! assert_eq!(config.swap_disk(), 1);
//! assert_eq!(config.stack_limit(), 2 << 20);
//! ```
//!
//! [`Vm::boot`]: crate::vm::Vm::boot

/// System-wide settings of the virtual memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    swap_disk: usize,
    stack_limit: usize,
    stack_slack: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            swap_disk: 1,
            stack_limit: 1 << 20,
            stack_slack: 8,
        }
    }
}

impl VmConfig {
    /// Sets the block device slot used as the swap disk.
    pub fn set_swap_disk(self, slot: usize) -> Self {
        Self {
            swap_disk: slot,
            ..self
        }
    }

    /// Sets the maximum size of the user stack.
    pub fn set_stack_limit(self, bytes: usize) -> Self {
        Self {
            stack_limit: bytes,
            ..self
        }
    }

    /// Sets how many bytes below the stack pointer a fault may lie and still
    /// count as a stack access.
    pub fn set_stack_slack(self, bytes: usize) -> Self {
        Self {
            stack_slack: bytes,
            ..self
        }
    }

    /// The block device slot used as the swap disk.
    pub fn swap_disk(&self) -> usize {
        self.swap_disk
    }

    /// The maximum size of the user stack.
    pub fn stack_limit(&self) -> usize {
        self.stack_limit
    }

    /// Bytes below the stack pointer still accepted as a stack access.
    pub fn stack_slack(&self) -> usize {
        self.stack_slack
    }
}
