//! Synchronization primitives.
//!
//! The virtual memory subsystem runs on behalf of many processes at once:
//! several threads may fault simultaneously, and they all share the frame
//! table and the swap table. Every piece of shared state is therefore wrapped
//! in a [`SpinLock`].
pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
