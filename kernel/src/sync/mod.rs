//! Synchronization primitives
//!
//! `SpinLock` for short interrupt-safe sections, `Mutex` where the holder
//! may sleep (with priority inheritance), `WaitQueue` and `Completion`
//! for event waits.

pub mod completion;
pub mod mutex;
pub mod spinlock;
pub mod wait_queue;

pub use completion::Completion;
pub use mutex::{Mutex, MutexGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use wait_queue::{WaitQueue, Waiter, WakeReason};
