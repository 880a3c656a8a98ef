//! Orion kernel core
//!
//! The scheduling and interrupt heart of a preemptive SMP kernel: per-CPU
//! runqueues with deadline, realtime, fair and idle classes, a hierarchical
//! load balancer, the 1024-vector interrupt dispatch path with threaded
//! handlers and storm damping, and the sleeping/spinning synchronization
//! primitives the rest of the kernel builds on.
//!
//! The crate is `no_std`; platform binaries provide the HAL, the interrupt
//! controller, the clock source and a log sink, then call `sched::init`.
//! Under test it links against std so the logic runs on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod cpu;
pub mod error;
pub mod hal;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod time;
