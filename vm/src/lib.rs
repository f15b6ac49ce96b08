//! Demand-paged virtual memory for KidneyOS user processes.
//!
//! The kernel supplies the physical frame allocator ([`mem::FramePool`]), the
//! page-table adapter ([`mem::PageDirectory`]), files ([`fs::File`]) and the
//! swap block device ([`block::BlockOp`]). This crate decides what lives in
//! which frame.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod fs;
pub mod mem;
pub mod swapping;
pub mod sync;
pub mod system;

pub use config::VmConfig;
pub use mem::{Result, VirtualMemory, VmError};
