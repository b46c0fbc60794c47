#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

mod entry;
mod error;
mod hal;
mod loader;
mod region;
mod vmm;

pub mod msr;
pub mod vmx;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use entry::{ENTRY_SUCCESS, EXECUTE_ENTRY_SYMBOL, EntryPoint, ImageHandle, Scope};
pub use error::{Result, VmmError};
pub use hal::{ExecuteEntryFn, VmmHal};
pub use loader::{ImageLinker, ProgramSegment, SectionInfo, SegmentFlags};
pub use region::CALL_STACK_SIZE;
pub use vmm::{
    DEBUG_RING_SIZE, DebugRingResources, MemoryDescriptor, MemoryType, SharedVmm, VmmManager,
    VmmStatus,
};

/// Host physical address.
pub type HostPhysAddr = memory_addr::PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = memory_addr::VirtAddr;

/// Default capacity of the image table of a [`VmmManager`].
pub const MAX_IMAGES: usize = 75;
