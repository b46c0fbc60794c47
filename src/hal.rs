use crate::{HostPhysAddr, HostVirtAddr, Result};

/// The signature of the `execute_entry` trampoline exported by the VMM.
///
/// It switches to `stack`, calls `func(arg1, arg2)` and returns its status.
pub type ExecuteEntryFn =
    unsafe extern "C" fn(stack: *mut u8, func: usize, arg1: u64, arg2: u64) -> i64;

/// Platform services consumed by the loader and the lifecycle manager.
///
/// All methods are associated functions, the platform being a process-wide
/// singleton.
pub trait VmmHal {
    /// Allocates `size` bytes of readable, writable and executable memory.
    fn alloc_exec(size: usize) -> Option<HostVirtAddr>;
    /// Frees memory obtained from [`VmmHal::alloc_exec`].
    fn free_exec(vaddr: HostVirtAddr, size: usize);
    /// Allocates `size` bytes of readable and writable memory.
    fn alloc_rw(size: usize) -> Option<HostVirtAddr>;
    /// Frees memory obtained from [`VmmHal::alloc_rw`].
    fn free_rw(vaddr: HostVirtAddr, size: usize);

    /// Translates a host virtual address to a host physical address.
    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr;
    /// Translates a host physical address to a host virtual address.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;

    /// The number of logical CPUs the VMM is started on.
    fn cpu_count() -> usize;
    /// Pins the calling context to `cpu`, returning the previous affinity.
    fn set_affinity(cpu: usize) -> Result<usize>;
    /// Restores an affinity returned by [`VmmHal::set_affinity`].
    fn restore_affinity(prior: usize);

    /// Called on each CPU after its `start_vmm` entry succeeded.
    fn on_start() {}
    /// Called on each CPU after its `stop_vmm` entry succeeded.
    fn on_stop() {}

    /// Calls `entry(arg1, arg2)` through the VMM's trampoline on `stack_top`.
    ///
    /// # Safety
    ///
    /// `trampoline` must be the relocated address of an [`ExecuteEntryFn`], `entry`
    /// must be a relocated function of a loaded image and `stack_top` must be the top
    /// of a live, 16-byte aligned stack.
    unsafe fn execute_entry(
        trampoline: usize,
        stack_top: HostVirtAddr,
        entry: usize,
        arg1: u64,
        arg2: u64,
    ) -> i64 {
        let execute_entry: ExecuteEntryFn = unsafe { core::mem::transmute(trampoline) };
        unsafe { execute_entry(stack_top.as_mut_ptr(), entry, arg1, arg2) }
    }
}
