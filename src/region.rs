use core::marker::PhantomData;

use crate::{HostVirtAddr, Result, VmmError, VmmHal};

/// Size of the dedicated stack every entry point runs on.
pub const CALL_STACK_SIZE: usize = 0x8000;

/// A block of executable memory holding one loaded image, freed when dropped.
#[derive(Debug)]
pub struct ExecRegion<H: VmmHal> {
    base: HostVirtAddr,
    size: usize,
    _marker: PhantomData<H>,
}

impl<H: VmmHal> ExecRegion<H> {
    /// Allocate an [`ExecRegion`] of `size` bytes.
    pub fn alloc(size: usize) -> Result<Self> {
        let base = H::alloc_exec(size).ok_or(VmmError::OutOfMemory)?;
        assert_ne!(base.as_usize(), 0);
        debug!("[VMM] allocated ExecRegion({:#x}, {:#x})", base.as_usize(), size);
        Ok(Self {
            base,
            size,
            _marker: PhantomData,
        })
    }

    /// Allocate an [`ExecRegion`] and fill it with zeros.
    pub fn alloc_zero(size: usize) -> Result<Self> {
        let mut region = Self::alloc(size)?;
        region.fill(0);
        Ok(region)
    }

    pub fn base(&self) -> HostVirtAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.base.as_mut_ptr()
    }

    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, self.size) }
    }

    /// Copies `src` to `offset` bytes past the start of the region.
    ///
    /// Fails with [`VmmError::FormatError`] if the copy would leave the region.
    pub fn copy_from(&mut self, offset: usize, src: &[u8]) -> Result {
        let end = offset
            .checked_add(src.len())
            .ok_or(VmmError::FormatError)?;
        if end > self.size {
            return Err(VmmError::FormatError);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.as_mut_ptr().add(offset), src.len())
        };
        Ok(())
    }
}

impl<H: VmmHal> Drop for ExecRegion<H> {
    fn drop(&mut self) {
        H::free_exec(self.base, self.size);
        debug!("[VMM] deallocated ExecRegion({:#x})", self.base.as_usize());
    }
}

/// The stack shared by all entry-point calls, freed when dropped.
#[derive(Debug)]
pub struct CallStack<H: VmmHal> {
    base: HostVirtAddr,
    _marker: PhantomData<H>,
}

impl<H: VmmHal> CallStack<H> {
    pub fn alloc() -> Result<Self> {
        let base = H::alloc_rw(CALL_STACK_SIZE).ok_or(VmmError::OutOfMemory)?;
        assert_ne!(base.as_usize(), 0);
        Ok(Self {
            base,
            _marker: PhantomData,
        })
    }

    /// The 16-byte aligned initial stack pointer.
    pub fn top(&self) -> HostVirtAddr {
        HostVirtAddr::from((self.base.as_usize() + CALL_STACK_SIZE - 1) & !0xf)
    }
}

impl<H: VmmHal> Drop for CallStack<H> {
    fn drop(&mut self) {
        H::free_rw(self.base, CALL_STACK_SIZE);
        debug!("[VMM] deallocated CallStack({:#x})", self.base.as_usize());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::MockHal;

    #[test]
    fn test_exec_region_zeroed_and_freed() {
        MockHal::reset();
        {
            let region = ExecRegion::<MockHal>::alloc_zero(0x2345).unwrap();
            assert_eq!(region.size(), 0x2345);
            let bytes = unsafe { core::slice::from_raw_parts(region.as_mut_ptr(), region.size()) };
            assert!(bytes.iter().all(|b| *b == 0));
            assert_eq!(MockHal::live_exec_allocations(), 1);
        }
        assert_eq!(MockHal::live_exec_allocations(), 0);
    }

    #[test]
    fn test_exec_region_copy_bounds() {
        MockHal::reset();
        let mut region = ExecRegion::<MockHal>::alloc_zero(0x100).unwrap();
        assert!(region.copy_from(0xf0, &[0xaa; 0x10]).is_ok());
        assert_eq!(region.copy_from(0xf1, &[0xaa; 0x10]), Err(VmmError::FormatError));
        assert_eq!(region.copy_from(usize::MAX, &[0xaa]), Err(VmmError::FormatError));
        assert_eq!(unsafe { *region.as_mut_ptr().add(0xff) }, 0xaa);
    }

    #[test]
    fn test_exec_region_out_of_memory() {
        MockHal::reset();
        MockHal::fail_exec_allocations(true);
        assert_eq!(
            ExecRegion::<MockHal>::alloc(0x1000).unwrap_err(),
            VmmError::OutOfMemory
        );
    }

    #[test]
    fn test_call_stack_top_alignment() {
        MockHal::reset();
        let stack = CallStack::<MockHal>::alloc().unwrap();
        let top = stack.top().as_usize();
        assert_eq!(top % 16, 0);
        assert!(top > stack.base.as_usize());
        assert!(top < stack.base.as_usize() + CALL_STACK_SIZE);
        drop(stack);
        assert_eq!(MockHal::live_rw_allocations(), 0);
    }
}
