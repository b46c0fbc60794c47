use core::marker::PhantomData;

use raw_cpuid::CpuId;

use super::vmcs::{ControlSource, VmcsField};
use crate::msr::Msr;
use crate::{HostPhysAddr, Result, VmmError, VmmHal};

/// Physical-address width assumed when CPUID leaf 0x8000_0008 is missing.
const DEFAULT_PHYS_ADDR_WIDTH: u8 = 36;

/// The VMCS that is current on this CPU, read with `vmread`.
///
/// Must only be used in VMX root operation with a current VMCS loaded.
pub struct HardwareVmcs<H: VmmHal> {
    phys_addr_width: u8,
    _marker: PhantomData<H>,
}

impl<H: VmmHal> HardwareVmcs<H> {
    pub fn new() -> Self {
        let phys_addr_width = CpuId::new()
            .get_processor_capacity_feature_info()
            .map_or(DEFAULT_PHYS_ADDR_WIDTH, |info| info.physical_address_bits());
        Self {
            phys_addr_width,
            _marker: PhantomData,
        }
    }
}

impl<H: VmmHal> Default for HardwareVmcs<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: VmmHal> ControlSource for HardwareVmcs<H> {
    fn read_field(&self, field: VmcsField) -> Result<u64> {
        unsafe { x86::bits64::vmx::vmread(field as u32) }.map_err(|err| {
            warn!("[VMX] vmread({field:?}) failed: {err:?}");
            VmmError::VmcsReadFailed(field)
        })
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        msr.read()
    }

    fn phys_addr_width(&self) -> u8 {
        self.phys_addr_width
    }

    fn phys_to_virt(&self, paddr: u64) -> Option<usize> {
        let paddr = usize::try_from(paddr).ok()?;
        Some(H::phys_to_virt(HostPhysAddr::from(paddr)).as_usize())
    }
}
