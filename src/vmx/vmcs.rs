use bit_field::BitField;

use crate::Result;
use crate::msr::Msr;

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
/// VMCS fields read by the control checks (SDM Vol. 3D, Appendix B).
pub enum VmcsField {
    // 16-bit control fields
    VPID = 0x0000,
    POSTED_INTR_NOTIFICATION_VECTOR = 0x0002,

    // 64-bit control fields
    IO_BITMAP_A_ADDR = 0x2000,
    IO_BITMAP_B_ADDR = 0x2002,
    MSR_BITMAPS_ADDR = 0x2004,
    VMEXIT_MSR_STORE_ADDR = 0x2006,
    VMEXIT_MSR_LOAD_ADDR = 0x2008,
    VMENTRY_MSR_LOAD_ADDR = 0x200A,
    VIRT_APIC_ADDR = 0x2012,
    APIC_ACCESS_ADDR = 0x2014,
    POSTED_INTR_DESC_ADDR = 0x2016,
    VM_FUNCTION_CONTROLS = 0x2018,
    EPTP = 0x201A,
    EPTP_LIST_ADDR = 0x2024,
    VMREAD_BITMAP_ADDR = 0x2026,
    VMWRITE_BITMAP_ADDR = 0x2028,
    VIRT_EXCEPTION_INFO_ADDR = 0x202A,

    // 32-bit control fields
    PINBASED_EXEC_CONTROLS = 0x4000,
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    CR3_TARGET_COUNT = 0x400A,
    VMEXIT_CONTROLS = 0x400C,
    VMEXIT_MSR_STORE_COUNT = 0x400E,
    VMEXIT_MSR_LOAD_COUNT = 0x4010,
    VMENTRY_CONTROLS = 0x4012,
    VMENTRY_MSR_LOAD_COUNT = 0x4014,
    VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
    VMENTRY_EXCEPTION_ERR_CODE = 0x4018,
    VMENTRY_INSTRUCTION_LEN = 0x401A,
    TPR_THRESHOLD = 0x401C,
    SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401E,

    // natural-width guest-state fields
    GUEST_CR0 = 0x6800,
}
}

/// Read access to a VMCS and the VMX capability MSRs of the processor it
/// will be launched on.
///
/// All methods must be free of side effects.
pub trait ControlSource {
    /// Reads a field of the current VMCS.
    fn read_field(&self, field: VmcsField) -> Result<u64>;
    /// Reads a VMX capability MSR.
    fn read_msr(&self, msr: Msr) -> u64;
    /// The processor's physical-address width (`MAXPHYADDR`).
    fn phys_addr_width(&self) -> u8;
    /// Maps a host physical address to a readable virtual address.
    fn phys_to_virt(&self, paddr: u64) -> Option<usize>;
}

/// The VM-entry interruption-information field (SDM Vol. 3C, Section 24.8.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInjection(pub u64);

impl EventInjection {
    pub const TYPE_EXTERNAL_INTERRUPT: u8 = 0;
    pub const TYPE_RESERVED: u8 = 1;
    pub const TYPE_NMI: u8 = 2;
    pub const TYPE_HARDWARE_EXCEPTION: u8 = 3;
    pub const TYPE_SOFTWARE_INTERRUPT: u8 = 4;
    pub const TYPE_PRIVILEGED_SOFTWARE_EXCEPTION: u8 = 5;
    pub const TYPE_SOFTWARE_EXCEPTION: u8 = 6;
    pub const TYPE_OTHER_EVENT: u8 = 7;

    /// Bits 30:12 of the field.
    pub const RESERVED_MASK: u64 = 0x7FFF_F000;

    /// Encodes a valid event.
    pub fn new(ty: u8, vector: u8, deliver_error_code: bool) -> Self {
        let mut info = 0u64;
        info.set_bits(0..8, vector as u64)
            .set_bits(8..11, ty as u64)
            .set_bit(11, deliver_error_code)
            .set_bit(31, true);
        Self(info)
    }

    pub fn is_valid(&self) -> bool {
        self.0.get_bit(31)
    }

    pub fn event_type(&self) -> u8 {
        self.0.get_bits(8..11) as u8
    }

    pub fn vector(&self) -> u8 {
        self.0.get_bits(0..8) as u8
    }

    pub fn deliver_error_code(&self) -> bool {
        self.0.get_bit(11)
    }

    pub fn reserved_bits(&self) -> u64 {
        self.0 & Self::RESERVED_MASK
    }
}
