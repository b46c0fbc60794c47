mod check;
mod controls;
mod vmcs;

pub use self::check::{
    check_vm_entry_controls, check_vm_execution_controls, check_vm_exit_controls,
    check_vmcs_control_state,
};
pub use self::controls::{
    EntryControls, EptVpidCap, ExitControls, PinbasedControls, PrimaryControls,
    SecondaryControls, VmFunctionControls,
};
pub use self::vmcs::{ControlSource, EventInjection, VmcsField};

cfg_if::cfg_if! {
    if #[cfg(all(feature = "vmx", target_arch = "x86_64"))] {
        mod hardware;
        pub use self::hardware::HardwareVmcs;

        /// Return if current platform support virtualization extension.
        pub fn has_hardware_support() -> bool {
            if let Some(feature) = raw_cpuid::CpuId::new().get_feature_info() {
                feature.has_vmx()
            } else {
                false
            }
        }
    }
}
