//! Test doubles for the platform, the relocation service and the VMCS.

pub mod mock;
