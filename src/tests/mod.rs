//! Unit tests for the x86_vmm crate.
//!
//! This module contains the lifecycle, image-set and VMCS control-check suites,
//! all run against the mocks in `test_utils`.
