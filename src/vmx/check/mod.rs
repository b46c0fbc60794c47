//! Checks on the VMX control fields (SDM Vol. 3C, Section 26.2.1).
//!
//! Every check is a [`Rule`]; the rules of the execution, exit and entry
//! phases run in a fixed order and the first violation ends the audit.

mod entry;
mod execution;
mod exit;

use super::controls::{ExitControls, PinbasedControls, PrimaryControls, SecondaryControls};
use super::vmcs::{ControlSource, VmcsField};
use crate::msr::Msr;
use crate::{Result, VmmError};

/// Picks the TRUE variant of a capability MSR when the processor has one.
macro_rules! capability_msr {
    ($ctx:expr, $name:ident) => {
        paste::paste! {
            if $ctx.true_ctls {
                Msr::[<IA32_VMX_TRUE_ $name _CTLS>]
            } else {
                Msr::[<IA32_VMX_ $name _CTLS>]
            }
        }
    };
}
pub(crate) use capability_msr;

/// The control fields of the VMCS under audit, read once up front.
pub(crate) struct Ctx<'a> {
    src: &'a dyn ControlSource,
    true_ctls: bool,
    pin: u64,
    proc: u64,
    proc2: u64,
    exit: u64,
    entry: u64,
}

impl<'a> Ctx<'a> {
    fn new(src: &'a dyn ControlSource) -> Result<Self> {
        let true_ctls = src.read_msr(Msr::IA32_VMX_BASIC) & Msr::VMX_BASIC_TRUE_CTLS != 0;
        let pin = src.read_field(VmcsField::PINBASED_EXEC_CONTROLS)?;
        let proc = src.read_field(VmcsField::PRIMARY_PROCBASED_EXEC_CONTROLS)?;
        // The secondary controls are ignored unless activated.
        let proc2 = if proc & PrimaryControls::SECONDARY_CONTROLS.bits() as u64 != 0 {
            src.read_field(VmcsField::SECONDARY_PROCBASED_EXEC_CONTROLS)?
        } else {
            0
        };
        Ok(Self {
            src,
            true_ctls,
            pin,
            proc,
            proc2,
            exit: src.read_field(VmcsField::VMEXIT_CONTROLS)?,
            entry: src.read_field(VmcsField::VMENTRY_CONTROLS)?,
        })
    }

    fn read(&self, field: VmcsField) -> Result<u64> {
        self.src.read_field(field)
    }

    fn msr(&self, msr: Msr) -> u64 {
        self.src.read_msr(msr)
    }

    fn pin(&self) -> PinbasedControls {
        PinbasedControls::from_bits_truncate(self.pin as u32)
    }

    fn proc(&self) -> PrimaryControls {
        PrimaryControls::from_bits_truncate(self.proc as u32)
    }

    fn proc2(&self) -> SecondaryControls {
        SecondaryControls::from_bits_truncate(self.proc2 as u32)
    }

    fn exit(&self) -> ExitControls {
        ExitControls::from_bits_truncate(self.exit as u32)
    }

    fn unrestricted_guest(&self) -> bool {
        self.proc2().contains(SecondaryControls::UNRESTRICTED_GUEST)
    }

    /// Whether no bit of `addr` lies at or above the physical-address width.
    fn has_valid_width(&self, addr: u64) -> bool {
        let width = self.src.phys_addr_width();
        width >= 64 || addr >> width == 0
    }
}

/// One control check: `check` runs only when `applies` holds.
pub(crate) struct Rule {
    pub name: &'static str,
    pub applies: fn(&Ctx) -> Result<bool>,
    pub check: fn(&Ctx, &'static str) -> Result,
}

fn always(_: &Ctx) -> Result<bool> {
    Ok(true)
}

fn run_phase(ctx: &Ctx, phase: &str, rules: &[Rule]) -> Result {
    for rule in rules {
        if !(rule.applies)(ctx)? {
            continue;
        }
        (rule.check)(ctx, rule.name).inspect_err(|err| {
            warn!("[VMX] {phase} control check `{}` failed: {err}", rule.name);
        })?;
    }
    Ok(())
}

/// Checks the VM-execution control fields.
pub fn check_vm_execution_controls(src: &dyn ControlSource) -> Result {
    run_phase(&Ctx::new(src)?, "execution", execution::RULES)
}

/// Checks the VM-exit control fields.
pub fn check_vm_exit_controls(src: &dyn ControlSource) -> Result {
    run_phase(&Ctx::new(src)?, "exit", exit::RULES)
}

/// Checks the VM-entry control fields.
pub fn check_vm_entry_controls(src: &dyn ControlSource) -> Result {
    run_phase(&Ctx::new(src)?, "entry", entry::RULES)
}

/// Runs every control-field check in order and reports the first violation.
///
/// Reads the VMCS and the capability MSRs only; a failure means the VMCS must
/// not be launched.
pub fn check_vmcs_control_state(src: &dyn ControlSource) -> Result {
    let ctx = Ctx::new(src)?;
    run_phase(&ctx, "execution", execution::RULES)?;
    run_phase(&ctx, "exit", exit::RULES)?;
    run_phase(&ctx, "entry", entry::RULES)?;
    trace!("[VMX] control fields passed all checks");
    Ok(())
}

/// The allowed-0/allowed-1 check of a 32-bit control field against its
/// capability MSR.
fn check_reserved_bits(name: &'static str, capability: u64, field: u64) -> Result {
    let low = capability as u32;
    let high = (capability >> 32) as u32;
    if (low & field as u32) != low || (field & !(high as u64)) != 0 {
        return Err(VmmError::InvalidControlBits {
            name,
            low,
            high,
            field_low: field as u32,
            field_high: (field >> 32) as u32,
        });
    }
    Ok(())
}

fn invalid_field(rule: &'static str, reason: &'static str, value: u64) -> VmmError {
    VmmError::InvalidField {
        rule,
        reason,
        value,
        capability: None,
    }
}

fn unsupported(rule: &'static str, reason: &'static str, value: u64, capability: u64) -> VmmError {
    VmmError::InvalidField {
        rule,
        reason,
        value,
        capability: Some(capability),
    }
}

fn misaligned(rule: &'static str, reason: &'static str, addr: u64) -> VmmError {
    VmmError::MisalignedAddress { rule, reason, addr }
}

fn invalid_address(rule: &'static str, reason: &'static str, addr: u64) -> VmmError {
    VmmError::InvalidAddress { rule, reason, addr }
}

const PAGE_OFFSET_MASK: u64 = 0xFFF;

fn require_page_aligned(rule: &'static str, reason: &'static str, addr: u64) -> Result {
    if addr & PAGE_OFFSET_MASK != 0 {
        return Err(misaligned(rule, reason, addr));
    }
    Ok(())
}

fn require_width(ctx: &Ctx, rule: &'static str, reason: &'static str, addr: u64) -> Result {
    if !ctx.has_valid_width(addr) {
        return Err(invalid_address(rule, reason, addr));
    }
    Ok(())
}

/// A required, page-aligned physical address.
fn require_page_address(ctx: &Ctx, rule: &'static str, addr: u64) -> Result {
    if addr == 0 {
        return Err(invalid_address(rule, "physical address is null", addr));
    }
    require_page_aligned(rule, "address not 4k aligned", addr)?;
    require_width(ctx, rule, "address too large", addr)
}

/// An MSR load/store area of `count` 16-byte entries.
fn check_msr_area(ctx: &Ctx, rule: &'static str, count: VmcsField, addr: VmcsField) -> Result {
    let count = ctx.read(count)?;
    if count == 0 {
        return Ok(());
    }
    let addr = ctx.read(addr)?;
    if addr & 0xF != 0 {
        return Err(misaligned(rule, "bits 3:0 of the msr area address must be 0", addr));
    }
    require_width(ctx, rule, "msr area address too large", addr)?;

    let end = count
        .checked_mul(16)
        .and_then(|size| addr.checked_add(size - 1))
        .ok_or_else(|| invalid_address(rule, "end of msr area too large", addr))?;
    require_width(ctx, rule, "end of msr area too large", end)
}
