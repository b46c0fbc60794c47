//! Checks on the VM-exit control fields (SDM Vol. 3C, Section 26.2.1.2).

use super::{Ctx, Rule, always, capability_msr, check_msr_area, check_reserved_bits, invalid_field};
use crate::Result;
use crate::msr::Msr;
use crate::vmx::controls::{ExitControls, PinbasedControls};
use crate::vmx::vmcs::VmcsField;

pub(super) const RULES: &[Rule] = &[
    Rule {
        name: "exit_ctls_reserved",
        applies: always,
        check: exit_reserved,
    },
    Rule {
        name: "preemption_timer_save",
        applies: |ctx| {
            Ok(!ctx
                .pin()
                .contains(PinbasedControls::ACTIVATE_VMX_PREEMPTION_TIMER))
        },
        check: preemption_timer_save,
    },
    Rule {
        name: "exit_msr_store_area",
        applies: always,
        check: |ctx, rule| {
            check_msr_area(
                ctx,
                rule,
                VmcsField::VMEXIT_MSR_STORE_COUNT,
                VmcsField::VMEXIT_MSR_STORE_ADDR,
            )
        },
    },
    Rule {
        name: "exit_msr_load_area",
        applies: always,
        check: |ctx, rule| {
            check_msr_area(
                ctx,
                rule,
                VmcsField::VMEXIT_MSR_LOAD_COUNT,
                VmcsField::VMEXIT_MSR_LOAD_ADDR,
            )
        },
    },
];

fn exit_reserved(ctx: &Ctx, _: &'static str) -> Result {
    let cap = ctx.msr(capability_msr!(ctx, EXIT));
    check_reserved_bits("exit", cap, ctx.exit)
}

fn preemption_timer_save(ctx: &Ctx, rule: &'static str) -> Result {
    if ctx.exit().contains(ExitControls::SAVE_VMX_PREEMPTION_TIMER) {
        return Err(invalid_field(
            rule,
            "save vmx preemption timer must be 0 if activate vmx preemption timer is 0",
            ctx.exit,
        ));
    }
    Ok(())
}
