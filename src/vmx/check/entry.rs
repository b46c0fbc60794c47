//! Checks on the VM-entry control fields (SDM Vol. 3C, Section 26.2.1.3).

use bit_field::BitField;
use x86_64::registers::control::Cr0Flags;

use super::{
    Ctx, Rule, always, capability_msr, check_msr_area, check_reserved_bits, invalid_field,
    unsupported,
};
use crate::Result;
use crate::msr::Msr;
use crate::vmx::vmcs::{EventInjection, VmcsField};

pub(super) const RULES: &[Rule] = &[
    Rule {
        name: "entry_ctls_reserved",
        applies: always,
        check: entry_reserved,
    },
    Rule {
        name: "event_injection_type_vector",
        applies: injects_event,
        check: event_type_and_vector,
    },
    Rule {
        name: "event_injection_deliver_error_code",
        applies: injects_error_code,
        check: deliver_error_code,
    },
    Rule {
        name: "event_injection_reserved_bits",
        applies: injects_event,
        check: event_reserved_bits,
    },
    Rule {
        name: "event_injection_error_code",
        applies: injects_error_code,
        check: error_code,
    },
    Rule {
        name: "event_injection_instruction_length",
        applies: injects_event,
        check: instruction_length,
    },
    Rule {
        name: "entry_msr_load_area",
        applies: always,
        check: |ctx, rule| {
            check_msr_area(
                ctx,
                rule,
                VmcsField::VMENTRY_MSR_LOAD_COUNT,
                VmcsField::VMENTRY_MSR_LOAD_ADDR,
            )
        },
    },
];

/// Exceptions that push an error code.
const ERROR_CODE_VECTORS: [u8; 7] = [8, 10, 11, 12, 13, 14, 17];

/// Bit 27 of the allowed-1 settings of the primary processor-based controls.
const MONITOR_TRAP_FLAG_ALLOWED1: u32 = 27;

fn event(ctx: &Ctx) -> Result<EventInjection> {
    ctx.read(VmcsField::VMENTRY_INTERRUPTION_INFO_FIELD)
        .map(EventInjection)
}

fn injects_event(ctx: &Ctx) -> Result<bool> {
    Ok(event(ctx)?.is_valid())
}

fn injects_error_code(ctx: &Ctx) -> Result<bool> {
    let event = event(ctx)?;
    Ok(event.is_valid() && event.deliver_error_code())
}

fn supports_monitor_trap_flag(proc_cap: u64) -> bool {
    (proc_cap >> 32).get_bit(MONITOR_TRAP_FLAG_ALLOWED1 as usize)
}

fn entry_reserved(ctx: &Ctx, _: &'static str) -> Result {
    let cap = ctx.msr(capability_msr!(ctx, ENTRY));
    check_reserved_bits("entry", cap, ctx.entry)
}

fn event_type_and_vector(ctx: &Ctx, rule: &'static str) -> Result {
    let event = event(ctx)?;
    let ty = event.event_type();
    let vector = event.vector();

    if ty == EventInjection::TYPE_RESERVED {
        return Err(invalid_field(rule, "interruption type 1 is reserved", event.0));
    }
    if ty == EventInjection::TYPE_OTHER_EVENT {
        let cap = ctx.msr(capability_msr!(ctx, PROCBASED));
        if !supports_monitor_trap_flag(cap) {
            return Err(unsupported(
                rule,
                "interruption type 7 is reserved on this hardware",
                event.0,
                cap,
            ));
        }
    }
    if ty == EventInjection::TYPE_NMI && vector != 2 {
        return Err(invalid_field(rule, "vector must be 2 if the type is NMI", event.0));
    }
    if ty == EventInjection::TYPE_HARDWARE_EXCEPTION && vector > 31 {
        return Err(invalid_field(
            rule,
            "vector must be 0-31 if the type is hardware exception",
            event.0,
        ));
    }
    if ty == EventInjection::TYPE_OTHER_EVENT && vector != 0 {
        return Err(invalid_field(rule, "vector must be 0 if the type is other event", event.0));
    }
    Ok(())
}

fn deliver_error_code(ctx: &Ctx, rule: &'static str) -> Result {
    let event = event(ctx)?;

    if ctx.unrestricted_guest() {
        let cr0 = Cr0Flags::from_bits_truncate(ctx.read(VmcsField::GUEST_CR0)?);
        if !cr0.contains(Cr0Flags::PROTECTED_MODE_ENABLE) {
            return Err(invalid_field(
                rule,
                "guest cr0.PE must be 1 to deliver an error code with unrestricted guest",
                event.0,
            ));
        }
    }
    if event.event_type() != EventInjection::TYPE_HARDWARE_EXCEPTION {
        return Err(invalid_field(
            rule,
            "type must be hardware exception if deliver error code is 1",
            event.0,
        ));
    }
    if !ERROR_CODE_VECTORS.contains(&event.vector()) {
        return Err(invalid_field(
            rule,
            "vector must be an exception that delivers an error code",
            event.0,
        ));
    }
    Ok(())
}

fn event_reserved_bits(ctx: &Ctx, rule: &'static str) -> Result {
    let event = event(ctx)?;
    if event.reserved_bits() != 0 {
        return Err(invalid_field(
            rule,
            "reserved bits of the interruption info field must be 0",
            event.0,
        ));
    }
    Ok(())
}

fn error_code(ctx: &Ctx, rule: &'static str) -> Result {
    let code = ctx.read(VmcsField::VMENTRY_EXCEPTION_ERR_CODE)?;
    if code.get_bits(15..32) != 0 {
        return Err(invalid_field(rule, "bits 31:15 of the exception error code must be 0", code));
    }
    Ok(())
}

fn instruction_length(ctx: &Ctx, rule: &'static str) -> Result {
    let ty = event(ctx)?.event_type();
    if !matches!(
        ty,
        EventInjection::TYPE_SOFTWARE_INTERRUPT
            | EventInjection::TYPE_PRIVILEGED_SOFTWARE_EXCEPTION
            | EventInjection::TYPE_SOFTWARE_EXCEPTION
    ) {
        return Ok(());
    }
    let len = ctx.read(VmcsField::VMENTRY_INSTRUCTION_LEN)?;
    if !(1..=15).contains(&len) {
        return Err(invalid_field(
            rule,
            "instruction length must be 1-15 for software interrupts and exceptions",
            len,
        ));
    }
    Ok(())
}
