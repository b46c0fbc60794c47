//! Checks on the VM-execution control fields (SDM Vol. 3C, Section 26.2.1.1).

use super::{
    Ctx, Rule, always, capability_msr, check_reserved_bits, invalid_address, invalid_field,
    misaligned, require_page_address, require_page_aligned, require_width, unsupported,
};
use crate::Result;
use crate::msr::Msr;
use crate::vmx::controls::{
    EptVpidCap, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls,
    VmFunctionControls,
};
use crate::vmx::vmcs::VmcsField;

pub(super) const RULES: &[Rule] = &[
    Rule {
        name: "pin_based_ctls_reserved",
        applies: always,
        check: pin_based_reserved,
    },
    Rule {
        name: "proc_based_ctls_reserved",
        applies: always,
        check: proc_based_reserved,
    },
    Rule {
        name: "proc_based_ctls2_reserved",
        applies: always,
        check: proc_based2_reserved,
    },
    Rule {
        name: "cr3_target_count",
        applies: always,
        check: cr3_target_count,
    },
    Rule {
        name: "io_bitmap_address",
        applies: |ctx| Ok(ctx.proc().contains(PrimaryControls::USE_IO_BITMAPS)),
        check: io_bitmap_address,
    },
    Rule {
        name: "msr_bitmap_address",
        applies: |ctx| Ok(ctx.proc().contains(PrimaryControls::USE_MSR_BITMAPS)),
        check: msr_bitmap_address,
    },
    Rule {
        name: "tpr_shadow_and_virtual_apic",
        applies: |ctx| Ok(ctx.proc().contains(PrimaryControls::USE_TPR_SHADOW)),
        check: tpr_shadow_and_virtual_apic,
    },
    Rule {
        name: "nmi_exiting_and_virtual_nmi",
        applies: |ctx| Ok(!ctx.pin().contains(PinbasedControls::NMI_EXITING)),
        check: nmi_exiting_and_virtual_nmi,
    },
    Rule {
        name: "virtual_nmi_and_nmi_window",
        applies: |ctx| Ok(!ctx.pin().contains(PinbasedControls::VIRTUAL_NMIS)),
        check: virtual_nmi_and_nmi_window,
    },
    Rule {
        name: "apic_access_address",
        applies: |ctx| Ok(ctx.proc2().contains(SecondaryControls::VIRTUALIZE_APIC)),
        check: apic_access_address,
    },
    Rule {
        name: "x2apic_mode_and_tpr_shadow",
        applies: without_tpr_shadow,
        check: x2apic_mode_and_tpr_shadow,
    },
    Rule {
        name: "apic_register_virtualization_and_tpr_shadow",
        applies: without_tpr_shadow,
        check: apic_register_virtualization_and_tpr_shadow,
    },
    Rule {
        name: "virtual_interrupt_delivery_and_tpr_shadow",
        applies: without_tpr_shadow,
        check: virtual_interrupt_delivery_and_tpr_shadow,
    },
    Rule {
        name: "x2apic_mode_and_apic_access",
        applies: |ctx| Ok(ctx.proc2().contains(SecondaryControls::VIRTUALIZE_X2APIC)),
        check: x2apic_mode_and_apic_access,
    },
    Rule {
        name: "virtual_interrupt_delivery_and_external_interrupt",
        applies: |ctx| {
            Ok(ctx
                .proc2()
                .contains(SecondaryControls::VIRTUAL_INTERRUPT_DELIVERY))
        },
        check: virtual_interrupt_delivery_and_external_interrupt,
    },
    Rule {
        name: "posted_interrupts",
        applies: |ctx| {
            Ok(ctx
                .pin()
                .contains(PinbasedControls::PROCESS_POSTED_INTERRUPTS))
        },
        check: posted_interrupts,
    },
    Rule {
        name: "vpid",
        applies: |ctx| Ok(ctx.proc2().contains(SecondaryControls::ENABLE_VPID)),
        check: vpid,
    },
    Rule {
        name: "ept_pointer",
        applies: |ctx| Ok(ctx.proc2().contains(SecondaryControls::ENABLE_EPT)),
        check: ept_pointer,
    },
    Rule {
        name: "unrestricted_guest",
        applies: |ctx| Ok(ctx.unrestricted_guest()),
        check: unrestricted_guest,
    },
    Rule {
        name: "vm_functions",
        applies: |ctx| Ok(ctx.proc2().contains(SecondaryControls::ENABLE_VM_FUNCTIONS)),
        check: vm_functions,
    },
    Rule {
        name: "vmcs_shadowing",
        applies: |ctx| Ok(ctx.proc2().contains(SecondaryControls::VMCS_SHADOWING)),
        check: vmcs_shadowing,
    },
    Rule {
        name: "ept_violation_ve",
        applies: |ctx| Ok(ctx.proc2().contains(SecondaryControls::EPT_VIOLATION_VE)),
        check: ept_violation_ve,
    },
];

fn without_tpr_shadow(ctx: &Ctx) -> Result<bool> {
    Ok(!ctx.proc().contains(PrimaryControls::USE_TPR_SHADOW))
}

fn pin_based_reserved(ctx: &Ctx, _: &'static str) -> Result {
    let cap = ctx.msr(capability_msr!(ctx, PINBASED));
    check_reserved_bits("pin based", cap, ctx.pin)
}

fn proc_based_reserved(ctx: &Ctx, _: &'static str) -> Result {
    let cap = ctx.msr(capability_msr!(ctx, PROCBASED));
    check_reserved_bits("proc based", cap, ctx.proc)
}

fn proc_based2_reserved(ctx: &Ctx, _: &'static str) -> Result {
    let cap = ctx.msr(Msr::IA32_VMX_PROCBASED_CTLS2);
    check_reserved_bits("secondary proc based", cap, ctx.proc2)
}

fn cr3_target_count(ctx: &Ctx, rule: &'static str) -> Result {
    let count = ctx.read(VmcsField::CR3_TARGET_COUNT)?;
    if count > 4 {
        return Err(invalid_field(rule, "cr3 target count must not exceed 4", count));
    }
    Ok(())
}

fn io_bitmap_address(ctx: &Ctx, rule: &'static str) -> Result {
    let addr_a = ctx.read(VmcsField::IO_BITMAP_A_ADDR)?;
    let addr_b = ctx.read(VmcsField::IO_BITMAP_B_ADDR)?;
    require_page_aligned(rule, "io bitmap a addr not page aligned", addr_a)?;
    require_page_aligned(rule, "io bitmap b addr not page aligned", addr_b)?;
    require_width(ctx, rule, "io bitmap a addr too large", addr_a)?;
    require_width(ctx, rule, "io bitmap b addr too large", addr_b)
}

fn msr_bitmap_address(ctx: &Ctx, rule: &'static str) -> Result {
    let addr = ctx.read(VmcsField::MSR_BITMAPS_ADDR)?;
    require_page_aligned(rule, "msr bitmap addr not page aligned", addr)?;
    require_width(ctx, rule, "msr bitmap addr too large", addr)
}

/// Offset of the VTPR in the virtual-APIC page.
const VTPR_OFFSET: usize = 0x80;

fn tpr_shadow_and_virtual_apic(ctx: &Ctx, rule: &'static str) -> Result {
    let apic_paddr = ctx.read(VmcsField::VIRT_APIC_ADDR)?;
    require_page_address(ctx, rule, apic_paddr)?;

    let proc2 = ctx.proc2();
    if !proc2.contains(SecondaryControls::VIRTUAL_INTERRUPT_DELIVERY) {
        return Ok(());
    }
    let threshold = ctx.read(VmcsField::TPR_THRESHOLD)?;
    if threshold & 0xFFFF_FFF0 != 0 {
        return Err(invalid_field(rule, "bits 31:4 of the tpr threshold must be 0", threshold));
    }

    if !proc2.contains(SecondaryControls::VIRTUALIZE_APIC) {
        return Ok(());
    }
    let apic_vaddr = ctx
        .src
        .phys_to_virt(apic_paddr)
        .filter(|vaddr| *vaddr != 0)
        .ok_or_else(|| invalid_address(rule, "virtual apic page is not mapped", apic_paddr))?;
    let vtpr = unsafe { core::ptr::read_volatile((apic_vaddr + VTPR_OFFSET) as *const u32) };
    if threshold & 0xF > ((vtpr & 0xF0) >> 4) as u64 {
        return Err(unsupported(
            rule,
            "tpr threshold exceeds vtpr[7:4]",
            threshold,
            vtpr as u64,
        ));
    }
    Ok(())
}

fn nmi_exiting_and_virtual_nmi(ctx: &Ctx, rule: &'static str) -> Result {
    if ctx.pin().contains(PinbasedControls::VIRTUAL_NMIS) {
        return Err(invalid_field(rule, "virtual NMI must be 0 if NMI exiting is 0", ctx.pin));
    }
    Ok(())
}

fn virtual_nmi_and_nmi_window(ctx: &Ctx, rule: &'static str) -> Result {
    if ctx.proc().contains(PrimaryControls::NMI_WINDOW_EXITING) {
        return Err(invalid_field(
            rule,
            "NMI window exiting must be 0 if virtual NMI is 0",
            ctx.proc,
        ));
    }
    Ok(())
}

fn apic_access_address(ctx: &Ctx, rule: &'static str) -> Result {
    let addr = ctx.read(VmcsField::APIC_ACCESS_ADDR)?;
    require_page_address(ctx, rule, addr)
}

fn x2apic_mode_and_tpr_shadow(ctx: &Ctx, rule: &'static str) -> Result {
    if ctx.proc2().contains(SecondaryControls::VIRTUALIZE_X2APIC) {
        return Err(invalid_field(rule, "x2apic mode must be 0 if use tpr shadow is 0", ctx.proc2));
    }
    Ok(())
}

fn apic_register_virtualization_and_tpr_shadow(ctx: &Ctx, rule: &'static str) -> Result {
    if ctx.proc2().contains(SecondaryControls::VIRTUALIZE_APIC_REGISTER) {
        return Err(invalid_field(
            rule,
            "apic register virtualization must be 0 if use tpr shadow is 0",
            ctx.proc2,
        ));
    }
    Ok(())
}

fn virtual_interrupt_delivery_and_tpr_shadow(ctx: &Ctx, rule: &'static str) -> Result {
    if ctx
        .proc2()
        .contains(SecondaryControls::VIRTUAL_INTERRUPT_DELIVERY)
    {
        return Err(invalid_field(
            rule,
            "virtual interrupt delivery must be 0 if use tpr shadow is 0",
            ctx.proc2,
        ));
    }
    Ok(())
}

fn x2apic_mode_and_apic_access(ctx: &Ctx, rule: &'static str) -> Result {
    if ctx.proc2().contains(SecondaryControls::VIRTUALIZE_APIC) {
        return Err(invalid_field(rule, "apic accesses must be 0 if x2apic mode is 1", ctx.proc2));
    }
    Ok(())
}

fn virtual_interrupt_delivery_and_external_interrupt(ctx: &Ctx, rule: &'static str) -> Result {
    if !ctx
        .pin()
        .contains(PinbasedControls::EXTERNAL_INTERRUPT_EXITING)
    {
        return Err(invalid_field(
            rule,
            "external interrupt exiting must be 1 if virtual interrupt delivery is 1",
            ctx.pin,
        ));
    }
    Ok(())
}

fn posted_interrupts(ctx: &Ctx, rule: &'static str) -> Result {
    if !ctx
        .proc2()
        .contains(SecondaryControls::VIRTUAL_INTERRUPT_DELIVERY)
    {
        return Err(invalid_field(
            rule,
            "virtual interrupt delivery must be 1 if posted interrupts is 1",
            ctx.proc2,
        ));
    }
    if !ctx.exit().contains(ExitControls::ACK_INTERRUPT_ON_EXIT) {
        return Err(invalid_field(
            rule,
            "ack interrupt on exit must be 1 if posted interrupts is 1",
            ctx.exit,
        ));
    }

    let vector = ctx.read(VmcsField::POSTED_INTR_NOTIFICATION_VECTOR)?;
    if vector & !0xFF != 0 {
        return Err(invalid_field(
            rule,
            "bits 15:8 of the notification vector must be 0",
            vector,
        ));
    }

    let addr = ctx.read(VmcsField::POSTED_INTR_DESC_ADDR)?;
    if addr & 0x3F != 0 {
        return Err(misaligned(
            rule,
            "bits 5:0 of the posted interrupt descriptor addr must be 0",
            addr,
        ));
    }
    require_width(ctx, rule, "posted interrupt descriptor addr too large", addr)
}

fn vpid(ctx: &Ctx, rule: &'static str) -> Result {
    let vpid = ctx.read(VmcsField::VPID)?;
    if vpid == 0 {
        return Err(invalid_field(rule, "vpid cannot equal 0", vpid));
    }
    Ok(())
}

/// EPT memory types allowed in bits 2:0 of the EPT pointer.
const EPT_MEMORY_TYPE_UC: u64 = 0;
const EPT_MEMORY_TYPE_WB: u64 = 6;

fn ept_pointer(ctx: &Ctx, rule: &'static str) -> Result {
    let eptp = ctx.read(VmcsField::EPTP)?;
    let raw_cap = ctx.msr(Msr::IA32_VMX_EPT_VPID_CAP);
    let cap = EptVpidCap::from_bits_truncate(raw_cap);

    match eptp & 0x7 {
        EPT_MEMORY_TYPE_UC if !cap.contains(EptVpidCap::MEMORY_TYPE_UC) => {
            return Err(unsupported(
                rule,
                "hardware does not support ept memory type: uncacheable",
                eptp,
                raw_cap,
            ));
        }
        EPT_MEMORY_TYPE_WB if !cap.contains(EptVpidCap::MEMORY_TYPE_WB) => {
            return Err(unsupported(
                rule,
                "hardware does not support ept memory type: write-back",
                eptp,
                raw_cap,
            ));
        }
        EPT_MEMORY_TYPE_UC | EPT_MEMORY_TYPE_WB => {}
        _ => return Err(invalid_field(rule, "unknown eptp memory type", eptp)),
    }

    if (eptp >> 3) & 0x7 != 3 {
        return Err(invalid_field(rule, "the ept page-walk length must be 3", eptp));
    }
    if eptp & (1 << 6) != 0 && !cap.contains(EptVpidCap::ACCESSED_DIRTY) {
        return Err(unsupported(
            rule,
            "hardware does not support accessed / dirty flags for ept",
            eptp,
            raw_cap,
        ));
    }
    if eptp & 0xFFFF_0000_0000_0F80 != 0 {
        return Err(invalid_field(rule, "bits 11:7 and 63:48 of the eptp must be 0", eptp));
    }
    Ok(())
}

fn unrestricted_guest(ctx: &Ctx, rule: &'static str) -> Result {
    if !ctx.proc2().contains(SecondaryControls::ENABLE_EPT) {
        return Err(invalid_field(
            rule,
            "enable ept must be 1 if unrestricted guest is 1",
            ctx.proc2,
        ));
    }
    Ok(())
}

fn vm_functions(ctx: &Ctx, rule: &'static str) -> Result {
    let controls = ctx.read(VmcsField::VM_FUNCTION_CONTROLS)?;
    let cap = ctx.msr(Msr::IA32_VMX_VMFUNC);
    if controls & !cap != 0 {
        return Err(unsupported(rule, "unsupported vm function control bit set", controls, cap));
    }

    if !VmFunctionControls::from_bits_truncate(controls).contains(VmFunctionControls::EPTP_SWITCHING) {
        return Ok(());
    }
    if !ctx.proc2().contains(SecondaryControls::ENABLE_EPT) {
        return Err(invalid_field(
            rule,
            "enable ept must be 1 if eptp switching is 1",
            ctx.proc2,
        ));
    }
    let list = ctx.read(VmcsField::EPTP_LIST_ADDR)?;
    require_page_aligned(rule, "bits 11:0 of the eptp list address must be 0", list)?;
    require_width(ctx, rule, "eptp list address too large", list)
}

fn vmcs_shadowing(ctx: &Ctx, rule: &'static str) -> Result {
    let vmread = ctx.read(VmcsField::VMREAD_BITMAP_ADDR)?;
    let vmwrite = ctx.read(VmcsField::VMWRITE_BITMAP_ADDR)?;
    require_page_aligned(rule, "bits 11:0 of the vmread bitmap address must be 0", vmread)?;
    require_page_aligned(rule, "bits 11:0 of the vmwrite bitmap address must be 0", vmwrite)?;
    require_width(ctx, rule, "vmread bitmap address too large", vmread)?;
    require_width(ctx, rule, "vmwrite bitmap address too large", vmwrite)
}

fn ept_violation_ve(ctx: &Ctx, rule: &'static str) -> Result {
    let addr = ctx.read(VmcsField::VIRT_EXCEPTION_INFO_ADDR)?;
    require_page_aligned(
        rule,
        "bits 11:0 of the virtualization exception info address must be 0",
        addr,
    )?;
    require_width(ctx, rule, "virtualization exception info address too large", addr)
}
