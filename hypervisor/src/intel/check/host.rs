//! Checks on the host-state area.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.2.2 Checks on Host Control Registers, MSRs, and SSP
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.2.3 Checks on Host Segment and Descriptor-Table Registers
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.2.4 Checks Related to Address-Space Size

use {
    super::{battery, ensure, is_canonical, is_valid_pat, Checker, Context, Outcome, EFER_RESERVED},
    crate::intel::controls::exit,
    bit_field::BitField,
    x86::vmx::vmcs,
    x86_64::registers::{control::Cr4Flags, model_specific::EferFlags},
};

pub const BATTERY: &[Checker] = battery![
    host_cr0,
    host_cr4,
    host_cr3,
    host_sysenter,
    host_pat,
    host_efer,
    host_selectors,
    host_bases,
    address_space_size,
];

fn cr4(context: &Context<'_>) -> u64 {
    context.read(vmcs::host::CR4)
}

fn host_address_space_size(context: &Context<'_>) -> bool {
    context.exit_controls() & exit::HOST_ADDRESS_SPACE_SIZE != 0
}

fn host_cr0(context: &Context<'_>) -> Outcome {
    let cr0 = context.read(vmcs::host::CR0);
    let capabilities = context.capabilities();

    ensure(cr0 & capabilities.cr0_fixed0 == capabilities.cr0_fixed0, "host CR0 bits fixed to 1 must be set", cr0)?;
    ensure(cr0 & !capabilities.cr0_fixed1 == 0, "host CR0 bits fixed to 0 must be clear", cr0)
}

fn host_cr4(context: &Context<'_>) -> Outcome {
    let cr4 = cr4(context);
    let capabilities = context.capabilities();

    ensure(cr4 & capabilities.cr4_fixed0 == capabilities.cr4_fixed0, "host CR4 bits fixed to 1 must be set", cr4)?;
    ensure(cr4 & !capabilities.cr4_fixed1 == 0, "host CR4 bits fixed to 0 must be clear", cr4)?;

    if host_address_space_size(context) {
        ensure(cr4 & Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits() != 0, "a 64-bit host requires CR4.PAE", cr4)
    } else {
        ensure(cr4 & Cr4Flags::PCID.bits() == 0, "CR4.PCIDE requires a 64-bit host", cr4)
    }
}

fn host_cr3(context: &Context<'_>) -> Outcome {
    let cr3 = context.read(vmcs::host::CR3);
    ensure(context.is_physical_address(cr3), "host CR3 must not set bits beyond the physical-address width", cr3)
}

fn host_sysenter(context: &Context<'_>) -> Outcome {
    let esp = context.read(vmcs::host::IA32_SYSENTER_ESP);
    ensure(is_canonical(esp), "host IA32_SYSENTER_ESP must be canonical", esp)?;
    let eip = context.read(vmcs::host::IA32_SYSENTER_EIP);
    ensure(is_canonical(eip), "host IA32_SYSENTER_EIP must be canonical", eip)
}

fn host_pat(context: &Context<'_>) -> Outcome {
    if context.exit_controls() & exit::LOAD_IA32_PAT == 0 {
        return Ok(());
    }
    let pat = context.read(vmcs::host::IA32_PAT_FULL);
    ensure(is_valid_pat(pat), "every host IA32_PAT entry must be a valid memory type", pat)
}

fn host_efer(context: &Context<'_>) -> Outcome {
    if context.exit_controls() & exit::LOAD_IA32_EFER == 0 {
        return Ok(());
    }

    let efer = context.read(vmcs::host::IA32_EFER_FULL);
    let long_mode = host_address_space_size(context);

    ensure(efer & EFER_RESERVED == 0, "host IA32_EFER reserved bits must be 0", efer)?;
    ensure((efer & EferFlags::LONG_MODE_ACTIVE.bits() != 0) == long_mode, "host IA32_EFER.LMA must match the host address-space size", efer)?;
    ensure((efer & EferFlags::LONG_MODE_ENABLE.bits() != 0) == long_mode, "host IA32_EFER.LME must match the host address-space size", efer)
}

fn host_selectors(context: &Context<'_>) -> Outcome {
    let selectors = [
        vmcs::host::ES_SELECTOR,
        vmcs::host::CS_SELECTOR,
        vmcs::host::SS_SELECTOR,
        vmcs::host::DS_SELECTOR,
        vmcs::host::FS_SELECTOR,
        vmcs::host::GS_SELECTOR,
        vmcs::host::TR_SELECTOR,
    ];
    for selector in selectors.map(|field| context.read(field)) {
        ensure(selector.get_bits(0..3) == 0, "host selector RPL and TI must be 0", selector)?;
    }

    let cs = context.read(vmcs::host::CS_SELECTOR);
    ensure(cs != 0, "host CS selector must not be null", cs)?;
    let tr = context.read(vmcs::host::TR_SELECTOR);
    ensure(tr != 0, "host TR selector must not be null", tr)?;
    if !host_address_space_size(context) {
        let ss = context.read(vmcs::host::SS_SELECTOR);
        ensure(ss != 0, "host SS selector must not be null outside 64-bit mode", ss)?;
    }

    Ok(())
}

fn host_bases(context: &Context<'_>) -> Outcome {
    let bases = [
        (vmcs::host::FS_BASE, "host FS base must be canonical"),
        (vmcs::host::GS_BASE, "host GS base must be canonical"),
        (vmcs::host::GDTR_BASE, "host GDTR base must be canonical"),
        (vmcs::host::IDTR_BASE, "host IDTR base must be canonical"),
        (vmcs::host::TR_BASE, "host TR base must be canonical"),
    ];
    for (field, rule) in bases {
        let base = context.read(field);
        ensure(is_canonical(base), rule, base)?;
    }

    Ok(())
}

fn address_space_size(context: &Context<'_>) -> Outcome {
    let rip = context.read(vmcs::host::RIP);

    if host_address_space_size(context) {
        ensure(is_canonical(rip), "host RIP must be canonical for a 64-bit host", rip)
    } else {
        ensure(!context.ia32e_mode_guest(), "an IA-32e mode guest requires a 64-bit host", context.entry_controls())?;
        ensure(rip.get_bits(32..64) == 0, "host RIP bits 63:32 must be 0 outside 64-bit mode", rip)
    }
}
