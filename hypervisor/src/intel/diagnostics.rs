//! VMCS dump for rejected VM-entries.
//!
//! Logs the control fields, guest state and host state of the current VMCS at error level,
//! followed by the first compliance check that fails against it.

use {
    crate::intel::{
        check,
        hardware::VmxHardware,
        segment::AccessRights,
        vmcs::Vmcs,
        vmerror::{VmInstructionError, VmxBasicExitReason},
    },
    bit_field::BitField,
    log::error,
};

/// Dumps the current VMCS.
pub fn dump<H: VmxHardware>(vmcs: &Vmcs<H>) {
    error!("=== VMCS {:#x} (launched: {}) ===", vmcs.physical_address(), vmcs.is_launched());

    let exit_reason = vmcs.exit_reason();
    match VmxBasicExitReason::from_exit_reason(exit_reason) {
        Some(reason) => error!("Exit reason: {:#x} ({}), entry failure: {}", exit_reason, reason, exit_reason.get_bit(31)),
        None => error!("Exit reason: {:#x}", exit_reason),
    }
    let instruction_error = vmcs.vm_instruction_error();
    match VmInstructionError::from_raw(instruction_error) {
        Some(error) => error!("VM-instruction error: {} ({})", instruction_error, error),
        None => error!("VM-instruction error: {}", instruction_error),
    }

    dump_controls(vmcs);
    dump_guest(vmcs);
    dump_host(vmcs);

    match check::all(vmcs.hardware()) {
        Ok(()) => error!("Every VM-entry check passes"),
        Err(violation) => error!("First failing check: {}", violation),
    }
}

fn dump_controls<H: VmxHardware>(vmcs: &Vmcs<H>) {
    error!("--- Controls ---");
    error!("Pin-based: {:#010x}", vmcs.pin_based_controls());
    error!("Primary: {:#010x}", vmcs.primary_controls());
    error!("Secondary: {:#010x} (active: {:#010x})", vmcs.secondary_controls(), vmcs.active_secondary_controls());
    error!("Exit: {:#010x}", vmcs.exit_controls());
    error!("Entry: {:#010x}", vmcs.entry_controls());
    error!("Entry interruption info: {:#010x}, error code {:#x}", vmcs.entry_interruption_info(), vmcs.entry_exception_error_code());
    error!("MSR bitmap: {:#x}, EPTP: {:#x}, VPID: {}", vmcs.msr_bitmap(), vmcs.eptp(), vmcs.vpid());
    error!("CR0 mask/shadow: {:#x}/{:#x}", vmcs.cr0_guest_host_mask(), vmcs.cr0_read_shadow());
    error!("CR4 mask/shadow: {:#x}/{:#x}", vmcs.cr4_guest_host_mask(), vmcs.cr4_read_shadow());
}

fn dump_guest<H: VmxHardware>(vmcs: &Vmcs<H>) {
    error!("--- Guest ---");
    error!("CR0: {:#018x} CR3: {:#018x} CR4: {:#018x}", vmcs.guest_cr0(), vmcs.guest_cr3(), vmcs.guest_cr4());
    error!("RIP: {:#018x} RSP: {:#018x} RFLAGS: {:#x}", vmcs.guest_rip(), vmcs.guest_rsp(), vmcs.guest_rflags());
    error!("EFER: {:#x} PAT: {:#x} DR7: {:#x}", vmcs.guest_ia32_efer(), vmcs.guest_ia32_pat(), vmcs.guest_dr7());

    let segments = [
        ("CS", vmcs.guest_cs_selector(), vmcs.guest_cs_base(), vmcs.guest_cs_limit(), vmcs.guest_cs_access_rights()),
        ("SS", vmcs.guest_ss_selector(), vmcs.guest_ss_base(), vmcs.guest_ss_limit(), vmcs.guest_ss_access_rights()),
        ("DS", vmcs.guest_ds_selector(), vmcs.guest_ds_base(), vmcs.guest_ds_limit(), vmcs.guest_ds_access_rights()),
        ("ES", vmcs.guest_es_selector(), vmcs.guest_es_base(), vmcs.guest_es_limit(), vmcs.guest_es_access_rights()),
        ("FS", vmcs.guest_fs_selector(), vmcs.guest_fs_base(), vmcs.guest_fs_limit(), vmcs.guest_fs_access_rights()),
        ("GS", vmcs.guest_gs_selector(), vmcs.guest_gs_base(), vmcs.guest_gs_limit(), vmcs.guest_gs_access_rights()),
        ("LDTR", vmcs.guest_ldtr_selector(), vmcs.guest_ldtr_base(), vmcs.guest_ldtr_limit(), vmcs.guest_ldtr_access_rights()),
        ("TR", vmcs.guest_tr_selector(), vmcs.guest_tr_base(), vmcs.guest_tr_limit(), vmcs.guest_tr_access_rights()),
    ];
    for (name, selector, base, limit, access_rights) in segments {
        error!("{}: sel={:#06x} base={:#x} limit={:#x} ar={:?}", name, selector, base, limit, AccessRights(access_rights));
    }

    error!("GDTR: base={:#x} limit={:#x}", vmcs.guest_gdtr_base(), vmcs.guest_gdtr_limit());
    error!("IDTR: base={:#x} limit={:#x}", vmcs.guest_idtr_base(), vmcs.guest_idtr_limit());
    error!(
        "Activity: {} Interruptibility: {:#x} Pending debug: {:#x} Link pointer: {:#x}",
        vmcs.guest_activity_state(),
        vmcs.guest_interruptibility_state(),
        vmcs.guest_pending_debug_exceptions(),
        vmcs.vmcs_link_pointer()
    );
}

fn dump_host<H: VmxHardware>(vmcs: &Vmcs<H>) {
    error!("--- Host ---");
    error!("CR0: {:#018x} CR3: {:#018x} CR4: {:#018x}", vmcs.host_cr0(), vmcs.host_cr3(), vmcs.host_cr4());
    error!("RIP: {:#018x} RSP: {:#018x}", vmcs.host_rip(), vmcs.host_rsp());
    error!(
        "CS={:#x} SS={:#x} DS={:#x} ES={:#x} FS={:#x} GS={:#x} TR={:#x}",
        vmcs.host_cs_selector(),
        vmcs.host_ss_selector(),
        vmcs.host_ds_selector(),
        vmcs.host_es_selector(),
        vmcs.host_fs_selector(),
        vmcs.host_gs_selector(),
        vmcs.host_tr_selector()
    );
    error!("FS base: {:#x} GS base: {:#x} TR base: {:#x}", vmcs.host_fs_base(), vmcs.host_gs_base(), vmcs.host_tr_base());
    error!("GDTR base: {:#x} IDTR base: {:#x}", vmcs.host_gdtr_base(), vmcs.host_idtr_base());
    error!("EFER: {:#x} PAT: {:#x}", vmcs.host_ia32_efer(), vmcs.host_ia32_pat());
}
