//! Default VMCS configuration: a 64-bit guest on a 64-bit host.
//!
//! [`control_fields`], [`guest_state`] and [`host_state`] fill the current VMCS from plain
//! snapshots. The snapshots come either from [`GuestState::flat_64bit`] /
//! [`HostState::flat_64bit`] or, on a physical processor, from
//! [`crate::intel::support::BareMetal`], which captures the running state.

use {
    crate::{
        error::HypervisorError,
        intel::{
            controls::{entry, exit, primary, secondary, VmxControl},
            hardware::VmxHardware,
            memory::{Page, PhysicalMemory},
            segment::{AccessRights, SegmentDescriptor, TaskStateSegment},
            vmcs::Vmcs,
        },
    },
    log::*,
    x86_64::registers::control::Cr4Flags,
};

const PRIMARY_CONTROLS: u64 = primary::USE_MSR_BITMAPS | primary::ACTIVATE_SECONDARY_CONTROLS;
const SECONDARY_CONTROLS: u64 = secondary::ENABLE_RDTSCP | secondary::ENABLE_INVPCID | secondary::ENABLE_XSAVES_XRSTORS;
const EXIT_CONTROLS: u64 = exit::HOST_ADDRESS_SPACE_SIZE
    | exit::SAVE_IA32_PAT
    | exit::LOAD_IA32_PAT
    | exit::SAVE_IA32_EFER
    | exit::LOAD_IA32_EFER
    | exit::SAVE_DEBUG_CONTROLS;
const ENTRY_CONTROLS: u64 = entry::IA32E_MODE_GUEST | entry::LOAD_IA32_PAT | entry::LOAD_IA32_EFER | entry::LOAD_DEBUG_CONTROLS;

const FLAT_CR0: u64 = 0x8005_0033;
const FLAT_CR4: u64 = 0x2620;
const FLAT_EFER: u64 = 0xD01;
const FLAT_PAT: u64 = 0x0007_0406_0007_0406;
const FLAT_CODE_SELECTOR: u16 = 0x08;
const FLAT_DATA_SELECTOR: u16 = 0x10;
const FLAT_TR_SELECTOR: u16 = 0x18;

/// Base and limit of a GDT or IDT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// Processor state the guest starts in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: SegmentDescriptor,
    pub ss: SegmentDescriptor,
    pub ds: SegmentDescriptor,
    pub es: SegmentDescriptor,
    pub fs: SegmentDescriptor,
    pub gs: SegmentDescriptor,
    pub ldtr: SegmentDescriptor,
    pub tr: SegmentDescriptor,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub ia32_debugctl: u64,
    pub ia32_efer: u64,
    pub ia32_pat: u64,
    pub sysenter_cs: u32,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
}

impl GuestState {
    /// Long mode with paging, flat segments and a busy 64-bit TSS, entered at `rip`.
    pub fn flat_64bit(cr3: u64, rip: u64, rsp: u64) -> Self {
        let code = SegmentDescriptor { selector: FLAT_CODE_SELECTOR, base: 0, limit: u32::MAX, access_rights: 0xA09B };
        let data = SegmentDescriptor { selector: FLAT_DATA_SELECTOR, base: 0, limit: u32::MAX, access_rights: 0xC093 };

        Self {
            cr0: FLAT_CR0,
            cr3,
            cr4: FLAT_CR4,
            dr7: 0x400,
            rsp,
            rip,
            rflags: 0x2,
            cs: code,
            ss: data,
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ldtr: SegmentDescriptor::unusable(0),
            tr: SegmentDescriptor { selector: FLAT_TR_SELECTOR, base: 0, limit: TaskStateSegment::LIMIT, access_rights: 0x8B },
            gdtr: DescriptorTable { base: 0, limit: 0x27 },
            idtr: DescriptorTable { base: 0, limit: 0xFFF },
            ia32_debugctl: 0,
            ia32_efer: FLAT_EFER,
            ia32_pat: FLAT_PAT,
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
        }
    }
}

/// Processor state loaded on every VM-exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub rsp: u64,
    pub rip: u64,
    pub cs_selector: u16,
    pub ss_selector: u16,
    pub ds_selector: u16,
    pub es_selector: u16,
    pub fs_selector: u16,
    pub gs_selector: u16,
    pub tr_selector: u16,
    pub fs_base: u64,
    pub gs_base: u64,
    pub tr_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub ia32_efer: u64,
    pub ia32_pat: u64,
    pub sysenter_cs: u32,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
}

impl HostState {
    /// Long mode with flat segments. `rip` is the VM-exit entry point, `rsp` its stack.
    pub fn flat_64bit(cr3: u64, rip: u64, rsp: u64) -> Self {
        Self {
            cr0: FLAT_CR0,
            cr3,
            cr4: FLAT_CR4,
            rsp,
            rip,
            cs_selector: FLAT_CODE_SELECTOR,
            ss_selector: FLAT_DATA_SELECTOR,
            ds_selector: FLAT_DATA_SELECTOR,
            es_selector: FLAT_DATA_SELECTOR,
            fs_selector: FLAT_DATA_SELECTOR,
            gs_selector: FLAT_DATA_SELECTOR,
            tr_selector: FLAT_TR_SELECTOR,
            ia32_efer: FLAT_EFER,
            ia32_pat: FLAT_PAT,
            ..Default::default()
        }
    }
}

/// Writes the execution, exit and entry controls.
///
/// Each control is adjusted to what the processor allows. `msr_bitmap` is passed to the
/// processor by physical address and left all zero, so no MSR access exits.
pub fn control_fields<H: VmxHardware>(vmcs: &mut Vmcs<H>, memory: &dyn PhysicalMemory, msr_bitmap: &Page) -> Result<(), HypervisorError> {
    debug!("Setting up VMCS control fields");
    ensure_loaded(vmcs)?;

    let capabilities = *vmcs.capabilities();

    vmcs.set_pin_based_controls(capabilities.adjust_controls(VmxControl::PinBased, 0) as u32);
    vmcs.set_primary_controls(capabilities.adjust_controls(VmxControl::ProcessorBased, PRIMARY_CONTROLS) as u32);
    vmcs.set_secondary_controls(capabilities.adjust_controls(VmxControl::ProcessorBased2, SECONDARY_CONTROLS) as u32);
    vmcs.set_exit_controls(capabilities.adjust_controls(VmxControl::VmExit, EXIT_CONTROLS) as u32);
    vmcs.set_entry_controls(capabilities.adjust_controls(VmxControl::VmEntry, ENTRY_CONTROLS) as u32);

    vmcs.set_exception_bitmap(0);
    vmcs.set_cr3_target_count(0);
    vmcs.set_exit_msr_store_count(0);
    vmcs.set_exit_msr_load_count(0);
    vmcs.set_entry_msr_load_count(0);
    vmcs.set_entry_interruption_info(0);

    let msr_bitmap = memory.translate(msr_bitmap as *const Page as u64)?;
    vmcs.set_msr_bitmap(msr_bitmap);
    vmcs.set_vmcs_link_pointer(u64::MAX);

    trace!(
        "Controls: pin {:#x} primary {:#x} secondary {:#x} exit {:#x} entry {:#x}",
        vmcs.pin_based_controls(),
        vmcs.primary_controls(),
        vmcs.secondary_controls(),
        vmcs.exit_controls(),
        vmcs.entry_controls()
    );

    Ok(())
}

/// Writes the guest-state area, plus the CR0/CR4 guest/host masks and read shadows.
///
/// The guest owns every control register bit except the VMX fixed bits and CR4.VMXE,
/// which reads as 0.
pub fn guest_state<H: VmxHardware>(vmcs: &mut Vmcs<H>, state: &GuestState) -> Result<(), HypervisorError> {
    debug!("Setting up guest state, RIP {:#x} RSP {:#x}", state.rip, state.rsp);
    ensure_loaded(vmcs)?;

    let capabilities = *vmcs.capabilities();

    vmcs.set_guest_cr0(state.cr0);
    vmcs.set_guest_cr3(state.cr3);
    vmcs.set_guest_cr4(state.cr4);
    vmcs.set_guest_dr7(state.dr7);
    vmcs.set_guest_rsp(state.rsp);
    vmcs.set_guest_rip(state.rip);
    vmcs.set_guest_rflags(state.rflags);

    vmcs.set_cr0_guest_host_mask(capabilities.cr0_fixed0 | !capabilities.cr0_fixed1);
    vmcs.set_cr4_guest_host_mask(capabilities.cr4_fixed0 | !capabilities.cr4_fixed1 | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());
    vmcs.set_cr0_read_shadow(state.cr0);
    vmcs.set_cr4_read_shadow(state.cr4 & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());

    macro_rules! segment {
        ($segment:expr, $selector:ident, $base:ident, $limit:ident, $access_rights:ident) => {
            vmcs.$selector($segment.selector);
            vmcs.$base($segment.base);
            vmcs.$limit($segment.limit);
            vmcs.$access_rights($segment.access_rights);
        };
    }

    segment!(state.cs, set_guest_cs_selector, set_guest_cs_base, set_guest_cs_limit, set_guest_cs_access_rights);
    segment!(state.ss, set_guest_ss_selector, set_guest_ss_base, set_guest_ss_limit, set_guest_ss_access_rights);
    segment!(state.ds, set_guest_ds_selector, set_guest_ds_base, set_guest_ds_limit, set_guest_ds_access_rights);
    segment!(state.es, set_guest_es_selector, set_guest_es_base, set_guest_es_limit, set_guest_es_access_rights);
    segment!(state.fs, set_guest_fs_selector, set_guest_fs_base, set_guest_fs_limit, set_guest_fs_access_rights);
    segment!(state.gs, set_guest_gs_selector, set_guest_gs_base, set_guest_gs_limit, set_guest_gs_access_rights);
    segment!(state.ldtr, set_guest_ldtr_selector, set_guest_ldtr_base, set_guest_ldtr_limit, set_guest_ldtr_access_rights);
    segment!(state.tr, set_guest_tr_selector, set_guest_tr_base, set_guest_tr_limit, set_guest_tr_access_rights);

    vmcs.set_guest_gdtr_base(state.gdtr.base);
    vmcs.set_guest_gdtr_limit(u32::from(state.gdtr.limit));
    vmcs.set_guest_idtr_base(state.idtr.base);
    vmcs.set_guest_idtr_limit(u32::from(state.idtr.limit));

    vmcs.set_guest_ia32_debugctl(state.ia32_debugctl);
    vmcs.set_guest_ia32_efer(state.ia32_efer);
    vmcs.set_guest_ia32_pat(state.ia32_pat);
    vmcs.set_guest_ia32_sysenter_cs(state.sysenter_cs);
    vmcs.set_guest_ia32_sysenter_esp(state.sysenter_esp);
    vmcs.set_guest_ia32_sysenter_eip(state.sysenter_eip);

    vmcs.set_guest_activity_state(0);
    vmcs.set_guest_interruptibility_state(0);
    vmcs.set_guest_pending_debug_exceptions(0);

    trace!(
        "Guest CS {:#x} ({:?}), TR {:#x}, CR0 {:#x}, CR4 {:#x}",
        state.cs.selector,
        AccessRights(state.cs.access_rights),
        state.tr.selector,
        vmcs.guest_cr0(),
        vmcs.guest_cr4()
    );

    Ok(())
}

/// Writes the host-state area.
pub fn host_state<H: VmxHardware>(vmcs: &mut Vmcs<H>, state: &HostState) -> Result<(), HypervisorError> {
    debug!("Setting up host state, RIP {:#x} RSP {:#x}", state.rip, state.rsp);
    ensure_loaded(vmcs)?;

    vmcs.set_host_cr0(state.cr0);
    vmcs.set_host_cr3(state.cr3);
    vmcs.set_host_cr4(state.cr4);
    vmcs.set_host_rsp(state.rsp);
    vmcs.set_host_rip(state.rip);

    vmcs.set_host_cs_selector(state.cs_selector);
    vmcs.set_host_ss_selector(state.ss_selector);
    vmcs.set_host_ds_selector(state.ds_selector);
    vmcs.set_host_es_selector(state.es_selector);
    vmcs.set_host_fs_selector(state.fs_selector);
    vmcs.set_host_gs_selector(state.gs_selector);
    vmcs.set_host_tr_selector(state.tr_selector);

    vmcs.set_host_fs_base(state.fs_base);
    vmcs.set_host_gs_base(state.gs_base);
    vmcs.set_host_tr_base(state.tr_base);
    vmcs.set_host_gdtr_base(state.gdtr_base);
    vmcs.set_host_idtr_base(state.idtr_base);

    vmcs.set_host_ia32_efer(state.ia32_efer);
    vmcs.set_host_ia32_pat(state.ia32_pat);
    vmcs.set_host_ia32_sysenter_cs(state.sysenter_cs);
    vmcs.set_host_ia32_sysenter_esp(state.sysenter_esp);
    vmcs.set_host_ia32_sysenter_eip(state.sysenter_eip);

    Ok(())
}

/// The setup functions write through VMWRITE, which only reaches the current VMCS.
fn ensure_loaded<H: VmxHardware>(vmcs: &Vmcs<H>) -> Result<(), HypervisorError> {
    if !vmcs.is_loaded() {
        error!("VMCS {:#x} must be loaded before it is set up", vmcs.physical_address());
        return Err(HypervisorError::VmcsNotLoaded);
    }
    Ok(())
}
