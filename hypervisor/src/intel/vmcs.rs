//! VMCS lifecycle and field access.
//!
//! A [`Vmcs`] owns its 4 KiB region and drives the four hardware transitions on it: VMCLEAR,
//! VMPTRLD, VMLAUNCH and VMRESUME. When the processor rejects a VM-entry, the compliance
//! checks in [`crate::intel::check`] are run against the current VMCS so the failure is
//! reported as the rule that was broken.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.11 Software Use of the VMCS and Related Structures

use {
    crate::{
        error::HypervisorError,
        intel::{
            capabilities::VmxCapabilities,
            capture::GuestRegisters,
            check,
            controls::{primary, secondary},
            hardware::VmxHardware,
            memory::{Page, PhysicalMemory},
            vmerror::VmInstructionError,
        },
    },
    alloc::{boxed::Box, vec::Vec},
    bit_field::BitField,
    log::*,
    x86::vmx::{vmcs, VmFail},
};

/// Callback run right before a VMLAUNCH, VMRESUME or VMCLEAR.
pub type Delegate = Box<dyn FnMut()>;

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Vmcs<H> {
    #[derivative(Debug = "ignore")]
    hardware: H,
    #[derivative(Debug = "ignore")]
    region: Box<Page>,
    physical_address: u64,
    revision_id: u32,
    capabilities: VmxCapabilities,
    launched: bool,
    loaded: bool,
    #[derivative(Debug = "ignore")]
    launch_delegates: Vec<Delegate>,
    #[derivative(Debug = "ignore")]
    resume_delegates: Vec<Delegate>,
    #[derivative(Debug = "ignore")]
    clear_delegates: Vec<Delegate>,
}

impl<H: VmxHardware> Vmcs<H> {
    /// Allocates a VMCS region, stamps the revision identifier into it and clears it.
    ///
    /// # Arguments
    ///
    /// * `hardware` - The processor the VMCS is used on.
    /// * `memory` - Supplies the zeroed page backing the region.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.2 Format of the VMCS Region
    pub fn new(hardware: H, memory: &mut dyn PhysicalMemory) -> Result<Self, HypervisorError> {
        let capabilities = VmxCapabilities::read(&hardware);
        let (mut region, physical_address) = memory.alloc_page()?;

        // Bit 31 is the shadow-VMCS indicator and must stay 0.
        let revision_id = capabilities.revision_id();
        region.0[..4].copy_from_slice(&revision_id.to_le_bytes());

        let mut vmcs = Self {
            hardware,
            region,
            physical_address,
            revision_id,
            capabilities,
            launched: false,
            loaded: false,
            launch_delegates: Vec::new(),
            resume_delegates: Vec::new(),
            clear_delegates: Vec::new(),
        };

        if let Err(error) = vmcs.clear() {
            memory.free_page(vmcs.region);
            return Err(error);
        }

        trace!("VMCS created at {:#x} (revision {:#x})", physical_address, revision_id);

        Ok(vmcs)
    }

    /// Runs the clear delegates, then VMCLEARs the region. The VMCS is afterwards neither
    /// current nor launched.
    pub fn clear(&mut self) -> Result<(), HypervisorError> {
        trace!("Clearing VMCS {:#x}", self.physical_address);

        for delegate in self.clear_delegates.iter_mut().rev() {
            delegate();
        }

        self.hardware.vmclear(self.physical_address).map_err(|_| HypervisorError::VmClearFailed)?;
        self.launched = false;
        self.loaded = false;

        Ok(())
    }

    /// Makes this VMCS current on the processor with VMPTRLD.
    pub fn load(&mut self) -> Result<(), HypervisorError> {
        trace!("Loading VMCS {:#x}", self.physical_address);

        self.hardware.vmptrld(self.physical_address).map_err(|_| HypervisorError::VmPtrLoadFailed)?;
        self.loaded = true;

        Ok(())
    }

    /// Enters the guest for the first time.
    ///
    /// This is a context switch: `Ok(())` is returned only after the guest has run and a
    /// VM-exit has come back through the host entry stub, with the guest's general-purpose
    /// registers in `registers`. An error means no guest code ran.
    pub fn launch(&mut self, registers: &mut GuestRegisters) -> Result<(), HypervisorError> {
        if self.launched {
            return Err(HypervisorError::VmcsAlreadyLaunched);
        }
        if !self.loaded {
            return Err(HypervisorError::VmcsNotLoaded);
        }

        trace!("Launching VMCS {:#x}", self.physical_address);

        for delegate in self.launch_delegates.iter_mut().rev() {
            delegate();
        }

        let result = self.hardware.vmlaunch(registers);
        self.complete_entry(result)?;
        self.launched = true;

        Ok(())
    }

    /// Re-enters the guest. Same contract as [`Vmcs::launch`].
    pub fn resume(&mut self, registers: &mut GuestRegisters) -> Result<(), HypervisorError> {
        if !self.launched {
            return Err(HypervisorError::VmcsNotLaunched);
        }
        if !self.loaded {
            return Err(HypervisorError::VmcsNotLoaded);
        }

        for delegate in self.resume_delegates.iter_mut().rev() {
            delegate();
        }

        let result = self.hardware.vmresume(registers);
        self.complete_entry(result)
    }

    /// Turns the outcome of VMLAUNCH/VMRESUME into an error with a cause.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.8 VM-Entry Failures During or After Loading Guest State
    fn complete_entry(&mut self, result: Result<(), VmFail>) -> Result<(), HypervisorError> {
        match result {
            Ok(()) => {
                let exit_reason = self.exit_reason();
                if exit_reason.get_bit(31) {
                    error!("VM-entry failed while loading guest state (exit reason {:#x})", exit_reason);
                    return Err(self.diagnose(0, exit_reason));
                }
                Ok(())
            }
            Err(VmFail::VmFailValid) => {
                let instruction_error = self.vm_instruction_error();
                match VmInstructionError::from_raw(instruction_error) {
                    Some(VmInstructionError::VmlaunchNonClearVmcs) => Err(HypervisorError::VmcsAlreadyLaunched),
                    Some(VmInstructionError::VmresumeNonLaunchedVmcs) => Err(HypervisorError::VmcsNotLaunched),
                    Some(error) => {
                        error!("VM-entry failed: {}", error);
                        Err(self.diagnose(instruction_error, 0))
                    }
                    None => {
                        error!("VM-entry failed with unknown instruction error {:#x}", instruction_error);
                        Err(self.diagnose(instruction_error, 0))
                    }
                }
            }
            Err(VmFail::VmFailInvalid) => Err(HypervisorError::VmFailInvalid),
        }
    }

    fn diagnose(&self, instruction_error: u32, exit_reason: u32) -> HypervisorError {
        match check::all(&self.hardware) {
            Err(violation) => {
                error!("VM-entry compliance check failed: {}", violation);
                HypervisorError::ConfigurationViolation(violation)
            }
            Ok(()) => HypervisorError::UnknownVmEntryFailure { instruction_error, exit_reason },
        }
    }

    /// Runs every VM-entry compliance check against the current VMCS.
    ///
    /// Returns `false` and logs the first violated rule, if any.
    pub fn check(&self) -> bool {
        match check::all(&self.hardware) {
            Ok(()) => true,
            Err(violation) => {
                error!("VMCS check failed: {}", violation);
                false
            }
        }
    }

    pub fn add_launch_delegate(&mut self, delegate: impl FnMut() + 'static) {
        self.launch_delegates.push(Box::new(delegate));
    }

    pub fn add_resume_delegate(&mut self, delegate: impl FnMut() + 'static) {
        self.resume_delegates.push(Box::new(delegate));
    }

    pub fn add_clear_delegate(&mut self, delegate: impl FnMut() + 'static) {
        self.clear_delegates.push(Box::new(delegate));
    }

    /// Clears the VMCS and gives its page back.
    ///
    /// The page is leaked rather than freed if VMCLEAR fails, since the processor may still
    /// hold it as the current VMCS.
    pub fn destroy(mut self, memory: &mut dyn PhysicalMemory) -> Result<(), HypervisorError> {
        self.launch_delegates.clear();
        self.resume_delegates.clear();
        self.clear_delegates.clear();

        if let Err(error) = self.clear() {
            error!("Leaking VMCS region {:#x}: {}", self.physical_address, error);
            let _ = Box::leak(self.region);
            return Err(error);
        }

        memory.free_page(self.region);
        Ok(())
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    pub fn capabilities(&self) -> &VmxCapabilities {
        &self.capabilities
    }

    pub fn physical_address(&self) -> u64 {
        self.physical_address
    }

    pub fn revision_id(&self) -> u32 {
        self.revision_id
    }

    /// The revision identifier as stored in the first four bytes of the region.
    pub fn region_revision_id(&self) -> u32 {
        u32::from_le_bytes([self.region.0[0], self.region.0[1], self.region.0[2], self.region.0[3]])
    }

    pub fn is_launched(&self) -> bool {
        self.launched
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Reads `field` of this VMCS. It must be the current VMCS.
    pub fn read(&self, field: u32) -> u64 {
        debug_assert!(self.loaded, "VMREAD {:#x} from VMCS {:#x}, which is not current", field, self.physical_address);
        self.hardware.vmread(field)
    }

    /// Writes `field` of this VMCS. It must be the current VMCS.
    ///
    /// A write the processor rejects is logged; loading the VMCS first is the caller's job.
    pub fn write(&mut self, field: u32, value: u64) {
        debug_assert!(self.loaded, "VMWRITE {:#x} to VMCS {:#x}, which is not current", field, self.physical_address);
        if let Err(error) = self.hardware.vmwrite(field, value) {
            error!("VMWRITE {:#x} = {:#x} to VMCS {:#x} failed: {:?}", field, value, self.physical_address, error);
        }
    }

    /// Secondary controls in effect: zero unless the primary controls activate them.
    pub fn active_secondary_controls(&self) -> u32 {
        if u64::from(self.primary_controls()) & primary::ACTIVATE_SECONDARY_CONTROLS == 0 {
            return 0;
        }
        self.secondary_controls()
    }

    pub fn guest_cr0(&self) -> u64 {
        self.read(vmcs::guest::CR0)
    }

    /// Writes guest CR0 with the VMX fixed bits applied. PE and PG may be 0 when the
    /// unrestricted-guest control is active.
    pub fn set_guest_cr0(&mut self, value: u64) {
        let unrestricted_guest = u64::from(self.active_secondary_controls()) & secondary::UNRESTRICTED_GUEST != 0;
        let value = self.capabilities.apply_cr0_fixed(value, unrestricted_guest);
        self.write(vmcs::guest::CR0, value);
    }

    pub fn guest_cr3(&self) -> u64 {
        self.read(vmcs::guest::CR3)
    }

    /// Writes guest CR3 with bits beyond the physical-address width cleared.
    pub fn set_guest_cr3(&mut self, value: u64) {
        let value = value & self.capabilities.physical_address_mask();
        self.write(vmcs::guest::CR3, value);
    }

    pub fn guest_cr4(&self) -> u64 {
        self.read(vmcs::guest::CR4)
    }

    pub fn set_guest_cr4(&mut self, value: u64) {
        let value = self.capabilities.apply_cr4_fixed(value);
        self.write(vmcs::guest::CR4, value);
    }

    pub fn host_cr0(&self) -> u64 {
        self.read(vmcs::host::CR0)
    }

    pub fn set_host_cr0(&mut self, value: u64) {
        let value = self.capabilities.apply_cr0_fixed(value, false);
        self.write(vmcs::host::CR0, value);
    }

    pub fn host_cr3(&self) -> u64 {
        self.read(vmcs::host::CR3)
    }

    pub fn set_host_cr3(&mut self, value: u64) {
        let value = value & self.capabilities.physical_address_mask();
        self.write(vmcs::host::CR3, value);
    }

    pub fn host_cr4(&self) -> u64 {
        self.read(vmcs::host::CR4)
    }

    pub fn set_host_cr4(&mut self, value: u64) {
        let value = self.capabilities.apply_cr4_fixed(value);
        self.write(vmcs::host::CR4, value);
    }
}

/// Plain get/set pairs. The value is truncated to the field's architectural width on read.
macro_rules! vmcs_fields {
    ($($field:path => $get:ident, $set:ident: $ty:ty;)*) => {
        impl<H: VmxHardware> Vmcs<H> {
            $(
                pub fn $get(&self) -> $ty {
                    self.read($field) as $ty
                }

                pub fn $set(&mut self, value: $ty) {
                    self.write($field, u64::from(value))
                }
            )*
        }
    };
}

/// VM-exit information fields.
macro_rules! vmcs_read_only_fields {
    ($($field:path => $get:ident: $ty:ty;)*) => {
        impl<H: VmxHardware> Vmcs<H> {
            $(
                pub fn $get(&self) -> $ty {
                    self.read($field) as $ty
                }
            )*
        }
    };
}

vmcs_fields! {
    vmcs::guest::ES_SELECTOR => guest_es_selector, set_guest_es_selector: u16;
    vmcs::guest::CS_SELECTOR => guest_cs_selector, set_guest_cs_selector: u16;
    vmcs::guest::SS_SELECTOR => guest_ss_selector, set_guest_ss_selector: u16;
    vmcs::guest::DS_SELECTOR => guest_ds_selector, set_guest_ds_selector: u16;
    vmcs::guest::FS_SELECTOR => guest_fs_selector, set_guest_fs_selector: u16;
    vmcs::guest::GS_SELECTOR => guest_gs_selector, set_guest_gs_selector: u16;
    vmcs::guest::LDTR_SELECTOR => guest_ldtr_selector, set_guest_ldtr_selector: u16;
    vmcs::guest::TR_SELECTOR => guest_tr_selector, set_guest_tr_selector: u16;

    vmcs::guest::ES_BASE => guest_es_base, set_guest_es_base: u64;
    vmcs::guest::CS_BASE => guest_cs_base, set_guest_cs_base: u64;
    vmcs::guest::SS_BASE => guest_ss_base, set_guest_ss_base: u64;
    vmcs::guest::DS_BASE => guest_ds_base, set_guest_ds_base: u64;
    vmcs::guest::FS_BASE => guest_fs_base, set_guest_fs_base: u64;
    vmcs::guest::GS_BASE => guest_gs_base, set_guest_gs_base: u64;
    vmcs::guest::LDTR_BASE => guest_ldtr_base, set_guest_ldtr_base: u64;
    vmcs::guest::TR_BASE => guest_tr_base, set_guest_tr_base: u64;
    vmcs::guest::GDTR_BASE => guest_gdtr_base, set_guest_gdtr_base: u64;
    vmcs::guest::IDTR_BASE => guest_idtr_base, set_guest_idtr_base: u64;

    vmcs::guest::ES_LIMIT => guest_es_limit, set_guest_es_limit: u32;
    vmcs::guest::CS_LIMIT => guest_cs_limit, set_guest_cs_limit: u32;
    vmcs::guest::SS_LIMIT => guest_ss_limit, set_guest_ss_limit: u32;
    vmcs::guest::DS_LIMIT => guest_ds_limit, set_guest_ds_limit: u32;
    vmcs::guest::FS_LIMIT => guest_fs_limit, set_guest_fs_limit: u32;
    vmcs::guest::GS_LIMIT => guest_gs_limit, set_guest_gs_limit: u32;
    vmcs::guest::LDTR_LIMIT => guest_ldtr_limit, set_guest_ldtr_limit: u32;
    vmcs::guest::TR_LIMIT => guest_tr_limit, set_guest_tr_limit: u32;
    vmcs::guest::GDTR_LIMIT => guest_gdtr_limit, set_guest_gdtr_limit: u32;
    vmcs::guest::IDTR_LIMIT => guest_idtr_limit, set_guest_idtr_limit: u32;

    vmcs::guest::ES_ACCESS_RIGHTS => guest_es_access_rights, set_guest_es_access_rights: u32;
    vmcs::guest::CS_ACCESS_RIGHTS => guest_cs_access_rights, set_guest_cs_access_rights: u32;
    vmcs::guest::SS_ACCESS_RIGHTS => guest_ss_access_rights, set_guest_ss_access_rights: u32;
    vmcs::guest::DS_ACCESS_RIGHTS => guest_ds_access_rights, set_guest_ds_access_rights: u32;
    vmcs::guest::FS_ACCESS_RIGHTS => guest_fs_access_rights, set_guest_fs_access_rights: u32;
    vmcs::guest::GS_ACCESS_RIGHTS => guest_gs_access_rights, set_guest_gs_access_rights: u32;
    vmcs::guest::LDTR_ACCESS_RIGHTS => guest_ldtr_access_rights, set_guest_ldtr_access_rights: u32;
    vmcs::guest::TR_ACCESS_RIGHTS => guest_tr_access_rights, set_guest_tr_access_rights: u32;

    vmcs::guest::DR7 => guest_dr7, set_guest_dr7: u64;
    vmcs::guest::RSP => guest_rsp, set_guest_rsp: u64;
    vmcs::guest::RIP => guest_rip, set_guest_rip: u64;
    vmcs::guest::RFLAGS => guest_rflags, set_guest_rflags: u64;
    vmcs::guest::IA32_DEBUGCTL_FULL => guest_ia32_debugctl, set_guest_ia32_debugctl: u64;
    vmcs::guest::IA32_SYSENTER_CS => guest_ia32_sysenter_cs, set_guest_ia32_sysenter_cs: u32;
    vmcs::guest::IA32_SYSENTER_ESP => guest_ia32_sysenter_esp, set_guest_ia32_sysenter_esp: u64;
    vmcs::guest::IA32_SYSENTER_EIP => guest_ia32_sysenter_eip, set_guest_ia32_sysenter_eip: u64;
    vmcs::guest::IA32_PERF_GLOBAL_CTRL_FULL => guest_ia32_perf_global_ctrl, set_guest_ia32_perf_global_ctrl: u64;
    vmcs::guest::IA32_PAT_FULL => guest_ia32_pat, set_guest_ia32_pat: u64;
    vmcs::guest::IA32_EFER_FULL => guest_ia32_efer, set_guest_ia32_efer: u64;
    vmcs::guest::IA32_BNDCFGS_FULL => guest_ia32_bndcfgs, set_guest_ia32_bndcfgs: u64;
    vmcs::guest::ACTIVITY_STATE => guest_activity_state, set_guest_activity_state: u32;
    vmcs::guest::INTERRUPTIBILITY_STATE => guest_interruptibility_state, set_guest_interruptibility_state: u32;
    vmcs::guest::PENDING_DBG_EXCEPTIONS => guest_pending_debug_exceptions, set_guest_pending_debug_exceptions: u64;
    vmcs::guest::LINK_PTR_FULL => vmcs_link_pointer, set_vmcs_link_pointer: u64;
    vmcs::guest::VMX_PREEMPTION_TIMER_VALUE => preemption_timer_value, set_preemption_timer_value: u32;
    vmcs::guest::PDPTE0_FULL => guest_pdpte0, set_guest_pdpte0: u64;
    vmcs::guest::PDPTE1_FULL => guest_pdpte1, set_guest_pdpte1: u64;
    vmcs::guest::PDPTE2_FULL => guest_pdpte2, set_guest_pdpte2: u64;
    vmcs::guest::PDPTE3_FULL => guest_pdpte3, set_guest_pdpte3: u64;

    vmcs::host::ES_SELECTOR => host_es_selector, set_host_es_selector: u16;
    vmcs::host::CS_SELECTOR => host_cs_selector, set_host_cs_selector: u16;
    vmcs::host::SS_SELECTOR => host_ss_selector, set_host_ss_selector: u16;
    vmcs::host::DS_SELECTOR => host_ds_selector, set_host_ds_selector: u16;
    vmcs::host::FS_SELECTOR => host_fs_selector, set_host_fs_selector: u16;
    vmcs::host::GS_SELECTOR => host_gs_selector, set_host_gs_selector: u16;
    vmcs::host::TR_SELECTOR => host_tr_selector, set_host_tr_selector: u16;
    vmcs::host::FS_BASE => host_fs_base, set_host_fs_base: u64;
    vmcs::host::GS_BASE => host_gs_base, set_host_gs_base: u64;
    vmcs::host::TR_BASE => host_tr_base, set_host_tr_base: u64;
    vmcs::host::GDTR_BASE => host_gdtr_base, set_host_gdtr_base: u64;
    vmcs::host::IDTR_BASE => host_idtr_base, set_host_idtr_base: u64;
    vmcs::host::IA32_SYSENTER_CS => host_ia32_sysenter_cs, set_host_ia32_sysenter_cs: u32;
    vmcs::host::IA32_SYSENTER_ESP => host_ia32_sysenter_esp, set_host_ia32_sysenter_esp: u64;
    vmcs::host::IA32_SYSENTER_EIP => host_ia32_sysenter_eip, set_host_ia32_sysenter_eip: u64;
    vmcs::host::IA32_PERF_GLOBAL_CTRL_FULL => host_ia32_perf_global_ctrl, set_host_ia32_perf_global_ctrl: u64;
    vmcs::host::IA32_PAT_FULL => host_ia32_pat, set_host_ia32_pat: u64;
    vmcs::host::IA32_EFER_FULL => host_ia32_efer, set_host_ia32_efer: u64;
    vmcs::host::RSP => host_rsp, set_host_rsp: u64;
    vmcs::host::RIP => host_rip, set_host_rip: u64;

    vmcs::control::PINBASED_EXEC_CONTROLS => pin_based_controls, set_pin_based_controls: u32;
    vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS => primary_controls, set_primary_controls: u32;
    vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS => secondary_controls, set_secondary_controls: u32;
    vmcs::control::VMEXIT_CONTROLS => exit_controls, set_exit_controls: u32;
    vmcs::control::VMENTRY_CONTROLS => entry_controls, set_entry_controls: u32;
    vmcs::control::EXCEPTION_BITMAP => exception_bitmap, set_exception_bitmap: u32;
    vmcs::control::IO_BITMAP_A_ADDR_FULL => io_bitmap_a, set_io_bitmap_a: u64;
    vmcs::control::IO_BITMAP_B_ADDR_FULL => io_bitmap_b, set_io_bitmap_b: u64;
    vmcs::control::MSR_BITMAPS_ADDR_FULL => msr_bitmap, set_msr_bitmap: u64;
    vmcs::control::TSC_OFFSET_FULL => tsc_offset, set_tsc_offset: u64;
    vmcs::control::CR0_GUEST_HOST_MASK => cr0_guest_host_mask, set_cr0_guest_host_mask: u64;
    vmcs::control::CR4_GUEST_HOST_MASK => cr4_guest_host_mask, set_cr4_guest_host_mask: u64;
    vmcs::control::CR0_READ_SHADOW => cr0_read_shadow, set_cr0_read_shadow: u64;
    vmcs::control::CR4_READ_SHADOW => cr4_read_shadow, set_cr4_read_shadow: u64;
    vmcs::control::CR3_TARGET_COUNT => cr3_target_count, set_cr3_target_count: u32;
    vmcs::control::VMEXIT_MSR_STORE_ADDR_FULL => exit_msr_store_address, set_exit_msr_store_address: u64;
    vmcs::control::VMEXIT_MSR_STORE_COUNT => exit_msr_store_count, set_exit_msr_store_count: u32;
    vmcs::control::VMEXIT_MSR_LOAD_ADDR_FULL => exit_msr_load_address, set_exit_msr_load_address: u64;
    vmcs::control::VMEXIT_MSR_LOAD_COUNT => exit_msr_load_count, set_exit_msr_load_count: u32;
    vmcs::control::VMENTRY_MSR_LOAD_ADDR_FULL => entry_msr_load_address, set_entry_msr_load_address: u64;
    vmcs::control::VMENTRY_MSR_LOAD_COUNT => entry_msr_load_count, set_entry_msr_load_count: u32;
    vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD => entry_interruption_info, set_entry_interruption_info: u32;
    vmcs::control::VMENTRY_EXCEPTION_ERR_CODE => entry_exception_error_code, set_entry_exception_error_code: u32;
    vmcs::control::VMENTRY_INSTRUCTION_LEN => entry_instruction_length, set_entry_instruction_length: u32;
    vmcs::control::TPR_THRESHOLD => tpr_threshold, set_tpr_threshold: u32;
    vmcs::control::VIRT_APIC_ADDR_FULL => virtual_apic_address, set_virtual_apic_address: u64;
    vmcs::control::APIC_ACCESS_ADDR_FULL => apic_access_address, set_apic_access_address: u64;
    vmcs::control::POSTED_INTERRUPT_DESC_ADDR_FULL => posted_interrupt_descriptor, set_posted_interrupt_descriptor: u64;
    vmcs::control::POSTED_INTERRUPT_NOTIFICATION_VECTOR => posted_interrupt_notification_vector, set_posted_interrupt_notification_vector: u16;
    vmcs::control::EPTP_FULL => eptp, set_eptp: u64;
    vmcs::control::VPID => vpid, set_vpid: u16;
    vmcs::control::VM_FUNCTION_CONTROLS_FULL => vm_function_controls, set_vm_function_controls: u64;
    vmcs::control::EPTP_LIST_ADDR_FULL => eptp_list_address, set_eptp_list_address: u64;
    vmcs::control::VMREAD_BITMAP_ADDR_FULL => vmread_bitmap, set_vmread_bitmap: u64;
    vmcs::control::VMWRITE_BITMAP_ADDR_FULL => vmwrite_bitmap, set_vmwrite_bitmap: u64;
    vmcs::control::PML_ADDR_FULL => pml_address, set_pml_address: u64;
    vmcs::control::VIRT_EXCEPTION_INFO_ADDR_FULL => ve_information_address, set_ve_information_address: u64;
}

vmcs_read_only_fields! {
    vmcs::ro::EXIT_REASON => exit_reason: u32;
    vmcs::ro::EXIT_QUALIFICATION => exit_qualification: u64;
    vmcs::ro::VM_INSTRUCTION_ERROR => vm_instruction_error: u32;
    vmcs::ro::VMEXIT_INSTRUCTION_LEN => exit_instruction_length: u32;
    vmcs::ro::VMEXIT_INSTRUCTION_INFO => exit_instruction_info: u32;
    vmcs::ro::VMEXIT_INTERRUPTION_INFO => exit_interruption_info: u32;
    vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE => exit_interruption_error_code: u32;
    vmcs::ro::IDT_VECTORING_INFO => idt_vectoring_info: u32;
    vmcs::ro::GUEST_PHYSICAL_ADDR_FULL => guest_physical_address: u64;
    vmcs::ro::GUEST_LINEAR_ADDR => guest_linear_address: u64;
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{
            capabilities::allowed1,
            hardware::VmxRead,
            memory::IdentityMapped,
            mock::{LaunchOutcome, MockHardware},
        },
        alloc::rc::Rc,
        core::cell::RefCell,
        x86::msr,
    };

    fn vmcs() -> Vmcs<MockHardware> {
        Vmcs::new(MockHardware::new(), &mut IdentityMapped).unwrap()
    }

    #[test]
    fn new_stamps_revision_and_clears() {
        let vmcs = vmcs();

        assert_eq!(vmcs.revision_id(), 0x12);
        assert_eq!(vmcs.region_revision_id(), 0x12);
        assert_eq!(vmcs.physical_address() & 0xFFF, 0);
        assert_eq!(vmcs.hardware().vmclear_count, 1);
        assert!(!vmcs.is_launched());
        assert!(!vmcs.is_loaded());
    }

    #[test]
    fn launch_requires_load() {
        let mut vmcs = vmcs();
        let mut registers = GuestRegisters::default();

        assert_eq!(vmcs.launch(&mut registers), Err(HypervisorError::VmcsNotLoaded));
        assert_eq!(vmcs.hardware().entries, 0);
    }

    #[test]
    fn second_launch_without_clear_is_rejected() {
        let mut vmcs = vmcs();
        let mut registers = GuestRegisters::default();
        vmcs.load().unwrap();
        vmcs.hardware_mut().script(LaunchOutcome::Exit(10));

        assert_eq!(vmcs.launch(&mut registers), Ok(()));
        assert!(vmcs.is_launched());
        assert_eq!(vmcs.launch(&mut registers), Err(HypervisorError::VmcsAlreadyLaunched));
        assert_eq!(vmcs.hardware().entries, 1);

        vmcs.clear().unwrap();
        vmcs.load().unwrap();
        assert_eq!(vmcs.launch(&mut registers), Ok(()));
    }

    #[test]
    fn resume_requires_launch() {
        let mut vmcs = vmcs();
        let mut registers = GuestRegisters::default();
        vmcs.load().unwrap();

        assert_eq!(vmcs.resume(&mut registers), Err(HypervisorError::VmcsNotLaunched));

        vmcs.launch(&mut registers).unwrap();
        assert_eq!(vmcs.resume(&mut registers), Ok(()));
        assert_eq!(vmcs.hardware().entries, 2);
    }

    #[test]
    fn hardware_launch_state_errors_map_to_preconditions() {
        let mut vmcs = vmcs();
        let mut registers = GuestRegisters::default();
        vmcs.load().unwrap();
        vmcs.hardware_mut().script(LaunchOutcome::FailValid(4));

        assert_eq!(vmcs.launch(&mut registers), Err(HypervisorError::VmcsAlreadyLaunched));
        assert!(!vmcs.is_launched());
    }

    #[test]
    fn fail_invalid_is_reported_as_is() {
        let mut vmcs = vmcs();
        let mut registers = GuestRegisters::default();
        vmcs.load().unwrap();
        vmcs.hardware_mut().script(LaunchOutcome::FailInvalid);

        assert_eq!(vmcs.launch(&mut registers), Err(HypervisorError::VmFailInvalid));
    }

    #[test]
    fn delegates_run_most_recent_first() {
        let mut vmcs = vmcs();
        let mut registers = GuestRegisters::default();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (name, kind) in [("launch-1", 0), ("launch-2", 0), ("resume-1", 1), ("clear-1", 2), ("clear-2", 2)] {
            let order = order.clone();
            let delegate = move || order.borrow_mut().push(name);
            match kind {
                0 => vmcs.add_launch_delegate(delegate),
                1 => vmcs.add_resume_delegate(delegate),
                _ => vmcs.add_clear_delegate(delegate),
            }
        }

        vmcs.load().unwrap();
        vmcs.launch(&mut registers).unwrap();
        vmcs.resume(&mut registers).unwrap();
        vmcs.clear().unwrap();

        assert_eq!(*order.borrow(), ["launch-2", "launch-1", "resume-1", "clear-2", "clear-1"]);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut vmcs = vmcs();
        vmcs.load().unwrap();
        vmcs.set_guest_rip(0x1234);

        vmcs.clear().unwrap();
        let once = (vmcs.is_launched(), vmcs.is_loaded(), vmcs.physical_address(), vmcs.region_revision_id());
        vmcs.clear().unwrap();
        let twice = (vmcs.is_launched(), vmcs.is_loaded(), vmcs.physical_address(), vmcs.region_revision_id());

        assert_eq!(once, twice);
        assert_eq!(vmcs.hardware().current_vmcs(), None);

        vmcs.load().unwrap();
        assert_eq!(vmcs.guest_rip(), 0x1234);
    }

    #[test]
    #[should_panic(expected = "which is not current")]
    fn field_access_requires_load() {
        let mut vmcs = vmcs();
        vmcs.set_guest_rip(0x1234);
    }

    #[test]
    fn processor_rejects_writes_without_a_current_vmcs() {
        let mut vmcs = vmcs();
        vmcs.load().unwrap();
        vmcs.clear().unwrap();

        assert!(matches!(vmcs.hardware_mut().vmwrite(vmcs::guest::RIP, 0x1234), Err(VmFail::VmFailInvalid)));
        assert_eq!(vmcs.hardware().vmread(vmcs::guest::RIP), 0);
    }

    #[test]
    fn each_vmcs_keeps_its_own_fields() {
        let mut first = vmcs();
        first.load().unwrap();
        first.set_guest_rip(0x1000);

        let hardware = core::mem::take(first.hardware_mut());
        let mut second = Vmcs::new(hardware, &mut IdentityMapped).unwrap();
        second.load().unwrap();
        assert_eq!(second.guest_rip(), 0);
        second.set_guest_rip(0x2000);

        // Hand the processor back and make the first VMCS current again.
        *first.hardware_mut() = core::mem::take(second.hardware_mut());
        first.load().unwrap();
        assert_eq!(first.guest_rip(), 0x1000);
    }

    #[test]
    fn plain_fields_round_trip() {
        let mut vmcs = vmcs();
        vmcs.load().unwrap();

        vmcs.set_guest_cs_selector(0x33);
        vmcs.set_guest_tr_limit(0x67);
        vmcs.set_guest_ss_access_rights(0xC093);
        vmcs.set_guest_gs_base(0xFFFF_F800_1234_0000);
        vmcs.set_host_rip(0xFFFF_8000_0000_1000);
        vmcs.set_vpid(1);
        vmcs.set_msr_bitmap(0x5000);

        assert_eq!(vmcs.guest_cs_selector(), 0x33);
        assert_eq!(vmcs.guest_tr_limit(), 0x67);
        assert_eq!(vmcs.guest_ss_access_rights(), 0xC093);
        assert_eq!(vmcs.guest_gs_base(), 0xFFFF_F800_1234_0000);
        assert_eq!(vmcs.host_rip(), 0xFFFF_8000_0000_1000);
        assert_eq!(vmcs.vpid(), 1);
        assert_eq!(vmcs.msr_bitmap(), 0x5000);
    }

    #[test]
    fn control_register_setters_apply_fixed_bits() {
        let mut vmcs = vmcs();
        vmcs.load().unwrap();

        vmcs.set_guest_cr0(0);
        assert_eq!(vmcs.guest_cr0(), 0x8000_0021);

        vmcs.set_guest_cr4(0x20);
        assert_eq!(vmcs.guest_cr4(), 0x2020);

        // Bits above the 48-bit physical-address width are dropped.
        vmcs.set_guest_cr3(0xFFF0_1234_5678_9000);
        assert_eq!(vmcs.guest_cr3(), 0x0000_1234_5678_9000);

        vmcs.set_host_cr0(0x10);
        assert_eq!(vmcs.host_cr0(), 0x8000_0031);
    }

    #[test]
    fn unrestricted_guest_may_clear_pe_and_pg() {
        let mut vmcs = vmcs();
        vmcs.load().unwrap();
        vmcs.set_primary_controls(primary::ACTIVATE_SECONDARY_CONTROLS as u32);
        vmcs.set_secondary_controls((secondary::UNRESTRICTED_GUEST | secondary::ENABLE_EPT) as u32);

        vmcs.set_guest_cr0(0);
        assert_eq!(vmcs.guest_cr0(), 0x20);
    }

    #[test]
    fn rejected_entry_reports_the_violated_rule() {
        let mut hardware = MockHardware::new();
        hardware.set_msr(msr::IA32_VMX_TRUE_PINBASED_CTLS, 0x7F << 32);
        let mut vmcs = Vmcs::new(hardware, &mut IdentityMapped).unwrap();
        let mut registers = GuestRegisters::default();
        vmcs.load().unwrap();

        let reserved = 1 << 7;
        assert_eq!(allowed1(vmcs.capabilities().pin_based) & reserved, 0);
        vmcs.set_pin_based_controls(reserved as u32);
        vmcs.hardware_mut().script(LaunchOutcome::FailValid(7));

        match vmcs.launch(&mut registers) {
            Err(HypervisorError::ConfigurationViolation(violation)) => {
                assert_eq!(violation.check, "pin_based_controls");
                assert_eq!(violation.value, reserved);
            }
            other => panic!("unexpected launch result: {other:?}"),
        }
        assert!(!vmcs.is_launched());
        assert!(!vmcs.check());
    }

    #[test]
    fn guest_state_entry_failure_is_diagnosed() {
        let mut vmcs = vmcs();
        let mut registers = GuestRegisters::default();
        vmcs.load().unwrap();
        vmcs.hardware_mut().script(LaunchOutcome::EntryFailure(33));

        assert!(matches!(vmcs.launch(&mut registers), Err(HypervisorError::ConfigurationViolation(_))));
        assert!(!vmcs.is_launched());
    }

    #[test]
    fn destroy_clears_before_freeing() {
        let mut vmcs = vmcs();
        vmcs.load().unwrap();

        assert_eq!(vmcs.destroy(&mut IdentityMapped), Ok(()));
    }
}
