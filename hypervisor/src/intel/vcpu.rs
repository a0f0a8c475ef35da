//! The virtual processor: one VMCS, one exit-dispatch table and the guest register file,
//! bound to the logical processor it was created on.

use {
    crate::{
        error::HypervisorError,
        global_const::MAX_INSTRUCTION_LENGTH,
        intel::{
            capture::GuestRegisters,
            hardware::{PromoteState, VmxHardware},
            memory::PhysicalMemory,
            vmcs::Vmcs,
            vmerror::VmxBasicExitReason,
            vmexit::{cpuid::CpuidDispatcher, ExitHandler, Handler},
        },
    },
    log::*,
};

/// Whether the virtual processor wraps the operating system that started the hypervisor or
/// runs a separate guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuRole {
    /// The original OS context; may be demoted into VMX non-root and promoted back out.
    Host,
    Guest,
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Vcpu<H> {
    id: u32,
    role: VcpuRole,
    /// Guest general-purpose registers, valid while handling a VM-exit.
    pub registers: GuestRegisters,
    vmcs: Vmcs<H>,
    exit_handler: ExitHandler<H>,
    cpuid: CpuidDispatcher<H>,
    halted: bool,
}

impl<H: VmxHardware + 'static> Vcpu<H> {
    /// Creates the virtual processor and its VMCS. The CPUID leaf dispatcher is installed
    /// as the handler for CPUID exits.
    ///
    /// # Arguments
    ///
    /// * `id` - Identifier of the logical processor, used in log output.
    /// * `role` - Fixed for the lifetime of the virtual processor.
    /// * `hardware` - The processor this virtual processor runs on.
    /// * `memory` - Supplies the VMCS region.
    pub fn new(id: u32, role: VcpuRole, hardware: H, memory: &mut dyn PhysicalMemory) -> Result<Self, HypervisorError> {
        trace!("Creating vcpu {} ({:?})", id, role);

        let vmcs = Vmcs::new(hardware, memory)?;

        let mut vcpu = Self {
            id,
            role,
            registers: GuestRegisters::default(),
            vmcs,
            exit_handler: ExitHandler::default(),
            cpuid: CpuidDispatcher::default(),
            halted: false,
        };
        vcpu.add_handler(VmxBasicExitReason::Cpuid, CpuidDispatcher::<H>::handle);

        Ok(vcpu)
    }

    pub fn add_handler(&mut self, reason: VmxBasicExitReason, handler: impl Handler<H> + 'static) {
        self.exit_handler.add_handler(reason, handler);
    }

    pub fn add_exit_handler(&mut self, handler: impl Handler<H> + 'static) {
        self.exit_handler.add_exit_handler(handler);
    }

    /// Dispatches the VM-exit recorded in the current VMCS.
    pub fn handle_exit(&mut self) -> Result<(), HypervisorError> {
        let mut exit_handler = core::mem::take(&mut self.exit_handler);
        let handled = exit_handler.dispatch(self);

        // Anything registered by a handler during dispatch landed in the empty table.
        let registered = core::mem::replace(&mut self.exit_handler, exit_handler);
        self.exit_handler.absorb(registered);

        if handled {
            return Ok(());
        }

        let reason = self.vmcs.exit_reason();
        error!("vcpu {}: unhandled VM exit {:#x} at {:#x}", self.id, reason, self.vmcs.guest_rip());
        Err(HypervisorError::UnhandledVmExit { reason })
    }

    /// Enters the guest once and services the VM-exit that brings control back.
    ///
    /// The VMCS is loaded on first use, launched if it never was and resumed afterwards.
    /// Any error is fatal for this virtual processor, except a configuration violation found
    /// before the first successful launch: the VMCS can be fixed and the call repeated.
    pub fn run_once(&mut self) -> Result<(), HypervisorError> {
        if self.halted {
            return Err(HypervisorError::VcpuHalted);
        }

        let result = self.enter();
        if let Err(error) = &result {
            self.fail(error);
        }

        result
    }

    /// Runs the guest until something goes wrong and returns what did.
    pub fn run(&mut self) -> HypervisorError {
        debug!("vcpu {}: running", self.id);

        loop {
            if let Err(error) = self.run_once() {
                return error;
            }
        }
    }

    fn enter(&mut self) -> Result<(), HypervisorError> {
        if !self.vmcs.is_loaded() {
            self.vmcs.load()?;
        }

        if self.vmcs.is_launched() {
            self.vmcs.resume(&mut self.registers)?;
        } else {
            self.vmcs.launch(&mut self.registers)?;
        }

        self.registers.rip = self.vmcs.guest_rip();
        self.registers.rsp = self.vmcs.guest_rsp();
        self.registers.rflags = self.vmcs.guest_rflags();

        self.handle_exit()
    }

    fn fail(&mut self, error: &HypervisorError) {
        if matches!(error, HypervisorError::ConfigurationViolation(_)) && !self.vmcs.is_launched() {
            warn!("vcpu {}: VMCS rejected before first launch: {}", self.id, error);
            return;
        }

        #[cfg(feature = "diagnostics")]
        if self.vmcs.is_loaded() {
            crate::intel::diagnostics::dump(&self.vmcs);
        }

        error!("vcpu {}: halting: {}", self.id, error);
        self.halted = true;
    }

    /// Retires the instruction that caused the VM-exit.
    ///
    /// Returns whether RIP moved, so an exit handler can end with `vcpu.advance()`. An
    /// instruction length outside 1..=15 leaves RIP alone and the exit unhandled.
    pub fn advance(&mut self) -> bool {
        let length = u64::from(self.vmcs.exit_instruction_length());
        if !(1..=MAX_INSTRUCTION_LENGTH).contains(&length) {
            error!("vcpu {}: VM-exit instruction length {} is out of range", self.id, length);
            return false;
        }

        let rip = self.vmcs.guest_rip().wrapping_add(length);
        self.vmcs.set_guest_rip(rip);
        self.registers.rip = rip;

        true
    }

    /// Leaves VMX operation on this processor: the guest state in the VMCS becomes the
    /// processor state again and the VMCS is cleared.
    ///
    /// The guest state is read from the current VMCS, so it must be loaded. If the processor
    /// refuses to leave VMX operation the VMCS is already gone and the vcpu halts.
    pub fn promote(&mut self) -> Result<(), HypervisorError> {
        if self.role != VcpuRole::Host {
            return Err(HypervisorError::NotHostVcpu);
        }
        if !self.vmcs.is_loaded() {
            return Err(HypervisorError::VmcsNotLoaded);
        }

        debug!("vcpu {}: promoting guest state at {:#x}", self.id, self.vmcs.guest_rip());

        let state = self.promote_state();
        self.vmcs.clear()?;
        if let Err(error) = self.vmcs.hardware_mut().promote(&state, &self.registers) {
            error!("vcpu {}: promote failed, halting: {}", self.id, error);
            self.halted = true;
            return Err(error);
        }

        Ok(())
    }

    /// Moves the running operating system into VMX non-root operation.
    ///
    /// The guest state must already describe the current context. Returns after the first
    /// VM-exit has been serviced.
    pub fn demote(&mut self) -> Result<(), HypervisorError> {
        if self.role != VcpuRole::Host {
            return Err(HypervisorError::NotHostVcpu);
        }

        debug!("vcpu {}: demoting", self.id);

        if self.vmcs.is_launched() {
            return Err(HypervisorError::VmcsAlreadyLaunched);
        }

        self.run_once()
    }

    fn promote_state(&self) -> PromoteState {
        let vmcs = &self.vmcs;
        PromoteState {
            rip: vmcs.guest_rip(),
            rsp: vmcs.guest_rsp(),
            rflags: vmcs.guest_rflags(),
            cr0: vmcs.guest_cr0(),
            cr3: vmcs.guest_cr3(),
            cr4: vmcs.guest_cr4(),
            ia32_efer: vmcs.guest_ia32_efer(),
            ia32_pat: vmcs.guest_ia32_pat(),
            fs_base: vmcs.guest_fs_base(),
            gs_base: vmcs.guest_gs_base(),
            gdtr_base: vmcs.guest_gdtr_base(),
            gdtr_limit: vmcs.guest_gdtr_limit() as u16,
            idtr_base: vmcs.guest_idtr_base(),
            idtr_limit: vmcs.guest_idtr_limit() as u16,
            cs_selector: vmcs.guest_cs_selector(),
            ss_selector: vmcs.guest_ss_selector(),
            ds_selector: vmcs.guest_ds_selector(),
            es_selector: vmcs.guest_es_selector(),
            fs_selector: vmcs.guest_fs_selector(),
            gs_selector: vmcs.guest_gs_selector(),
            tr_selector: vmcs.guest_tr_selector(),
            ldtr_selector: vmcs.guest_ldtr_selector(),
        }
    }

    /// Clears the VMCS and releases its region.
    pub fn destroy(self, memory: &mut dyn PhysicalMemory) -> Result<(), HypervisorError> {
        trace!("Destroying vcpu {}", self.id);
        self.vmcs.destroy(memory)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn role(&self) -> VcpuRole {
        self.role
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn vmcs(&self) -> &Vmcs<H> {
        &self.vmcs
    }

    pub fn vmcs_mut(&mut self) -> &mut Vmcs<H> {
        &mut self.vmcs
    }

    pub fn cpuid_mut(&mut self) -> &mut CpuidDispatcher<H> {
        &mut self.cpuid
    }
}
