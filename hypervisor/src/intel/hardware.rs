//! Processor interface used by the VMX core.
//!
//! Every privileged instruction issued by the core goes through these two traits, so the
//! same VMCS, dispatch and compliance-check code drives a physical processor
//! ([`crate::intel::support::BareMetal`]) or a synthetic one.

use {
    crate::{error::HypervisorError, intel::capture::GuestRegisters},
    x86::{cpuid::CpuIdResult, vmx::VmFail},
};

/// Read-only view of the processor: the current VMCS, model-specific registers and CPUID.
///
/// This is all the compliance checks are allowed to see.
pub trait VmxRead {
    /// Reads `field` of the VMCS currently loaded on this processor.
    fn vmread(&self, field: u32) -> u64;

    /// Reads a model-specific register.
    fn rdmsr(&self, msr: u32) -> u64;

    /// Executes CPUID for `leaf` / `sub_leaf`.
    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuIdResult;
}

/// State-changing VMX operations.
pub trait VmxHardware: VmxRead {
    /// Writes `field` of the VMCS currently loaded on this processor.
    ///
    /// Fails with `VmFailInvalid` when no VMCS is current and with `VmFailValid` when the
    /// field does not exist or is read-only.
    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), VmFail>;

    /// Executes VMCLEAR on the VMCS at `vmcs_pa`.
    fn vmclear(&mut self, vmcs_pa: u64) -> Result<(), VmFail>;

    /// Executes VMPTRLD, making the VMCS at `vmcs_pa` current.
    fn vmptrld(&mut self, vmcs_pa: u64) -> Result<(), VmFail>;

    /// Enters the guest with VMLAUNCH.
    ///
    /// This is a context switch, not a call. `Ok(())` means the guest ran and a later
    /// VM-exit brought control back through the host entry stub, with the guest's
    /// general-purpose registers spilled into `registers`. `Err` means the instruction itself
    /// was rejected and no guest code executed.
    fn vmlaunch(&mut self, registers: &mut GuestRegisters) -> Result<(), VmFail>;

    /// Enters the guest with VMRESUME. Same contract as [`VmxHardware::vmlaunch`].
    fn vmresume(&mut self, registers: &mut GuestRegisters) -> Result<(), VmFail>;

    /// Writes back and invalidates the processor caches.
    fn wbinvd(&mut self);

    /// Leaves VMX operation and continues in the guest context described by `state`.
    ///
    /// On real hardware this returns only when leaving VMX operation failed.
    fn promote(&mut self, state: &PromoteState, registers: &GuestRegisters) -> Result<(), HypervisorError>;

    /// Stops this processor for good.
    fn halt(&mut self) -> !;
}

/// Guest context the processor continues in after a promote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromoteState {
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub ia32_efer: u64,
    pub ia32_pat: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
    pub cs_selector: u16,
    pub ss_selector: u16,
    pub ds_selector: u16,
    pub es_selector: u16,
    pub fs_selector: u16,
    pub gs_selector: u16,
    pub tr_selector: u16,
    pub ldtr_selector: u16,
}
