//! Errors raised by the VMX core.
//!
//! Every failure propagates to the virtual processor, which alone decides whether the
//! condition is fatal for the core it runs on.

use {crate::intel::check::Violation, thiserror_no_std::Error};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    /// A VM-entry compliance check failed.
    #[error("VMCS configuration violation: {0}")]
    ConfigurationViolation(Violation),

    /// No registered handler claimed the VM-exit.
    #[error("Unhandled VM exit (reason {reason:#x})")]
    UnhandledVmExit { reason: u32 },

    #[error("VMLAUNCH requires a clear VMCS")]
    VmcsAlreadyLaunched,

    #[error("VMRESUME requires a launched VMCS")]
    VmcsNotLaunched,

    #[error("The VMCS must be loaded with VMPTRLD first")]
    VmcsNotLoaded,

    #[error("Promote and demote are only valid on a host virtual processor")]
    NotHostVcpu,

    #[error("The virtual processor has halted")]
    VcpuHalted,

    /// The processor rejected the VM-entry and no compliance check explains why.
    #[error("VM-entry failed for an unknown reason (instruction error {instruction_error:#x}, exit reason {exit_reason:#x})")]
    UnknownVmEntryFailure { instruction_error: u32, exit_reason: u32 },

    #[error("VMX instruction failed without a current VMCS")]
    VmFailInvalid,

    #[error("VMCLEAR failed")]
    VmClearFailed,

    #[error("VMPTRLD failed")]
    VmPtrLoadFailed,

    #[error("VMXOFF failed")]
    VmxOffFailed,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Failed to translate address {0:#x}")]
    AddressTranslationFailed(u64),

    #[error("CPU is not supported")]
    CPUUnsupported,

    #[error("VMX is not supported")]
    VMXUnsupported,

    #[error("EPT is not supported")]
    EPTUnsupported,
}
