//! VMX instructions executed by the guest.
//!
//! The guest is not offered nested virtualization, so VMXON, VMCLEAR, VMPTRLD, VMREAD and
//! the rest fault with #UD as they would on a processor without VMX.

use {
    crate::intel::{events::EventInjection, hardware::VmxHardware, vcpu::Vcpu, vmerror::VmxBasicExitReason},
    log::*,
};

/// Exit reasons raised by guest VMX instructions.
pub const VMX_INSTRUCTION_EXITS: [VmxBasicExitReason; 12] = [
    VmxBasicExitReason::Vmcall,
    VmxBasicExitReason::Vmclear,
    VmxBasicExitReason::Vmlaunch,
    VmxBasicExitReason::Vmptrld,
    VmxBasicExitReason::Vmptrst,
    VmxBasicExitReason::Vmread,
    VmxBasicExitReason::Vmresume,
    VmxBasicExitReason::Vmwrite,
    VmxBasicExitReason::Vmxoff,
    VmxBasicExitReason::Vmxon,
    VmxBasicExitReason::Invept,
    VmxBasicExitReason::Invvpid,
];

/// Injects #UD. The faulting instruction is not retired.
pub fn inject_undefined_opcode<H: VmxHardware + 'static>(vcpu: &mut Vcpu<H>) -> bool {
    debug!("vcpu {}: guest executed a VMX instruction at {:#x}, injecting #UD", vcpu.id(), vcpu.vmcs().guest_rip());

    EventInjection::undefined_opcode().inject(vcpu.vmcs_mut(), 0);
    true
}
