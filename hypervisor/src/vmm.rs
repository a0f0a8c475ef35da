//! Entry point for a virtual processor.
//!
//! The loader creates the [`Vcpu`], fills in its guest and host state and hands it to
//! [`start`]. From there the virtual processor runs until an unrecoverable error, after
//! which the logical processor is halted.

use {
    crate::{
        error::HypervisorError,
        global_const::{DEFAULT_LOG_LEVEL, DEFAULT_SERIAL_PORT},
        intel::{
            hardware::{VmxHardware, VmxRead},
            vcpu::{Vcpu, VcpuRole},
            vmerror::VmxBasicExitReason,
            vmexit::{
                cpuid::register_default_leaves,
                exit_tracer,
                invd::handle_invd,
                vmx_instruction::{inject_undefined_opcode, VMX_INSTRUCTION_EXITS},
            },
        },
        logger,
    },
    bit_field::BitField,
    log::*,
    x86::msr::IA32_VMX_EPT_VPID_CAP,
};

/// VMX bit in CPUID.1:ECX.
const CPUID_1_ECX_VMX: usize = 5;
/// Page-walk length of 4 in IA32_VMX_EPT_VPID_CAP.
const EPT_PAGE_WALK_LENGTH_4: usize = 6;

/// Runs `vcpu` on the current logical processor and never returns.
///
/// A host virtual processor first demotes the running operating system into the guest.
pub fn start<H: VmxHardware + 'static>(mut vcpu: Vcpu<H>) -> ! {
    logger::init(DEFAULT_SERIAL_PORT, DEFAULT_LOG_LEVEL);
    info!("Starting vcpu {} ({:?})", vcpu.id(), vcpu.role());

    register_default_handlers(&mut vcpu);
    let error = virtualize(&mut vcpu);

    error!("vcpu {} stopped: {}", vcpu.id(), error);
    vcpu.vmcs_mut().hardware_mut().halt()
}

/// Drives `vcpu` until it fails and returns the error that stopped it.
pub fn virtualize<H: VmxHardware + 'static>(vcpu: &mut Vcpu<H>) -> HypervisorError {
    if vcpu.role() == VcpuRole::Host {
        if let Err(error) = vcpu.demote() {
            return error;
        }
        info!("vcpu {}: operating system demoted into VMX non-root operation", vcpu.id());
    }

    vcpu.run()
}

/// Installs the handlers every virtual processor starts with.
///
/// Registered first, so anything added later by the caller takes precedence.
pub fn register_default_handlers<H: VmxHardware + 'static>(vcpu: &mut Vcpu<H>) {
    register_default_leaves(vcpu.cpuid_mut());

    vcpu.add_handler(VmxBasicExitReason::Invd, handle_invd::<H>);
    vcpu.add_handler(VmxBasicExitReason::WbinvdOrWbnoinvd, handle_invd::<H>);
    for reason in VMX_INSTRUCTION_EXITS {
        vcpu.add_handler(reason, inject_undefined_opcode::<H>);
    }

    vcpu.add_exit_handler(exit_tracer::<H>());
}

/// Checks if the CPU is supported for hypervisor operation.
pub fn check_supported_cpu(hardware: &dyn VmxRead) -> Result<(), HypervisorError> {
    let vendor = hardware.cpuid(0, 0);
    let is_intel = vendor.ebx.to_le_bytes() == *b"Genu" && vendor.edx.to_le_bytes() == *b"ineI" && vendor.ecx.to_le_bytes() == *b"ntel";
    if is_intel {
        info!("CPU is Intel");
    } else {
        return Err(HypervisorError::CPUUnsupported);
    }

    if hardware.cpuid(1, 0).ecx.get_bit(CPUID_1_ECX_VMX) {
        info!("Virtual Machine Extension (VMX) technology is supported");
    } else {
        return Err(HypervisorError::VMXUnsupported);
    }

    if hardware.rdmsr(IA32_VMX_EPT_VPID_CAP).get_bit(EPT_PAGE_WALK_LENGTH_4) {
        info!("Extended Page Tables (EPT) are supported");
    } else {
        return Err(HypervisorError::EPTUnsupported);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            global_const::HYPERVISOR_CPUID_LEAF,
            intel::{
                memory::IdentityMapped,
                mock::{LaunchOutcome, MockHardware},
            },
        },
        x86::vmx::vmcs,
    };

    fn vcpu(role: VcpuRole) -> Vcpu<MockHardware> {
        let mut vcpu = Vcpu::new(1, role, MockHardware::new(), &mut IdentityMapped).unwrap();
        register_default_handlers(&mut vcpu);
        vcpu.vmcs_mut().load().unwrap();
        vcpu.vmcs_mut().set_guest_rip(0x4000);
        vcpu.vmcs_mut().hardware_mut().set_field(vmcs::ro::VMEXIT_INSTRUCTION_LEN, 2);
        vcpu
    }

    #[test]
    fn mock_processor_is_supported() {
        assert_eq!(check_supported_cpu(&MockHardware::new()), Ok(()));
    }

    #[test]
    fn other_vendors_are_rejected() {
        let mut hardware = MockHardware::new();
        // "AuthenticAMD"
        hardware.set_cpuid(0, 0, [0x10, 0x6874_7541, 0x444D_4163, 0x6974_6E65]);

        assert_eq!(check_supported_cpu(&hardware), Err(HypervisorError::CPUUnsupported));
    }

    #[test]
    fn vmx_and_ept_are_required() {
        let mut hardware = MockHardware::new();
        hardware.set_cpuid(1, 0, [0x0009_06EA, 0x0010_0800, 0x7FFA_FBDF, 0xBFEB_FBFF]);
        assert_eq!(check_supported_cpu(&hardware), Err(HypervisorError::VMXUnsupported));

        let mut hardware = MockHardware::new();
        hardware.set_msr(IA32_VMX_EPT_VPID_CAP, 0);
        assert_eq!(check_supported_cpu(&hardware), Err(HypervisorError::EPTUnsupported));
    }

    #[test]
    fn default_handlers_cover_vmx_instructions_and_cache_flushes() {
        let mut vcpu = vcpu(VcpuRole::Guest);

        vcpu.vmcs_mut().hardware_mut().set_field(vmcs::ro::EXIT_REASON, VmxBasicExitReason::WbinvdOrWbnoinvd as u64);
        assert_eq!(vcpu.handle_exit(), Ok(()));
        assert_eq!(vcpu.vmcs().hardware().cache_flushes, 1);
        assert_eq!(vcpu.vmcs().guest_rip(), 0x4002);

        vcpu.vmcs_mut().hardware_mut().set_field(vmcs::ro::EXIT_REASON, VmxBasicExitReason::Vmptrld as u64);
        assert_eq!(vcpu.handle_exit(), Ok(()));
        assert_eq!(vcpu.vmcs().entry_interruption_info(), 0x8000_0306);
        assert_eq!(vcpu.vmcs().guest_rip(), 0x4002);
    }

    #[test]
    fn host_vcpu_is_demoted_and_runs_until_an_unhandled_exit() {
        let mut vcpu = vcpu(VcpuRole::Host);
        let hardware = vcpu.vmcs_mut().hardware_mut();
        hardware.script(LaunchOutcome::Exit(VmxBasicExitReason::Cpuid as u32));
        hardware.script(LaunchOutcome::Exit(VmxBasicExitReason::Hlt as u32));
        vcpu.registers.rax = u64::from(HYPERVISOR_CPUID_LEAF);

        let error = virtualize(&mut vcpu);

        assert_eq!(error, HypervisorError::UnhandledVmExit { reason: VmxBasicExitReason::Hlt as u32 });
        assert_eq!(vcpu.registers.rax, u64::from(HYPERVISOR_CPUID_LEAF));
        assert_eq!(vcpu.registers.rbx, u64::from(u32::from_le_bytes(*b"VmxC")));
        assert_eq!(vcpu.vmcs().hardware().entries, 2);
        assert!(vcpu.is_halted());
    }

    #[test]
    fn launched_host_vcpu_cannot_be_demoted_again() {
        let mut vcpu = vcpu(VcpuRole::Host);
        vcpu.vmcs_mut().hardware_mut().script(LaunchOutcome::Exit(VmxBasicExitReason::Invd as u32));
        assert_eq!(vcpu.demote(), Ok(()));

        assert_eq!(virtualize(&mut vcpu), HypervisorError::VmcsAlreadyLaunched);
    }
}
