//! Manages INVD VM exits.

use crate::intel::{hardware::VmxHardware, vcpu::Vcpu};

/// Handles INVD by writing back and invalidating the caches instead of discarding them.
///
/// INVD would throw away dirty lines that belong to the hypervisor as well, so the
/// instruction is replaced with WBINVD and retired.
pub fn handle_invd<H: VmxHardware + 'static>(vcpu: &mut Vcpu<H>) -> bool {
    log::debug!("Handling INVD VM exit on vcpu {}", vcpu.id());

    vcpu.vmcs_mut().hardware_mut().wbinvd();
    vcpu.advance()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{memory::IdentityMapped, mock::MockHardware, vcpu::VcpuRole, vmerror::VmxBasicExitReason},
        x86::vmx::vmcs,
    };

    #[test]
    fn invd_flushes_and_retires_the_instruction() {
        let mut vcpu = Vcpu::new(0, VcpuRole::Guest, MockHardware::new(), &mut IdentityMapped).unwrap();
        vcpu.add_handler(VmxBasicExitReason::Invd, handle_invd::<MockHardware>);
        vcpu.vmcs_mut().load().unwrap();
        vcpu.vmcs_mut().set_guest_rip(0x1000);
        let hardware = vcpu.vmcs_mut().hardware_mut();
        hardware.set_field(vmcs::ro::EXIT_REASON, VmxBasicExitReason::Invd as u64);
        hardware.set_field(vmcs::ro::VMEXIT_INSTRUCTION_LEN, 2);

        assert_eq!(vcpu.handle_exit(), Ok(()));

        assert_eq!(vcpu.vmcs().hardware().cache_flushes, 1);
        assert_eq!(vcpu.vmcs().guest_rip(), 0x1002);
    }
}
