//! CPUID VM-exit handling.
//!
//! CPUID handlers are keyed by leaf (EAX) on two tiers:
//!
//! * emulation handlers run without executing CPUID; the result registers are zeroed first
//!   and the handler that claims the leaf must retire the instruction itself.
//! * pass-through handlers see the result of the real CPUID and may rewrite it. If none of
//!   them claims the leaf, the result is returned to the guest and RIP is advanced.
//!
//! A leaf with no handler at all is passed straight through.

use {
    crate::{
        global_const::{HYPERVISOR_CPUID_LEAF, HYPERVISOR_CPUID_SIGNATURE},
        intel::{
            hardware::VmxHardware,
            vcpu::Vcpu,
            vmexit::{BoxedHandler, Handler},
        },
    },
    alloc::{boxed::Box, collections::BTreeMap, vec::Vec},
    bit_field::BitField,
    log::*,
};

/// Hypervisor-present bit in CPUID.1:ECX.
const CPUID_1_ECX_HYPERVISOR_PRESENT: usize = 31;
/// VMX bit in CPUID.1:ECX.
const CPUID_1_ECX_VMX: usize = 5;

pub struct CpuidDispatcher<H> {
    emulators: BTreeMap<u32, Vec<BoxedHandler<H>>>,
    pass_through: BTreeMap<u32, Vec<BoxedHandler<H>>>,
}

impl<H> Default for CpuidDispatcher<H> {
    fn default() -> Self {
        Self {
            emulators: BTreeMap::new(),
            pass_through: BTreeMap::new(),
        }
    }
}

impl<H> core::fmt::Debug for CpuidDispatcher<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuidDispatcher")
            .field("emulated_leaves", &self.emulators.keys().collect::<Vec<_>>())
            .field("pass_through_leaves", &self.pass_through.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<H: VmxHardware + 'static> CpuidDispatcher<H> {
    pub fn add_emulation_handler(&mut self, leaf: u32, handler: impl Handler<H> + 'static) {
        self.emulators.entry(leaf).or_default().push(Box::new(handler));
    }

    pub fn add_pass_through_handler(&mut self, leaf: u32, handler: impl Handler<H> + 'static) {
        self.pass_through.entry(leaf).or_default().push(Box::new(handler));
    }

    /// The CPUID exit handler registered on every virtual processor.
    pub fn handle(vcpu: &mut Vcpu<H>) -> bool {
        let mut dispatcher = core::mem::take(vcpu.cpuid_mut());
        let handled = dispatcher.dispatch(vcpu);

        let registered = core::mem::replace(vcpu.cpuid_mut(), dispatcher);
        vcpu.cpuid_mut().absorb(registered);

        handled
    }

    fn dispatch(&mut self, vcpu: &mut Vcpu<H>) -> bool {
        let leaf = vcpu.registers.rax as u32;
        let sub_leaf = vcpu.registers.rcx as u32;

        if let Some(chain) = self.emulators.get_mut(&leaf).filter(|chain| !chain.is_empty()) {
            trace!("Emulating CPUID leaf {:#x}:{:#x}", leaf, sub_leaf);
            vcpu.registers.set_cpuid_result(0, 0, 0, 0);
            return chain.iter_mut().rev().any(|handler| handler.invoke(vcpu));
        }

        let result = vcpu.vmcs().hardware().cpuid(leaf, sub_leaf);
        vcpu.registers.set_cpuid_result(result.eax, result.ebx, result.ecx, result.edx);

        if let Some(chain) = self.pass_through.get_mut(&leaf) {
            if chain.iter_mut().rev().any(|handler| handler.invoke(vcpu)) {
                return true;
            }
        }

        vcpu.advance()
    }

    fn absorb(&mut self, newer: CpuidDispatcher<H>) {
        for (leaf, handlers) in newer.emulators {
            self.emulators.entry(leaf).or_default().extend(handlers);
        }
        for (leaf, handlers) in newer.pass_through {
            self.pass_through.entry(leaf).or_default().extend(handlers);
        }
    }
}

/// Reports the hypervisor vendor leaf: the highest hypervisor leaf and the signature.
pub fn emulate_hypervisor_leaf<H: VmxHardware + 'static>(vcpu: &mut Vcpu<H>) -> bool {
    let signature = HYPERVISOR_CPUID_SIGNATURE;
    let word = |index: usize| u32::from_le_bytes([signature[index], signature[index + 1], signature[index + 2], signature[index + 3]]);

    vcpu.registers.set_cpuid_result(HYPERVISOR_CPUID_LEAF, word(0), word(4), word(8));
    vcpu.advance()
}

/// Leaf 1: announce a hypervisor and hide VMX from the guest.
///
/// Returns `false` so the dispatcher hands the result back and retires the instruction.
pub fn hide_vmx<H: VmxHardware + 'static>(vcpu: &mut Vcpu<H>) -> bool {
    let mut ecx = vcpu.registers.rcx as u32;
    ecx.set_bit(CPUID_1_ECX_VMX, false);
    ecx.set_bit(CPUID_1_ECX_HYPERVISOR_PRESENT, true);
    vcpu.registers.rcx = u64::from(ecx);
    false
}

/// Installs the default CPUID leaves.
pub fn register_default_leaves<H: VmxHardware + 'static>(dispatcher: &mut CpuidDispatcher<H>) {
    dispatcher.add_emulation_handler(HYPERVISOR_CPUID_LEAF, emulate_hypervisor_leaf::<H>);
    dispatcher.add_pass_through_handler(1, hide_vmx::<H>);
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::HypervisorError,
            intel::{memory::IdentityMapped, mock::MockHardware, vcpu::VcpuRole, vmerror::VmxBasicExitReason},
        },
        x86::vmx::vmcs,
    };

    const GUEST_RIP: u64 = 0x7000;

    fn vcpu() -> Vcpu<MockHardware> {
        let mut vcpu = Vcpu::new(0, VcpuRole::Guest, MockHardware::new(), &mut IdentityMapped).unwrap();
        vcpu.vmcs_mut().load().unwrap();
        vcpu.vmcs_mut().set_guest_rip(GUEST_RIP);
        vcpu.registers.rip = GUEST_RIP;
        let hardware = vcpu.vmcs_mut().hardware_mut();
        hardware.set_field(vmcs::ro::EXIT_REASON, VmxBasicExitReason::Cpuid as u64);
        hardware.set_field(vmcs::ro::VMEXIT_INSTRUCTION_LEN, 2);
        vcpu
    }

    fn cpuid(vcpu: &mut Vcpu<MockHardware>, leaf: u32) -> Result<(), HypervisorError> {
        vcpu.registers.rax = u64::from(leaf);
        vcpu.registers.rcx = 0;
        vcpu.handle_exit()
    }

    #[test]
    fn emulated_leaf_never_executes_cpuid() {
        let mut vcpu = vcpu();
        vcpu.cpuid_mut().add_emulation_handler(HYPERVISOR_CPUID_LEAF, |vcpu: &mut Vcpu<MockHardware>| {
            assert_eq!((vcpu.registers.rax, vcpu.registers.rbx, vcpu.registers.rcx, vcpu.registers.rdx), (0, 0, 0, 0));
            vcpu.registers.set_cpuid_result(0x4000_0001, 0x1111, 0x2222, 0x3333);
            vcpu.advance()
        });
        vcpu.vmcs_mut().hardware_mut().set_cpuid(HYPERVISOR_CPUID_LEAF, 0, [0xDEAD, 0xBEEF, 0xDEAD, 0xBEEF]);

        assert_eq!(cpuid(&mut vcpu, HYPERVISOR_CPUID_LEAF), Ok(()));

        assert_eq!(vcpu.vmcs().hardware().cpuid_executions(HYPERVISOR_CPUID_LEAF), 0);
        assert_eq!(vcpu.registers.rax, 0x4000_0001);
        assert_eq!(vcpu.registers.rdx, 0x3333);
        assert_eq!(vcpu.vmcs().guest_rip(), GUEST_RIP + 2);
    }

    #[test]
    fn emulated_leaf_without_a_claim_is_unhandled() {
        let mut vcpu = vcpu();
        vcpu.cpuid_mut().add_emulation_handler(0x4000_0010, |_: &mut Vcpu<MockHardware>| false);

        assert_eq!(cpuid(&mut vcpu, 0x4000_0010), Err(HypervisorError::UnhandledVmExit { reason: 10 }));
        assert_eq!(vcpu.vmcs().guest_rip(), GUEST_RIP);
    }

    #[test]
    fn unknown_leaf_is_passed_through_and_retired() {
        let mut vcpu = vcpu();

        assert_eq!(cpuid(&mut vcpu, 0), Ok(()));

        assert_eq!(vcpu.vmcs().hardware().cpuid_executions(0), 1);
        assert_eq!(vcpu.registers.rax, 0x16);
        assert_eq!(vcpu.registers.rbx, 0x756E_6547);
        assert_eq!(vcpu.vmcs().guest_rip(), GUEST_RIP + 2);
        assert_eq!(vcpu.registers.rip, GUEST_RIP + 2);
    }

    #[test]
    fn pass_through_handlers_see_the_real_result() {
        let mut vcpu = vcpu();
        register_default_leaves(vcpu.cpuid_mut());

        assert_eq!(cpuid(&mut vcpu, 1), Ok(()));

        assert_eq!(vcpu.vmcs().hardware().cpuid_executions(1), 1);
        let ecx = vcpu.registers.rcx as u32;
        assert!(!ecx.get_bit(CPUID_1_ECX_VMX));
        assert!(ecx.get_bit(CPUID_1_ECX_HYPERVISOR_PRESENT));
        assert_eq!(vcpu.registers.rdx, 0xBFEB_FBFF);
        assert_eq!(vcpu.vmcs().guest_rip(), GUEST_RIP + 2);
    }

    #[test]
    fn claiming_pass_through_handler_retires_nothing_automatically() {
        let mut vcpu = vcpu();
        vcpu.cpuid_mut().add_pass_through_handler(0, |_: &mut Vcpu<MockHardware>| true);

        assert_eq!(cpuid(&mut vcpu, 0), Ok(()));
        assert_eq!(vcpu.vmcs().guest_rip(), GUEST_RIP);
    }

    #[test]
    fn hypervisor_leaf_reports_signature() {
        let mut vcpu = vcpu();
        register_default_leaves(vcpu.cpuid_mut());

        assert_eq!(cpuid(&mut vcpu, HYPERVISOR_CPUID_LEAF), Ok(()));

        let mut signature = [0u8; 12];
        signature[0..4].copy_from_slice(&(vcpu.registers.rbx as u32).to_le_bytes());
        signature[4..8].copy_from_slice(&(vcpu.registers.rcx as u32).to_le_bytes());
        signature[8..12].copy_from_slice(&(vcpu.registers.rdx as u32).to_le_bytes());
        assert_eq!(&signature, b"VmxCoreHvisr");
        assert_eq!(vcpu.registers.rax, u64::from(HYPERVISOR_CPUID_LEAF));
        assert_eq!(vcpu.vmcs().hardware().cpuid_executions(HYPERVISOR_CPUID_LEAF), 0);
    }
}
