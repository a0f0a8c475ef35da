//! Per-processor VMX capability snapshot, read once when a VMCS is created.

use {
    crate::{
        global_const::DEFAULT_PHYSICAL_ADDRESS_WIDTH,
        intel::{
            controls::{VmxControl, primary, secondary},
            hardware::VmxRead,
        },
    },
    bit_field::BitField,
    x86::msr,
    x86_64::registers::control::Cr0Flags,
};

/// IA32_VMX_VMFUNC is not exported by the `x86` crate version in use.
pub const IA32_VMX_VMFUNC: u32 = 0x491;

/// Bit 55 of IA32_VMX_BASIC: the TRUE_* control MSRs are supported.
const VMX_BASIC_TRUE_CONTROLS: usize = 55;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmxCapabilities {
    pub basic: u64,
    pub pin_based: u64,
    pub processor_based: u64,
    pub processor_based2: u64,
    pub vm_exit: u64,
    pub vm_entry: u64,
    pub misc: u64,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    pub ept_vpid_cap: u64,
    pub vm_functions: u64,
    pub physical_address_width: u8,
}

impl VmxCapabilities {
    /// Reads every VMX capability MSR the core relies on.
    ///
    /// MSRs that only exist when a control is allowed (PROCBASED_CTLS2, EPT_VPID_CAP, VMFUNC)
    /// are only read when the processor advertises that control; otherwise they read as 0.
    pub fn read(hardware: &dyn VmxRead) -> Self {
        let basic = hardware.rdmsr(msr::IA32_VMX_BASIC);
        let true_controls = basic.get_bit(VMX_BASIC_TRUE_CONTROLS);

        let processor_based = hardware.rdmsr(control_msr(VmxControl::ProcessorBased, true_controls));
        let processor_based2 = match allowed1(processor_based) & primary::ACTIVATE_SECONDARY_CONTROLS {
            0 => 0,
            _ => hardware.rdmsr(msr::IA32_VMX_PROCBASED_CTLS2),
        };

        let ept_vpid_cap = match allowed1(processor_based2) & (secondary::ENABLE_EPT | secondary::ENABLE_VPID) {
            0 => 0,
            _ => hardware.rdmsr(msr::IA32_VMX_EPT_VPID_CAP),
        };

        let vm_functions = match allowed1(processor_based2) & secondary::ENABLE_VM_FUNCTIONS {
            0 => 0,
            _ => hardware.rdmsr(IA32_VMX_VMFUNC),
        };

        let capabilities = Self {
            basic,
            pin_based: hardware.rdmsr(control_msr(VmxControl::PinBased, true_controls)),
            processor_based,
            processor_based2,
            vm_exit: hardware.rdmsr(control_msr(VmxControl::VmExit, true_controls)),
            vm_entry: hardware.rdmsr(control_msr(VmxControl::VmEntry, true_controls)),
            misc: hardware.rdmsr(msr::IA32_VMX_MISC),
            cr0_fixed0: hardware.rdmsr(msr::IA32_VMX_CR0_FIXED0),
            cr0_fixed1: hardware.rdmsr(msr::IA32_VMX_CR0_FIXED1),
            cr4_fixed0: hardware.rdmsr(msr::IA32_VMX_CR4_FIXED0),
            cr4_fixed1: hardware.rdmsr(msr::IA32_VMX_CR4_FIXED1),
            ept_vpid_cap,
            vm_functions,
            physical_address_width: physical_address_width(hardware),
        };

        log::trace!("VMX capabilities: {:#x?}", capabilities);

        capabilities
    }

    /// VMCS revision identifier (bits 30:0 of IA32_VMX_BASIC).
    pub fn revision_id(&self) -> u32 {
        self.basic.get_bits(0..31) as u32
    }

    pub fn true_controls(&self) -> bool {
        self.basic.get_bit(VMX_BASIC_TRUE_CONTROLS)
    }

    /// The capability MSR value that constrains `control`.
    pub fn capability(&self, control: VmxControl) -> u64 {
        match control {
            VmxControl::PinBased => self.pin_based,
            VmxControl::ProcessorBased => self.processor_based,
            VmxControl::ProcessorBased2 => self.processor_based2,
            VmxControl::VmExit => self.vm_exit,
            VmxControl::VmEntry => self.vm_entry,
        }
    }

    /// Returns `requested` with every must-be-1 bit set and every must-be-0 bit cleared.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.3 VM-Execution Controls
    pub fn adjust_controls(&self, control: VmxControl, requested: u64) -> u64 {
        let capability = self.capability(control);
        (requested | allowed0(capability)) & allowed1(capability)
    }

    /// Applies the CR0 fixed bits. With unrestricted guest, PE and PG may be 0.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.7 VMX-Fixed Bits in CR0
    pub fn apply_cr0_fixed(&self, value: u64, unrestricted_guest: bool) -> u64 {
        let mut fixed0 = self.cr0_fixed0;
        if unrestricted_guest {
            fixed0 &= !(Cr0Flags::PROTECTED_MODE_ENABLE.bits() | Cr0Flags::PAGING.bits());
        }
        (value | fixed0) & self.cr0_fixed1
    }

    /// Applies the CR4 fixed bits.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.8 VMX-Fixed Bits in CR4
    pub fn apply_cr4_fixed(&self, value: u64) -> u64 {
        (value | self.cr4_fixed0) & self.cr4_fixed1
    }

    /// Bits that may be set in a physical address on this processor.
    pub fn physical_address_mask(&self) -> u64 {
        physical_address_mask(self.physical_address_width)
    }
}

/// The capability MSR that constrains `control`.
///
/// PROCBASED_CTLS2 has no TRUE variant, so it is used unconditionally.
pub fn control_msr(control: VmxControl, true_controls: bool) -> u32 {
    match (control, true_controls) {
        (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
        (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
    }
}

/// Allowed 0-settings: bits that must be 1.
pub fn allowed0(capability: u64) -> u64 {
    capability & 0xFFFF_FFFF
}

/// Allowed 1-settings: bits that may be 1.
pub fn allowed1(capability: u64) -> u64 {
    capability >> 32
}

/// MAXPHYADDR as reported by CPUID leaf 0x8000_0008.
pub fn physical_address_width(hardware: &dyn VmxRead) -> u8 {
    let max_extended_leaf = hardware.cpuid(0x8000_0000, 0).eax;
    if max_extended_leaf < 0x8000_0008 {
        return DEFAULT_PHYSICAL_ADDRESS_WIDTH;
    }
    hardware.cpuid(0x8000_0008, 0).eax.get_bits(0..8) as u8
}

pub fn physical_address_mask(width: u8) -> u64 {
    match width {
        0 => 0,
        64..=u8::MAX => u64::MAX,
        width => (1u64 << width) - 1,
    }
}
