//! VM-execution, VM-exit and VM-entry control bits.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6 VM-Execution Control Fields
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.7 VM-Exit Control Fields
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.8 VM-Entry Control Fields

/// The five control fields whose settings are constrained by a capability MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// Pin-based VM-execution controls (Table 25-5).
pub mod pin {
    pub const EXTERNAL_INTERRUPT_EXITING: u64 = 1 << 0;
    pub const NMI_EXITING: u64 = 1 << 3;
    pub const VIRTUAL_NMIS: u64 = 1 << 5;
    pub const ACTIVATE_VMX_PREEMPTION_TIMER: u64 = 1 << 6;
    pub const PROCESS_POSTED_INTERRUPTS: u64 = 1 << 7;
}

/// Primary processor-based VM-execution controls (Table 25-6).
pub mod primary {
    pub const INTERRUPT_WINDOW_EXITING: u64 = 1 << 2;
    pub const USE_TSC_OFFSETTING: u64 = 1 << 3;
    pub const HLT_EXITING: u64 = 1 << 7;
    pub const CR3_LOAD_EXITING: u64 = 1 << 15;
    pub const CR3_STORE_EXITING: u64 = 1 << 16;
    pub const USE_TPR_SHADOW: u64 = 1 << 21;
    pub const NMI_WINDOW_EXITING: u64 = 1 << 22;
    pub const USE_IO_BITMAPS: u64 = 1 << 25;
    pub const MONITOR_TRAP_FLAG: u64 = 1 << 27;
    pub const USE_MSR_BITMAPS: u64 = 1 << 28;
    pub const ACTIVATE_SECONDARY_CONTROLS: u64 = 1 << 31;
}

/// Secondary processor-based VM-execution controls (Table 25-7).
pub mod secondary {
    pub const VIRTUALIZE_APIC_ACCESSES: u64 = 1 << 0;
    pub const ENABLE_EPT: u64 = 1 << 1;
    pub const ENABLE_RDTSCP: u64 = 1 << 3;
    pub const VIRTUALIZE_X2APIC_MODE: u64 = 1 << 4;
    pub const ENABLE_VPID: u64 = 1 << 5;
    pub const UNRESTRICTED_GUEST: u64 = 1 << 7;
    pub const APIC_REGISTER_VIRTUALIZATION: u64 = 1 << 8;
    pub const VIRTUAL_INTERRUPT_DELIVERY: u64 = 1 << 9;
    pub const ENABLE_INVPCID: u64 = 1 << 12;
    pub const ENABLE_VM_FUNCTIONS: u64 = 1 << 13;
    pub const VMCS_SHADOWING: u64 = 1 << 14;
    pub const ENABLE_PML: u64 = 1 << 17;
    pub const EPT_VIOLATION_VE: u64 = 1 << 18;
    pub const CONCEAL_VMX_FROM_PT: u64 = 1 << 19;
    pub const ENABLE_XSAVES_XRSTORS: u64 = 1 << 20;
}

/// Primary VM-exit controls (Table 25-13).
pub mod exit {
    pub const SAVE_DEBUG_CONTROLS: u64 = 1 << 2;
    pub const HOST_ADDRESS_SPACE_SIZE: u64 = 1 << 9;
    pub const LOAD_IA32_PERF_GLOBAL_CTRL: u64 = 1 << 12;
    pub const ACKNOWLEDGE_INTERRUPT_ON_EXIT: u64 = 1 << 15;
    pub const SAVE_IA32_PAT: u64 = 1 << 18;
    pub const LOAD_IA32_PAT: u64 = 1 << 19;
    pub const SAVE_IA32_EFER: u64 = 1 << 20;
    pub const LOAD_IA32_EFER: u64 = 1 << 21;
    pub const SAVE_VMX_PREEMPTION_TIMER: u64 = 1 << 22;
    pub const CONCEAL_VMX_FROM_PT: u64 = 1 << 24;
}

/// VM-entry controls (Table 25-15).
pub mod entry {
    pub const LOAD_DEBUG_CONTROLS: u64 = 1 << 2;
    pub const IA32E_MODE_GUEST: u64 = 1 << 9;
    pub const ENTRY_TO_SMM: u64 = 1 << 10;
    pub const DEACTIVATE_DUAL_MONITOR_TREATMENT: u64 = 1 << 11;
    pub const LOAD_IA32_PERF_GLOBAL_CTRL: u64 = 1 << 13;
    pub const LOAD_IA32_PAT: u64 = 1 << 14;
    pub const LOAD_IA32_EFER: u64 = 1 << 15;
    pub const LOAD_IA32_BNDCFGS: u64 = 1 << 16;
    pub const CONCEAL_VMX_FROM_PT: u64 = 1 << 17;
}
