//! Basic VM-exit reasons and VM-instruction error numbers.

/// Declares a `#[repr]` enum whose variants carry a short description, together with the
/// fallible conversion from the raw number and a `Display` impl.
macro_rules! numbered_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident: $repr:ty {
            $($variant:ident = $value:literal => $description:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[repr($repr)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
        pub enum $name {
            $($variant = $value,)*
        }

        impl $name {
            pub const fn from_raw(value: $repr) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }

            pub const fn description(self) -> &'static str {
                match self {
                    $(Self::$variant => $description,)*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "{}: {}", *self as $repr, self.description())
            }
        }
    };
}

numbered_enum! {
    /// Basic exit reason, the low 16 bits of the exit-reason field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table C-1. Basic Exit Reasons
    pub enum VmxBasicExitReason: u16 {
        ExceptionOrNmi = 0 => "exception or NMI",
        ExternalInterrupt = 1 => "external interrupt",
        TripleFault = 2 => "triple fault",
        InitSignal = 3 => "INIT signal",
        StartupIpi = 4 => "start-up IPI",
        IoSystemManagementInterrupt = 5 => "I/O SMI",
        OtherSmi = 6 => "other SMI",
        InterruptWindow = 7 => "interrupt window",
        NmiWindow = 8 => "NMI window",
        TaskSwitch = 9 => "task switch",
        Cpuid = 10 => "CPUID",
        Getsec = 11 => "GETSEC",
        Hlt = 12 => "HLT",
        Invd = 13 => "INVD",
        Invlpg = 14 => "INVLPG",
        Rdpmc = 15 => "RDPMC",
        Rdtsc = 16 => "RDTSC",
        Rsm = 17 => "RSM",
        Vmcall = 18 => "VMCALL",
        Vmclear = 19 => "VMCLEAR",
        Vmlaunch = 20 => "VMLAUNCH",
        Vmptrld = 21 => "VMPTRLD",
        Vmptrst = 22 => "VMPTRST",
        Vmread = 23 => "VMREAD",
        Vmresume = 24 => "VMRESUME",
        Vmwrite = 25 => "VMWRITE",
        Vmxoff = 26 => "VMXOFF",
        Vmxon = 27 => "VMXON",
        ControlRegisterAccesses = 28 => "control-register access",
        MovDr = 29 => "MOV DR",
        IoInstruction = 30 => "I/O instruction",
        Rdmsr = 31 => "RDMSR",
        Wrmsr = 32 => "WRMSR",
        VmEntryFailureInvalidGuestState = 33 => "VM-entry failure due to invalid guest state",
        VmEntryFailureMsrLoading = 34 => "VM-entry failure due to MSR loading",
        Mwait = 36 => "MWAIT",
        MonitorTrapFlag = 37 => "monitor trap flag",
        Monitor = 39 => "MONITOR",
        Pause = 40 => "PAUSE",
        VmEntryFailureMachineCheckEvent = 41 => "VM-entry failure due to machine-check event",
        TprBelowThreshold = 43 => "TPR below threshold",
        ApicAccess = 44 => "APIC access",
        VirtualizedEoi = 45 => "virtualized EOI",
        AccessToGdtrOrIdtr = 46 => "access to GDTR or IDTR",
        AccessToLdtrOrTr = 47 => "access to LDTR or TR",
        EptViolation = 48 => "EPT violation",
        EptMisconfiguration = 49 => "EPT misconfiguration",
        Invept = 50 => "INVEPT",
        Rdtscp = 51 => "RDTSCP",
        VmxPreemptionTimerExpired = 52 => "VMX-preemption timer expired",
        Invvpid = 53 => "INVVPID",
        WbinvdOrWbnoinvd = 54 => "WBINVD or WBNOINVD",
        Xsetbv = 55 => "XSETBV",
        ApicWrite = 56 => "APIC write",
        Rdrand = 57 => "RDRAND",
        Invpcid = 58 => "INVPCID",
        Vmfunc = 59 => "VMFUNC",
        Encls = 60 => "ENCLS",
        Rdseed = 61 => "RDSEED",
        PageModificationLogFull = 62 => "page-modification log full",
        Xsaves = 63 => "XSAVES",
        Xrstors = 64 => "XRSTORS",
        Pconfig = 65 => "PCONFIG",
        SppRelatedEvent = 66 => "SPP-related event",
        Umwait = 67 => "UMWAIT",
        Tpause = 68 => "TPAUSE",
        Loadiwkey = 69 => "LOADIWKEY",
        Enclv = 70 => "ENCLV",
        EnqcmdPasidTranslationFailure = 72 => "ENQCMD PASID translation failure",
        EnqcmdsPasidTranslationFailure = 73 => "ENQCMDS PASID translation failure",
        BusLock = 74 => "bus lock",
        InstructionTimeout = 75 => "instruction timeout",
    }
}

impl VmxBasicExitReason {
    /// Decodes the full 32-bit exit-reason field. Bit 31 (entry failure) and the other
    /// qualifier bits are ignored.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.9.1 Basic VM-Exit Information
    pub fn from_exit_reason(exit_reason: u32) -> Option<Self> {
        Self::from_raw((exit_reason & 0xFFFF) as u16)
    }
}

numbered_enum! {
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 31-1. VM-Instruction Error Numbers
    pub enum VmInstructionError: u32 {
        VmcallInRoot = 1 => "VMCALL executed in VMX root operation",
        VmclearInvalidAddress = 2 => "VMCLEAR with invalid physical address",
        VmclearWithVmxonPointer = 3 => "VMCLEAR with VMXON pointer",
        VmlaunchNonClearVmcs = 4 => "VMLAUNCH with non-clear VMCS",
        VmresumeNonLaunchedVmcs = 5 => "VMRESUME with non-launched VMCS",
        VmresumeAfterVmxoff = 6 => "VMRESUME after VMXOFF",
        VmEntryInvalidControlFields = 7 => "VM entry with invalid control field(s)",
        VmEntryInvalidHostState = 8 => "VM entry with invalid host-state field(s)",
        VmptrldInvalidAddress = 9 => "VMPTRLD with invalid physical address",
        VmptrldWithVmxonPointer = 10 => "VMPTRLD with VMXON pointer",
        VmptrldIncorrectVmcsRevision = 11 => "VMPTRLD with incorrect VMCS revision identifier",
        VmreadVmwriteUnsupportedVmcsComponent = 12 => "VMREAD/VMWRITE from/to unsupported VMCS component",
        VmwriteReadonlyVmcsComponent = 13 => "VMWRITE to read-only VMCS component",
        VmxonInRoot = 15 => "VMXON executed in VMX root operation",
        VmEntryInvalidExecutiveVmcsPointer = 16 => "VM entry with invalid executive-VMCS pointer",
        VmEntryNonLaunchedExecutiveVmcs = 17 => "VM entry with non-launched executive VMCS",
        VmEntryExecutiveVmcsPointerNotVmxonPointer = 18 => "VM entry with executive-VMCS pointer not VMXON pointer",
        VmcallNonClearVmcs = 19 => "VMCALL with non-clear VMCS",
        VmcallInvalidVmExitControlFields = 20 => "VMCALL with invalid VM-exit control fields",
        VmcallIncorrectMsegRevision = 22 => "VMCALL with incorrect MSEG revision identifier",
        VmxoffUnderDualMonitorTreatment = 23 => "VMXOFF under dual-monitor treatment of SMIs and SMM",
        VmcallInvalidSmmMonitorFeatures = 24 => "VMCALL with invalid SMM-monitor features",
        VmEntryInvalidVmExecutionControlFieldsExecutiveVmcs = 25 => "VM entry with invalid VM-execution control fields in executive VMCS",
        VmEntryEventsBlockedByMovSs = 26 => "VM entry with events blocked by MOV SS",
        InvalidOperandToInveptInvvpid = 28 => "invalid operand to INVEPT/INVVPID",
    }
}
