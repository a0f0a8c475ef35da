//! Synthetic processor used by the unit tests.
//!
//! Models field storage for every VMCS it has seen, the current-VMCS pointer, a table of
//! MSRs and a table of CPUID leaves. The defaults describe a processor that allows every VMX
//! control and reports the usual fixed bits.

use {
    crate::{
        error::HypervisorError,
        intel::{
            capture::GuestRegisters,
            hardware::{PromoteState, VmxHardware, VmxRead},
        },
    },
    alloc::{collections::BTreeMap, collections::VecDeque, vec::Vec},
    core::cell::RefCell,
    x86::{cpuid::CpuIdResult, msr, vmx::VmFail, vmx::vmcs},
};

/// Physical address of the VMCS made current by [`MockHardware::loaded`].
const SCRATCH_VMCS: u64 = 0x1000;

/// What the next VMLAUNCH / VMRESUME does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The guest runs and exits with this basic exit reason.
    Exit(u32),
    /// VM-entry fails during guest-state loading; the exit reason has bit 31 set.
    EntryFailure(u32),
    /// VMfailValid with this VM-instruction error number.
    FailValid(u32),
    FailInvalid,
}

#[derive(Debug)]
pub struct MockHardware {
    /// Field values of each VMCS, keyed by its physical address.
    fields: BTreeMap<u64, BTreeMap<u32, u64>>,
    msrs: BTreeMap<u32, u64>,
    cpuid: BTreeMap<(u32, u32), [u32; 4]>,
    cpuid_log: RefCell<Vec<(u32, u32)>>,
    current: Option<u64>,
    launch_state: BTreeMap<u64, bool>,
    outcomes: VecDeque<LaunchOutcome>,
    /// Guest registers the next successful entry leaves behind.
    pub exit_registers: Option<GuestRegisters>,
    pub vmclear_count: usize,
    pub entries: usize,
    pub cache_flushes: usize,
    pub promoted: Option<PromoteState>,
    /// Makes the next promote fail as if VMXOFF had been rejected.
    pub fail_promote: bool,
}

impl Default for MockHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHardware {
    pub fn new() -> Self {
        let all_allowed = 0xFFFF_FFFF_0000_0000;
        let msrs = BTreeMap::from([
            (msr::IA32_FEATURE_CONTROL, 0x5),
            // Revision 0x12, 4 KiB region, write-back, TRUE controls.
            (msr::IA32_VMX_BASIC, 0x12 | (0x1000 << 32) | (6 << 50) | (1 << 55)),
            (msr::IA32_VMX_PINBASED_CTLS, all_allowed | 0x16),
            (msr::IA32_VMX_PROCBASED_CTLS, all_allowed | 0x0401_E172),
            (msr::IA32_VMX_EXIT_CTLS, all_allowed | 0x0003_6DFF),
            (msr::IA32_VMX_ENTRY_CTLS, all_allowed | 0x11FF),
            (msr::IA32_VMX_TRUE_PINBASED_CTLS, all_allowed),
            (msr::IA32_VMX_TRUE_PROCBASED_CTLS, all_allowed),
            (msr::IA32_VMX_TRUE_EXIT_CTLS, all_allowed),
            (msr::IA32_VMX_TRUE_ENTRY_CTLS, all_allowed),
            (msr::IA32_VMX_PROCBASED_CTLS2, all_allowed),
            // Activity states HLT, shutdown and wait-for-SIPI; four CR3 targets.
            (msr::IA32_VMX_MISC, (4 << 16) | (0b111 << 6) | (1 << 5)),
            (msr::IA32_VMX_CR0_FIXED0, 0x8000_0021),
            (msr::IA32_VMX_CR0_FIXED1, 0xFFFF_FFFF),
            (msr::IA32_VMX_CR4_FIXED0, 0x2000),
            (msr::IA32_VMX_CR4_FIXED1, 0x0037_27FF),
            // Page-walk length 4, UC and WB EPT memory types, accessed/dirty flags.
            (msr::IA32_VMX_EPT_VPID_CAP, (1 << 6) | (1 << 8) | (1 << 14) | (1 << 21)),
            (crate::intel::capabilities::IA32_VMX_VMFUNC, 1),
            (msr::IA32_EFER, 0xD01),
            (msr::IA32_PAT, 0x0007_0406_0007_0406),
        ]);

        let cpuid = BTreeMap::from([
            ((0, 0), [0x16, 0x756E_6547, 0x6C65_746E, 0x4965_6E69]),
            ((1, 0), [0x0009_06EA, 0x0010_0800, 0x7FFA_FBFF, 0xBFEB_FBFF]),
            ((0x8000_0000, 0), [0x8000_0008, 0, 0, 0]),
            ((0x8000_0008, 0), [0x3030, 0, 0, 0]),
        ]);

        Self {
            fields: BTreeMap::new(),
            msrs,
            cpuid,
            cpuid_log: RefCell::new(Vec::new()),
            current: None,
            launch_state: BTreeMap::new(),
            outcomes: VecDeque::new(),
            exit_registers: None,
            vmclear_count: 0,
            entries: 0,
            cache_flushes: 0,
            promoted: None,
            fail_promote: false,
        }
    }

    /// A processor with a scratch VMCS already current, for tests that only exercise
    /// field checks.
    pub fn loaded() -> Self {
        let mut hardware = Self::new();
        hardware.current = Some(SCRATCH_VMCS);
        hardware
    }

    pub fn msr(&self, msr: u32) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or(0)
    }

    pub fn set_msr(&mut self, msr: u32, value: u64) {
        self.msrs.insert(msr, value);
    }

    pub fn set_cpuid(&mut self, leaf: u32, sub_leaf: u32, registers: [u32; 4]) {
        self.cpuid.insert((leaf, sub_leaf), registers);
    }

    /// Number of times CPUID `leaf` was executed on this processor.
    pub fn cpuid_executions(&self, leaf: u32) -> usize {
        self.cpuid_log.borrow().iter().filter(|(l, _)| *l == leaf).count()
    }

    /// Reads `field` of the current VMCS.
    pub fn field(&self, field: u32) -> u64 {
        let current = self.current.expect("no current VMCS");
        self.fields.get(&current).and_then(|fields| fields.get(&field)).copied().unwrap_or(0)
    }

    /// Writes `field` of the current VMCS, read-only fields included.
    pub fn set_field(&mut self, field: u32, value: u64) {
        let current = self.current.expect("no current VMCS");
        self.fields.entry(current).or_default().insert(field, value);
    }

    pub fn current_vmcs(&self) -> Option<u64> {
        self.current
    }

    /// Queues the result of a future VMLAUNCH / VMRESUME.
    pub fn script(&mut self, outcome: LaunchOutcome) {
        self.outcomes.push_back(outcome);
    }

    fn enter(&mut self, resume: bool, registers: &mut GuestRegisters) -> Result<(), VmFail> {
        let Some(current) = self.current else {
            return Err(VmFail::VmFailInvalid);
        };

        let launched = self.launch_state.get(&current).copied().unwrap_or(false);
        if launched != resume {
            let error = if resume { 5 } else { 4 };
            self.set_field(vmcs::ro::VM_INSTRUCTION_ERROR, error);
            return Err(VmFail::VmFailValid);
        }

        let outcome = self.outcomes.pop_front().unwrap_or(LaunchOutcome::Exit(self.field(vmcs::ro::EXIT_REASON) as u32));
        match outcome {
            LaunchOutcome::Exit(reason) => {
                self.entries += 1;
                self.launch_state.insert(current, true);
                self.set_field(vmcs::ro::EXIT_REASON, u64::from(reason));
                if let Some(exit_registers) = self.exit_registers.take() {
                    *registers = exit_registers;
                }
                Ok(())
            }
            LaunchOutcome::EntryFailure(reason) => {
                self.set_field(vmcs::ro::EXIT_REASON, u64::from(reason) | (1 << 31));
                Ok(())
            }
            LaunchOutcome::FailValid(error) => {
                self.set_field(vmcs::ro::VM_INSTRUCTION_ERROR, u64::from(error));
                Err(VmFail::VmFailValid)
            }
            LaunchOutcome::FailInvalid => Err(VmFail::VmFailInvalid),
        }
    }
}

impl VmxRead for MockHardware {
    fn vmread(&self, field: u32) -> u64 {
        match self.current {
            Some(_) => self.field(field),
            None => 0,
        }
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        self.msr(msr)
    }

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuIdResult {
        self.cpuid_log.borrow_mut().push((leaf, sub_leaf));
        let [eax, ebx, ecx, edx] = self.cpuid.get(&(leaf, sub_leaf)).or_else(|| self.cpuid.get(&(leaf, 0))).copied().unwrap_or_default();
        CpuIdResult { eax, ebx, ecx, edx }
    }
}

impl VmxHardware for MockHardware {
    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), VmFail> {
        if self.current.is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        self.set_field(field, value);
        Ok(())
    }

    fn vmclear(&mut self, vmcs_pa: u64) -> Result<(), VmFail> {
        if vmcs_pa == 0 || vmcs_pa & 0xFFF != 0 {
            return Err(VmFail::VmFailValid);
        }
        self.vmclear_count += 1;
        self.launch_state.insert(vmcs_pa, false);
        if self.current == Some(vmcs_pa) {
            self.current = None;
        }
        Ok(())
    }

    fn vmptrld(&mut self, vmcs_pa: u64) -> Result<(), VmFail> {
        if vmcs_pa == 0 || vmcs_pa & 0xFFF != 0 {
            return Err(VmFail::VmFailValid);
        }
        self.current = Some(vmcs_pa);
        Ok(())
    }

    fn vmlaunch(&mut self, registers: &mut GuestRegisters) -> Result<(), VmFail> {
        self.enter(false, registers)
    }

    fn vmresume(&mut self, registers: &mut GuestRegisters) -> Result<(), VmFail> {
        self.enter(true, registers)
    }

    fn wbinvd(&mut self) {
        self.cache_flushes += 1;
    }

    fn promote(&mut self, state: &PromoteState, _registers: &GuestRegisters) -> Result<(), HypervisorError> {
        if self.fail_promote {
            return Err(HypervisorError::VmxOffFailed);
        }
        self.promoted = Some(*state);
        Ok(())
    }

    fn halt(&mut self) -> ! {
        panic!("processor halted");
    }
}
