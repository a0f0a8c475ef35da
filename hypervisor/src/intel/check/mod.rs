//! VM-entry compliance checks.
//!
//! The processor validates the control fields, the host-state area and the guest-state area
//! before it accepts a VMLAUNCH or VMRESUME, and reports a failure with a single error
//! number. The checkers here repeat that validation in software against the current VMCS,
//! so a rejected entry can be reported as the rule that was broken.
//!
//! Each checker is a plain function over a [`Context`]. Checkers are grouped into three
//! batteries that [`all`] runs in order: [`control::BATTERY`], [`guest::BATTERY`] and
//! [`host::BATTERY`]. The first failing checker stops the run.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.2 Checks on VMX Controls and Host-State Area
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.3 Checking and Loading Guest State

use {
    crate::intel::{
        capabilities::VmxCapabilities,
        controls::{entry, primary, secondary},
        hardware::VmxRead,
    },
    bit_field::BitField,
    log::*,
    x86::vmx::vmcs,
    x86_64::{registers::model_specific::EferFlags, VirtAddr},
};

pub mod control;
pub mod guest;
pub mod host;

/// A broken VM-entry rule: the checker that found it, what the rule says and the value
/// that violates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub check: &'static str,
    pub rule: &'static str,
    pub value: u64,
}

impl core::fmt::Display for Violation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {} (value {:#x})", self.check, self.rule, self.value)
    }
}

/// A failed rule inside a checker. The battery runner adds the checker's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failure {
    pub rule: &'static str,
    pub value: u64,
}

pub type Outcome = Result<(), Failure>;

/// Fails with `rule` and `value` unless `condition` holds.
pub fn ensure(condition: bool, rule: &'static str, value: u64) -> Outcome {
    if condition {
        Ok(())
    } else {
        Err(Failure { rule, value })
    }
}

/// A named checker.
#[derive(Clone, Copy)]
pub struct Checker {
    pub name: &'static str,
    pub check: fn(&Context<'_>) -> Outcome,
}

impl core::fmt::Debug for Checker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name)
    }
}

/// Builds a battery from checker functions; each checker is named after its function.
macro_rules! battery {
    ($($check:ident),* $(,)?) => {
        &[$($crate::intel::check::Checker { name: stringify!($check), check: $check },)*]
    };
}
pub(crate) use battery;

/// What a checker may look at: the current VMCS, the capability MSRs and CPUID.
pub struct Context<'a> {
    hardware: &'a dyn VmxRead,
    capabilities: VmxCapabilities,
}

impl<'a> Context<'a> {
    pub fn new(hardware: &'a dyn VmxRead) -> Self {
        Self {
            hardware,
            capabilities: VmxCapabilities::read(hardware),
        }
    }

    /// Reads a field of the current VMCS.
    pub fn read(&self, field: u32) -> u64 {
        self.hardware.vmread(field)
    }

    pub fn capabilities(&self) -> &VmxCapabilities {
        &self.capabilities
    }

    pub fn pin_based_controls(&self) -> u64 {
        self.read(vmcs::control::PINBASED_EXEC_CONTROLS)
    }

    pub fn primary_controls(&self) -> u64 {
        self.read(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS)
    }

    /// Secondary controls in effect. Zero unless the primary controls activate them.
    pub fn secondary_controls(&self) -> u64 {
        if self.primary_controls() & primary::ACTIVATE_SECONDARY_CONTROLS == 0 {
            return 0;
        }
        self.read(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS)
    }

    pub fn exit_controls(&self) -> u64 {
        self.read(vmcs::control::VMEXIT_CONTROLS)
    }

    pub fn entry_controls(&self) -> u64 {
        self.read(vmcs::control::VMENTRY_CONTROLS)
    }

    pub fn ia32e_mode_guest(&self) -> bool {
        self.entry_controls() & entry::IA32E_MODE_GUEST != 0
    }

    pub fn unrestricted_guest(&self) -> bool {
        self.secondary_controls() & secondary::UNRESTRICTED_GUEST != 0
    }

    /// True when no bit above MAXPHYADDR is set.
    pub fn is_physical_address(&self, address: u64) -> bool {
        address & !self.capabilities.physical_address_mask() == 0
    }

    /// True for a 4 KiB-aligned address below MAXPHYADDR.
    pub fn is_page_address(&self, address: u64) -> bool {
        address & 0xFFF == 0 && self.is_physical_address(address)
    }
}

/// True when bits 63:47 of `address` are all equal.
pub fn is_canonical(address: u64) -> bool {
    VirtAddr::try_new(address).is_ok()
}

/// True when every entry of a PAT value is a valid memory type (0, 1, 4, 5, 6 or 7).
pub fn is_valid_pat(pat: u64) -> bool {
    (0..8).all(|entry| matches!(pat.get_bits(entry * 8..entry * 8 + 8), 0 | 1 | 4..=7))
}

/// IA32_EFER bits other than SCE, LME, LMA and NXE.
pub const EFER_RESERVED: u64 = !(EferFlags::SYSTEM_CALL_EXTENSIONS.bits() | EferFlags::LONG_MODE_ENABLE.bits() | EferFlags::LONG_MODE_ACTIVE.bits() | EferFlags::NO_EXECUTE_ENABLE.bits());

/// Runs `battery` in order and stops at the first failing checker.
pub fn run(battery: &[Checker], context: &Context<'_>) -> Result<(), Violation> {
    for checker in battery {
        if let Err(failure) = (checker.check)(context) {
            trace!("{} failed: {}", checker.name, failure.rule);
            return Err(Violation {
                check: checker.name,
                rule: failure.rule,
                value: failure.value,
            });
        }
    }

    Ok(())
}

/// Runs every battery against the current VMCS: control fields, then guest state, then host
/// state.
pub fn all(hardware: &dyn VmxRead) -> Result<(), Violation> {
    let context = Context::new(hardware);

    run(control::BATTERY, &context)?;
    run(guest::BATTERY, &context)?;
    run(host::BATTERY, &context)
}
