//! VM-entry event injection.

use {
    crate::intel::{hardware::VmxHardware, vmcs::Vmcs},
    bitfield::bitfield,
};

bitfield! {
    /// VM-entry interruption-information field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct EventInjection(u32);

    impl Debug;

    pub vector, set_vector: 7, 0;
    pub interruption_type, set_interruption_type: 10, 8;
    pub deliver_error_code, set_deliver_error_code: 11;
    pub reserved, _: 30, 12;
    pub valid, set_valid: 31;
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.8.3 VM-Entry Controls for Event Injection
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

impl InterruptionType {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::ExternalInterrupt),
            2 => Some(Self::NonMaskableInterrupt),
            3 => Some(Self::HardwareException),
            4 => Some(Self::SoftwareInterrupt),
            5 => Some(Self::PrivilegedSoftwareException),
            6 => Some(Self::SoftwareException),
            7 => Some(Self::OtherEvent),
            _ => None,
        }
    }

    /// Software interrupts and exceptions need the VM-entry instruction length.
    pub fn uses_instruction_length(self) -> bool {
        matches!(self, Self::SoftwareInterrupt | Self::PrivilegedSoftwareException | Self::SoftwareException)
    }
}

/// Exception vectors.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 6-1. Protected-Mode Exceptions and Interrupts
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionInterrupt {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtectionFault = 13,
    PageFault = 14,
    FloatingPointError = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPointException = 19,
    VirtualizationException = 20,
    ControlProtection = 21,
}

impl ExceptionInterrupt {
    /// Whether delivering `vector` as a hardware exception pushes an error code.
    pub fn has_error_code(vector: u32) -> bool {
        matches!(vector, 8 | 10..=14 | 17 | 21)
    }
}

impl EventInjection {
    pub fn hardware_exception(exception: ExceptionInterrupt) -> Self {
        let mut event = EventInjection(0);
        event.set_vector(exception as u32);
        event.set_interruption_type(InterruptionType::HardwareException as u32);
        event.set_deliver_error_code(ExceptionInterrupt::has_error_code(exception as u32));
        event.set_valid(true);
        event
    }

    /// #UD.
    pub fn undefined_opcode() -> Self {
        Self::hardware_exception(ExceptionInterrupt::InvalidOpcode)
    }

    /// #GP. Delivered with an error code.
    pub fn general_protection() -> Self {
        Self::hardware_exception(ExceptionInterrupt::GeneralProtectionFault)
    }

    /// Writes the event (and its error code, when it delivers one) into the current VMCS.
    ///
    /// The instruction pointer is left alone: a faulting instruction is not retired.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.6 Event Injection
    pub fn inject<H: VmxHardware>(self, vmcs: &mut Vmcs<H>, error_code: u32) {
        log::trace!("Injecting event {:#x} (error code {:#x})", self.0, error_code);

        if self.deliver_error_code() {
            vmcs.set_entry_exception_error_code(error_code);
        }
        vmcs.set_entry_interruption_info(self.0);
    }
}
