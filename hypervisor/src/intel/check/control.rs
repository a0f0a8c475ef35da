//! Checks on the VM-execution, VM-exit and VM-entry control fields.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.2.1 Checks on VMX Controls

use {
    super::{battery, ensure, Checker, Context, Outcome},
    crate::intel::{
        capabilities::{allowed0, allowed1},
        controls::{entry, exit, pin, primary, secondary, VmxControl},
        events::{EventInjection, ExceptionInterrupt, InterruptionType},
    },
    bit_field::BitField,
    x86::vmx::vmcs,
    x86_64::registers::control::Cr0Flags,
};

pub const BATTERY: &[Checker] = battery![
    pin_based_controls,
    primary_controls,
    secondary_controls,
    cr3_target_count,
    io_bitmap_addresses,
    msr_bitmap_address,
    tpr_shadow,
    nmi_controls,
    apic_access_address,
    x2apic_mode,
    virtual_interrupt_delivery,
    posted_interrupts,
    vpid,
    eptp,
    pml,
    unrestricted_guest,
    vm_functions,
    vmcs_shadowing,
    ept_violation_ve,
    exit_controls,
    preemption_timer_save,
    exit_msr_store_area,
    exit_msr_load_area,
    entry_controls,
    event_injection,
    entry_msr_load_area,
    entry_outside_smm,
];

/// Field values must respect the allowed 0- and 1-settings reported for the field.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.3 VM-Execution Controls
fn reserved_bits(context: &Context<'_>, control: VmxControl, value: u64) -> Outcome {
    let capability = context.capabilities().capability(control);

    let missing = allowed0(capability) & !value;
    ensure(missing == 0, "bits required by the capability MSR must be 1", missing)?;

    let disallowed = value & !allowed1(capability);
    ensure(disallowed == 0, "bits outside the allowed 1-settings must be 0", disallowed)
}

/// A physical-address field: 4 KiB aligned, no bit set beyond MAXPHYADDR.
fn page_address(context: &Context<'_>, address: u64, rule: &'static str) -> Outcome {
    ensure(context.is_page_address(address), rule, address)
}

fn pin_based_controls(context: &Context<'_>) -> Outcome {
    reserved_bits(context, VmxControl::PinBased, context.pin_based_controls())
}

fn primary_controls(context: &Context<'_>) -> Outcome {
    reserved_bits(context, VmxControl::ProcessorBased, context.primary_controls())
}

fn secondary_controls(context: &Context<'_>) -> Outcome {
    if context.primary_controls() & primary::ACTIVATE_SECONDARY_CONTROLS == 0 {
        return Ok(());
    }
    reserved_bits(context, VmxControl::ProcessorBased2, context.secondary_controls())
}

fn cr3_target_count(context: &Context<'_>) -> Outcome {
    let count = context.read(vmcs::control::CR3_TARGET_COUNT);
    let supported = context.capabilities().misc.get_bits(16..25);
    ensure(count <= supported, "CR3-target count exceeds the number of supported CR3 targets", count)
}

fn io_bitmap_addresses(context: &Context<'_>) -> Outcome {
    if context.primary_controls() & primary::USE_IO_BITMAPS == 0 {
        return Ok(());
    }
    page_address(context, context.read(vmcs::control::IO_BITMAP_A_ADDR_FULL), "I/O bitmap A must be a page-aligned physical address")?;
    page_address(context, context.read(vmcs::control::IO_BITMAP_B_ADDR_FULL), "I/O bitmap B must be a page-aligned physical address")
}

fn msr_bitmap_address(context: &Context<'_>) -> Outcome {
    if context.primary_controls() & primary::USE_MSR_BITMAPS == 0 {
        return Ok(());
    }
    page_address(context, context.read(vmcs::control::MSR_BITMAPS_ADDR_FULL), "MSR bitmap must be a page-aligned physical address")
}

fn tpr_shadow(context: &Context<'_>) -> Outcome {
    let secondary = context.secondary_controls();

    if context.primary_controls() & primary::USE_TPR_SHADOW == 0 {
        let needs_shadow = secondary & (secondary::VIRTUALIZE_X2APIC_MODE | secondary::APIC_REGISTER_VIRTUALIZATION | secondary::VIRTUAL_INTERRUPT_DELIVERY);
        return ensure(needs_shadow == 0, "x2APIC virtualization, APIC-register virtualization and virtual-interrupt delivery require the TPR shadow", needs_shadow);
    }

    page_address(context, context.read(vmcs::control::VIRT_APIC_ADDR_FULL), "virtual-APIC address must be a page-aligned physical address")?;

    if secondary & secondary::VIRTUAL_INTERRUPT_DELIVERY == 0 {
        let threshold = context.read(vmcs::control::TPR_THRESHOLD);
        ensure(threshold.get_bits(4..32) == 0, "TPR threshold bits 31:4 must be 0", threshold)?;
    }

    Ok(())
}

fn nmi_controls(context: &Context<'_>) -> Outcome {
    let pin = context.pin_based_controls();

    if pin & pin::NMI_EXITING == 0 {
        ensure(pin & pin::VIRTUAL_NMIS == 0, "virtual NMIs require NMI exiting", pin)?;
    }
    if pin & pin::VIRTUAL_NMIS == 0 {
        let primary = context.primary_controls();
        ensure(primary & primary::NMI_WINDOW_EXITING == 0, "NMI-window exiting requires virtual NMIs", primary)?;
    }

    Ok(())
}

fn apic_access_address(context: &Context<'_>) -> Outcome {
    if context.secondary_controls() & secondary::VIRTUALIZE_APIC_ACCESSES == 0 {
        return Ok(());
    }
    page_address(context, context.read(vmcs::control::APIC_ACCESS_ADDR_FULL), "APIC-access address must be a page-aligned physical address")
}

fn x2apic_mode(context: &Context<'_>) -> Outcome {
    let secondary = context.secondary_controls();
    let both = secondary::VIRTUALIZE_X2APIC_MODE | secondary::VIRTUALIZE_APIC_ACCESSES;
    ensure(secondary & both != both, "x2APIC-mode virtualization excludes APIC-access virtualization", secondary)
}

fn virtual_interrupt_delivery(context: &Context<'_>) -> Outcome {
    if context.secondary_controls() & secondary::VIRTUAL_INTERRUPT_DELIVERY == 0 {
        return Ok(());
    }
    let pin = context.pin_based_controls();
    ensure(pin & pin::EXTERNAL_INTERRUPT_EXITING != 0, "virtual-interrupt delivery requires external-interrupt exiting", pin)
}

fn posted_interrupts(context: &Context<'_>) -> Outcome {
    if context.pin_based_controls() & pin::PROCESS_POSTED_INTERRUPTS == 0 {
        return Ok(());
    }

    let secondary = context.secondary_controls();
    ensure(secondary & secondary::VIRTUAL_INTERRUPT_DELIVERY != 0, "posted interrupts require virtual-interrupt delivery", secondary)?;

    let exit = context.exit_controls();
    ensure(exit & exit::ACKNOWLEDGE_INTERRUPT_ON_EXIT != 0, "posted interrupts require acknowledge interrupt on exit", exit)?;

    let vector = context.read(vmcs::control::POSTED_INTERRUPT_NOTIFICATION_VECTOR);
    ensure(vector.get_bits(8..16) == 0, "posted-interrupt notification vector must fit in 8 bits", vector)?;

    let descriptor = context.read(vmcs::control::POSTED_INTERRUPT_DESC_ADDR_FULL);
    ensure(descriptor.get_bits(0..6) == 0 && context.is_physical_address(descriptor), "posted-interrupt descriptor must be a 64-byte aligned physical address", descriptor)
}

fn vpid(context: &Context<'_>) -> Outcome {
    if context.secondary_controls() & secondary::ENABLE_VPID == 0 {
        return Ok(());
    }
    let vpid = context.read(vmcs::control::VPID);
    ensure(vpid != 0, "VPID must not be 0 when VPIDs are enabled", vpid)
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.11 Extended-Page-Table Pointer (EPTP)
fn eptp(context: &Context<'_>) -> Outcome {
    if context.secondary_controls() & secondary::ENABLE_EPT == 0 {
        return Ok(());
    }

    let eptp = context.read(vmcs::control::EPTP_FULL);
    let capability = context.capabilities().ept_vpid_cap;

    let memory_type_supported = match eptp.get_bits(0..3) {
        0 => capability.get_bit(8),
        6 => capability.get_bit(14),
        _ => false,
    };
    ensure(memory_type_supported, "EPT memory type must be a supported UC or WB", eptp)?;
    ensure(eptp.get_bits(3..6) == 3, "EPT page-walk length must be 4", eptp)?;
    if eptp.get_bit(6) {
        ensure(capability.get_bit(21), "EPT accessed and dirty flags are not supported", eptp)?;
    }
    ensure(eptp.get_bits(7..12) == 0, "EPTP bits 11:7 must be 0", eptp)?;
    ensure(context.is_physical_address(eptp), "EPT PML4 address exceeds the physical-address width", eptp)
}

fn pml(context: &Context<'_>) -> Outcome {
    let secondary = context.secondary_controls();
    if secondary & secondary::ENABLE_PML == 0 {
        return Ok(());
    }
    ensure(secondary & secondary::ENABLE_EPT != 0, "page-modification logging requires EPT", secondary)?;
    page_address(context, context.read(vmcs::control::PML_ADDR_FULL), "PML address must be a page-aligned physical address")
}

fn unrestricted_guest(context: &Context<'_>) -> Outcome {
    let secondary = context.secondary_controls();
    if secondary & secondary::UNRESTRICTED_GUEST == 0 {
        return Ok(());
    }
    ensure(secondary & secondary::ENABLE_EPT != 0, "unrestricted guest requires EPT", secondary)
}

fn vm_functions(context: &Context<'_>) -> Outcome {
    let secondary = context.secondary_controls();
    if secondary & secondary::ENABLE_VM_FUNCTIONS == 0 {
        return Ok(());
    }

    let functions = context.read(vmcs::control::VM_FUNCTION_CONTROLS_FULL);
    let unsupported = functions & !context.capabilities().vm_functions;
    ensure(unsupported == 0, "VM-function controls must be supported by IA32_VMX_VMFUNC", unsupported)?;

    // EPTP switching.
    if functions.get_bit(0) {
        ensure(secondary & secondary::ENABLE_EPT != 0, "EPTP switching requires EPT", secondary)?;
        page_address(context, context.read(vmcs::control::EPTP_LIST_ADDR_FULL), "EPTP-list address must be a page-aligned physical address")?;
    }

    Ok(())
}

fn vmcs_shadowing(context: &Context<'_>) -> Outcome {
    if context.secondary_controls() & secondary::VMCS_SHADOWING == 0 {
        return Ok(());
    }
    page_address(context, context.read(vmcs::control::VMREAD_BITMAP_ADDR_FULL), "VMREAD bitmap must be a page-aligned physical address")?;
    page_address(context, context.read(vmcs::control::VMWRITE_BITMAP_ADDR_FULL), "VMWRITE bitmap must be a page-aligned physical address")
}

fn ept_violation_ve(context: &Context<'_>) -> Outcome {
    if context.secondary_controls() & secondary::EPT_VIOLATION_VE == 0 {
        return Ok(());
    }
    page_address(context, context.read(vmcs::control::VIRT_EXCEPTION_INFO_ADDR_FULL), "virtualization-exception information address must be a page-aligned physical address")
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.2.1.2 VM-Exit Control Fields
fn exit_controls(context: &Context<'_>) -> Outcome {
    reserved_bits(context, VmxControl::VmExit, context.exit_controls())
}

fn preemption_timer_save(context: &Context<'_>) -> Outcome {
    if context.pin_based_controls() & pin::ACTIVATE_VMX_PREEMPTION_TIMER != 0 {
        return Ok(());
    }
    let exit = context.exit_controls();
    ensure(exit & exit::SAVE_VMX_PREEMPTION_TIMER == 0, "saving the preemption timer requires activating it", exit)
}

/// An MSR area of `count` 16-byte entries: 16-byte aligned and entirely below MAXPHYADDR.
fn msr_area(context: &Context<'_>, address_field: u32, count_field: u32, rule: &'static str) -> Outcome {
    let count = context.read(count_field);
    if count == 0 {
        return Ok(());
    }

    let address = context.read(address_field);
    let last = address.checked_add(count * 16 - 1);
    ensure(address.get_bits(0..4) == 0 && last.is_some_and(|last| context.is_physical_address(last)), rule, address)
}

fn exit_msr_store_area(context: &Context<'_>) -> Outcome {
    msr_area(context, vmcs::control::VMEXIT_MSR_STORE_ADDR_FULL, vmcs::control::VMEXIT_MSR_STORE_COUNT, "VM-exit MSR-store area must be 16-byte aligned physical memory")
}

fn exit_msr_load_area(context: &Context<'_>) -> Outcome {
    msr_area(context, vmcs::control::VMEXIT_MSR_LOAD_ADDR_FULL, vmcs::control::VMEXIT_MSR_LOAD_COUNT, "VM-exit MSR-load area must be 16-byte aligned physical memory")
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.2.1.3 VM-Entry Control Fields
fn entry_controls(context: &Context<'_>) -> Outcome {
    reserved_bits(context, VmxControl::VmEntry, context.entry_controls())
}

fn event_injection(context: &Context<'_>) -> Outcome {
    let event = EventInjection(context.read(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD) as u32);
    if !event.valid() {
        return Ok(());
    }

    let raw = u64::from(event.0);
    let Some(interruption_type) = InterruptionType::from_raw(event.interruption_type()) else {
        return ensure(false, "interruption type 1 is reserved", raw);
    };

    let vector = event.vector();
    match interruption_type {
        InterruptionType::NonMaskableInterrupt => ensure(vector == 2, "an NMI must use vector 2", raw)?,
        InterruptionType::HardwareException => ensure(vector <= 31, "a hardware exception must use a vector below 32", raw)?,
        InterruptionType::OtherEvent => ensure(vector == 0, "other events must use vector 0", raw)?,
        _ => {}
    }

    let protected_mode = context.read(vmcs::guest::CR0) & Cr0Flags::PROTECTED_MODE_ENABLE.bits() != 0;
    let needs_error_code = (protected_mode || !context.unrestricted_guest())
        && interruption_type == InterruptionType::HardwareException
        && ExceptionInterrupt::has_error_code(vector);
    ensure(event.deliver_error_code() == needs_error_code, "deliver-error-code must be set exactly for exceptions that push an error code", raw)?;

    ensure(event.reserved() == 0, "interruption-information bits 30:12 must be 0", raw)?;

    if event.deliver_error_code() {
        let error_code = context.read(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE);
        ensure(error_code.get_bits(16..32) == 0, "exception error-code bits 31:16 must be 0", error_code)?;
    }

    if interruption_type.uses_instruction_length() {
        let length = context.read(vmcs::control::VMENTRY_INSTRUCTION_LEN);
        // IA32_VMX_MISC bit 30: zero-length software events are allowed.
        let zero_allowed = length == 0 && context.capabilities().misc.get_bit(30);
        ensure((1..=15).contains(&length) || zero_allowed, "VM-entry instruction length must be between 1 and 15", length)?;
    }

    Ok(())
}

fn entry_msr_load_area(context: &Context<'_>) -> Outcome {
    msr_area(context, vmcs::control::VMENTRY_MSR_LOAD_ADDR_FULL, vmcs::control::VMENTRY_MSR_LOAD_COUNT, "VM-entry MSR-load area must be 16-byte aligned physical memory")
}

/// The core never runs in SMM, so neither SMM entry control may be set.
fn entry_outside_smm(context: &Context<'_>) -> Outcome {
    let entry = context.entry_controls();
    let smm = entry & (entry::ENTRY_TO_SMM | entry::DEACTIVATE_DUAL_MONITOR_TREATMENT);
    ensure(smm == 0, "entry to SMM and deactivating dual-monitor treatment are only valid in SMM", smm)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{check::run, mock::MockHardware},
        x86::msr,
    };

    fn failing_check(hardware: &MockHardware) -> Option<&'static str> {
        run(BATTERY, &Context::new(hardware)).err().map(|violation| violation.check)
    }

    #[test]
    fn zeroed_controls_pass() {
        assert_eq!(failing_check(&MockHardware::loaded()), None);
    }

    #[test]
    fn required_control_bit_missing() {
        let mut hardware = MockHardware::loaded();
        hardware.set_msr(msr::IA32_VMX_TRUE_EXIT_CTLS, 0xFFFF_FFFF_0000_0004);

        let violation = run(BATTERY, &Context::new(&hardware)).unwrap_err();

        assert_eq!(violation.check, "exit_controls");
        assert_eq!(violation.value, 0x4);
    }

    #[test]
    fn secondary_controls_are_ignored_until_activated() {
        let mut hardware = MockHardware::loaded();
        hardware.set_msr(msr::IA32_VMX_PROCBASED_CTLS2, 0);
        hardware.set_field(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, secondary::ENABLE_EPT);
        assert_eq!(failing_check(&hardware), None);

        hardware.set_field(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, primary::ACTIVATE_SECONDARY_CONTROLS);
        assert_eq!(failing_check(&hardware), Some("secondary_controls"));
    }

    #[test]
    fn msr_bitmap_must_be_page_aligned() {
        let mut hardware = MockHardware::loaded();
        hardware.set_field(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, primary::USE_MSR_BITMAPS);
        hardware.set_field(vmcs::control::MSR_BITMAPS_ADDR_FULL, 0x1_0010);
        assert_eq!(failing_check(&hardware), Some("msr_bitmap_address"));

        hardware.set_field(vmcs::control::MSR_BITMAPS_ADDR_FULL, 0x1_0000);
        assert_eq!(failing_check(&hardware), None);

        // Beyond the 48-bit physical-address width of the mock.
        hardware.set_field(vmcs::control::MSR_BITMAPS_ADDR_FULL, 1 << 50);
        assert_eq!(failing_check(&hardware), Some("msr_bitmap_address"));
    }

    #[test]
    fn dependent_control_needs_its_prerequisite() {
        let mut hardware = MockHardware::loaded();
        hardware.set_field(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, primary::ACTIVATE_SECONDARY_CONTROLS);
        hardware.set_field(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, secondary::UNRESTRICTED_GUEST);
        assert_eq!(failing_check(&hardware), Some("unrestricted_guest"));

        hardware.set_field(vmcs::control::PINBASED_EXEC_CONTROLS, pin::VIRTUAL_NMIS);
        assert_eq!(failing_check(&hardware), Some("nmi_controls"));
    }

    #[test]
    fn eptp_must_describe_a_four_level_write_back_walk() {
        let mut hardware = MockHardware::loaded();
        hardware.set_field(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, primary::ACTIVATE_SECONDARY_CONTROLS);
        hardware.set_field(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, secondary::ENABLE_EPT);

        hardware.set_field(vmcs::control::EPTP_FULL, 0x20_0000 | (3 << 3) | 6);
        assert_eq!(failing_check(&hardware), None);

        hardware.set_field(vmcs::control::EPTP_FULL, 0x20_0000 | (2 << 3) | 6);
        let violation = run(BATTERY, &Context::new(&hardware)).unwrap_err();
        assert_eq!(violation.check, "eptp");
        assert_eq!(violation.rule, "EPT page-walk length must be 4");
    }

    #[test]
    fn cr3_target_count_is_bounded_by_misc() {
        let mut hardware = MockHardware::loaded();
        hardware.set_field(vmcs::control::CR3_TARGET_COUNT, 5);
        assert_eq!(failing_check(&hardware), Some("cr3_target_count"));
    }

    #[test]
    fn injected_exception_error_code_must_match_the_vector() {
        let mut hardware = MockHardware::loaded();
        hardware.set_field(vmcs::guest::CR0, 0x8000_0031);

        // #GP without deliver-error-code.
        hardware.set_field(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, 0x8000_030D);
        assert_eq!(failing_check(&hardware), Some("event_injection"));

        hardware.set_field(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, EventInjection::general_protection().0 as u64);
        assert_eq!(failing_check(&hardware), None);

        // #UD with deliver-error-code.
        hardware.set_field(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, 0x8000_0B06);
        assert_eq!(failing_check(&hardware), Some("event_injection"));
    }

    #[test]
    fn injected_software_interrupt_needs_an_instruction_length() {
        let mut hardware = MockHardware::loaded();
        // INT 0x80.
        hardware.set_field(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, 0x8000_0480);
        hardware.set_field(vmcs::control::VMENTRY_INSTRUCTION_LEN, 16);
        assert_eq!(failing_check(&hardware), Some("event_injection"));

        hardware.set_field(vmcs::control::VMENTRY_INSTRUCTION_LEN, 2);
        assert_eq!(failing_check(&hardware), None);
    }

    #[test]
    fn msr_load_area_must_be_aligned() {
        let mut hardware = MockHardware::loaded();
        hardware.set_field(vmcs::control::VMENTRY_MSR_LOAD_COUNT, 2);
        hardware.set_field(vmcs::control::VMENTRY_MSR_LOAD_ADDR_FULL, 0x3008);
        assert_eq!(failing_check(&hardware), Some("entry_msr_load_area"));
    }
}
