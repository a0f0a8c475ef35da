//! Checks on the guest-state area.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.3.1 Checks on the Guest State Area

use {
    super::{battery, ensure, is_canonical, is_valid_pat, Checker, Context, Outcome, EFER_RESERVED},
    crate::intel::{
        controls::{entry, pin, secondary},
        events::{EventInjection, InterruptionType},
        segment::{system_type, AccessRights},
    },
    bit_field::BitField,
    x86::vmx::vmcs,
    x86_64::registers::{
        control::{Cr0Flags, Cr4Flags},
        model_specific::EferFlags,
        rflags::RFlags,
    },
};

pub const BATTERY: &[Checker] = battery![
    guest_cr0,
    guest_cr4,
    guest_debugctl,
    ia32e_mode,
    guest_cr3,
    guest_dr7,
    guest_sysenter,
    guest_pat,
    guest_efer,
    guest_bndcfgs,
    segment_selectors,
    segment_bases,
    virtual_8086_segments,
    cs_access_rights,
    ss_access_rights,
    ds_access_rights,
    es_access_rights,
    fs_access_rights,
    gs_access_rights,
    tr_access_rights,
    ldtr_access_rights,
    descriptor_tables,
    guest_rip,
    guest_rflags,
    activity_state,
    interruptibility_state,
    pending_debug_exceptions,
    vmcs_link_pointer,
    pdptes,
];

const CR0_PE: u64 = Cr0Flags::PROTECTED_MODE_ENABLE.bits();
const CR0_PG: u64 = Cr0Flags::PAGING.bits();
const CR4_PAE: u64 = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
const CR4_PCIDE: u64 = Cr4Flags::PCID.bits();
const EFER_LME: u64 = EferFlags::LONG_MODE_ENABLE.bits();
const EFER_LMA: u64 = EferFlags::LONG_MODE_ACTIVE.bits();
const RFLAGS_VM: u64 = RFlags::VIRTUAL_8086_MODE.bits();
const RFLAGS_IF: u64 = RFlags::INTERRUPT_FLAG.bits();

/// IA32_DEBUGCTL bits 5:2 and 63:16.
const DEBUGCTL_RESERVED: u64 = 0xFFFF_FFFF_FFFF_003C;
/// RFLAGS bits 63:22, 15, 5 and 3.
const RFLAGS_RESERVED: u64 = 0xFFFF_FFFF_FFC0_8028;
/// Pending debug exceptions bits 11:4, 13, 15 and 63:17.
const PENDING_DEBUG_RESERVED: u64 = 0xFFFF_FFFF_FFFE_AFF0;

mod activity {
    pub const ACTIVE: u64 = 0;
    pub const HLT: u64 = 1;
    pub const WAIT_FOR_SIPI: u64 = 3;
}

mod interruptibility {
    pub const BLOCKING_BY_STI: u64 = 1 << 0;
    pub const BLOCKING_BY_MOV_SS: u64 = 1 << 1;
    pub const BLOCKING_BY_SMI: u64 = 1 << 2;
    pub const BLOCKING_BY_NMI: u64 = 1 << 3;
}

/// The four VMCS fields describing one guest segment register.
struct SegmentFields {
    selector: u32,
    base: u32,
    limit: u32,
    access_rights: u32,
}

const CS: SegmentFields = SegmentFields {
    selector: vmcs::guest::CS_SELECTOR,
    base: vmcs::guest::CS_BASE,
    limit: vmcs::guest::CS_LIMIT,
    access_rights: vmcs::guest::CS_ACCESS_RIGHTS,
};
const SS: SegmentFields = SegmentFields {
    selector: vmcs::guest::SS_SELECTOR,
    base: vmcs::guest::SS_BASE,
    limit: vmcs::guest::SS_LIMIT,
    access_rights: vmcs::guest::SS_ACCESS_RIGHTS,
};
const DS: SegmentFields = SegmentFields {
    selector: vmcs::guest::DS_SELECTOR,
    base: vmcs::guest::DS_BASE,
    limit: vmcs::guest::DS_LIMIT,
    access_rights: vmcs::guest::DS_ACCESS_RIGHTS,
};
const ES: SegmentFields = SegmentFields {
    selector: vmcs::guest::ES_SELECTOR,
    base: vmcs::guest::ES_BASE,
    limit: vmcs::guest::ES_LIMIT,
    access_rights: vmcs::guest::ES_ACCESS_RIGHTS,
};
const FS: SegmentFields = SegmentFields {
    selector: vmcs::guest::FS_SELECTOR,
    base: vmcs::guest::FS_BASE,
    limit: vmcs::guest::FS_LIMIT,
    access_rights: vmcs::guest::FS_ACCESS_RIGHTS,
};
const GS: SegmentFields = SegmentFields {
    selector: vmcs::guest::GS_SELECTOR,
    base: vmcs::guest::GS_BASE,
    limit: vmcs::guest::GS_LIMIT,
    access_rights: vmcs::guest::GS_ACCESS_RIGHTS,
};
const TR: SegmentFields = SegmentFields {
    selector: vmcs::guest::TR_SELECTOR,
    base: vmcs::guest::TR_BASE,
    limit: vmcs::guest::TR_LIMIT,
    access_rights: vmcs::guest::TR_ACCESS_RIGHTS,
};
const LDTR: SegmentFields = SegmentFields {
    selector: vmcs::guest::LDTR_SELECTOR,
    base: vmcs::guest::LDTR_BASE,
    limit: vmcs::guest::LDTR_LIMIT,
    access_rights: vmcs::guest::LDTR_ACCESS_RIGHTS,
};

struct Segment {
    selector: u64,
    base: u64,
    limit: u64,
    access: AccessRights,
}

impl Segment {
    fn read(context: &Context<'_>, fields: &SegmentFields) -> Self {
        Self {
            selector: context.read(fields.selector),
            base: context.read(fields.base),
            limit: context.read(fields.limit),
            access: AccessRights(context.read(fields.access_rights) as u32),
        }
    }

    fn usable(&self) -> bool {
        !self.access.unusable()
    }

    fn rpl(&self) -> u64 {
        self.selector.get_bits(0..2)
    }

    /// Table indicator: the selector refers to the LDT.
    fn ti(&self) -> bool {
        self.selector.get_bit(2)
    }

    fn access_rights(&self) -> u64 {
        u64::from(self.access.0)
    }

    /// G must be 0 if any of limit bits 11:0 is 0, and 1 if any of limit bits 31:20 is 1.
    fn granularity_matches_limit(&self) -> bool {
        let byte_granular_limit = self.limit.get_bits(0..12) != 0xFFF;
        let page_granular_limit = self.limit.get_bits(20..32) != 0;
        !(byte_granular_limit && self.access.granularity()) && !(page_granular_limit && !self.access.granularity())
    }
}

fn cr0(context: &Context<'_>) -> u64 {
    context.read(vmcs::guest::CR0)
}

fn cr4(context: &Context<'_>) -> u64 {
    context.read(vmcs::guest::CR4)
}

fn rflags(context: &Context<'_>) -> u64 {
    context.read(vmcs::guest::RFLAGS)
}

fn virtual_8086(context: &Context<'_>) -> bool {
    rflags(context) & RFLAGS_VM != 0
}

fn pending_event(context: &Context<'_>) -> Option<(InterruptionType, u32)> {
    let event = EventInjection(context.read(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD) as u32);
    if !event.valid() {
        return None;
    }
    InterruptionType::from_raw(event.interruption_type()).map(|interruption_type| (interruption_type, event.vector()))
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.3.1.1 Checks on Guest Control Registers, Debug Registers, and MSRs
fn guest_cr0(context: &Context<'_>) -> Outcome {
    let cr0 = cr0(context);
    let capabilities = context.capabilities();

    let mut fixed0 = capabilities.cr0_fixed0;
    if context.unrestricted_guest() {
        fixed0 &= !(CR0_PE | CR0_PG);
    }

    ensure(cr0 & fixed0 == fixed0, "CR0 bits fixed to 1 must be set", cr0)?;
    ensure(cr0 & !capabilities.cr0_fixed1 == 0, "CR0 bits fixed to 0 must be clear", cr0)?;
    ensure(cr0 & CR0_PG == 0 || cr0 & CR0_PE != 0, "CR0.PG requires CR0.PE", cr0)
}

fn guest_cr4(context: &Context<'_>) -> Outcome {
    let cr4 = cr4(context);
    let capabilities = context.capabilities();

    ensure(cr4 & capabilities.cr4_fixed0 == capabilities.cr4_fixed0, "CR4 bits fixed to 1 must be set", cr4)?;
    ensure(cr4 & !capabilities.cr4_fixed1 == 0, "CR4 bits fixed to 0 must be clear", cr4)
}

fn guest_debugctl(context: &Context<'_>) -> Outcome {
    if context.entry_controls() & entry::LOAD_DEBUG_CONTROLS == 0 {
        return Ok(());
    }
    let debugctl = context.read(vmcs::guest::IA32_DEBUGCTL_FULL);
    ensure(debugctl & DEBUGCTL_RESERVED == 0, "IA32_DEBUGCTL reserved bits must be 0", debugctl)
}

fn ia32e_mode(context: &Context<'_>) -> Outcome {
    if context.ia32e_mode_guest() {
        ensure(cr0(context) & CR0_PG != 0, "IA-32e mode guest requires CR0.PG", cr0(context))?;
        ensure(cr4(context) & CR4_PAE != 0, "IA-32e mode guest requires CR4.PAE", cr4(context))
    } else {
        ensure(cr4(context) & CR4_PCIDE == 0, "CR4.PCIDE requires IA-32e mode guest", cr4(context))
    }
}

fn guest_cr3(context: &Context<'_>) -> Outcome {
    let cr3 = context.read(vmcs::guest::CR3);
    ensure(context.is_physical_address(cr3), "CR3 must not set bits beyond the physical-address width", cr3)
}

fn guest_dr7(context: &Context<'_>) -> Outcome {
    if context.entry_controls() & entry::LOAD_DEBUG_CONTROLS == 0 {
        return Ok(());
    }
    let dr7 = context.read(vmcs::guest::DR7);
    ensure(dr7.get_bits(32..64) == 0, "DR7 bits 63:32 must be 0", dr7)
}

fn guest_sysenter(context: &Context<'_>) -> Outcome {
    let esp = context.read(vmcs::guest::IA32_SYSENTER_ESP);
    ensure(is_canonical(esp), "IA32_SYSENTER_ESP must be canonical", esp)?;
    let eip = context.read(vmcs::guest::IA32_SYSENTER_EIP);
    ensure(is_canonical(eip), "IA32_SYSENTER_EIP must be canonical", eip)
}

fn guest_pat(context: &Context<'_>) -> Outcome {
    if context.entry_controls() & entry::LOAD_IA32_PAT == 0 {
        return Ok(());
    }
    let pat = context.read(vmcs::guest::IA32_PAT_FULL);
    ensure(is_valid_pat(pat), "every IA32_PAT entry must be a valid memory type", pat)
}

fn guest_efer(context: &Context<'_>) -> Outcome {
    if context.entry_controls() & entry::LOAD_IA32_EFER == 0 {
        return Ok(());
    }

    let efer = context.read(vmcs::guest::IA32_EFER_FULL);
    ensure(efer & EFER_RESERVED == 0, "IA32_EFER reserved bits must be 0", efer)?;
    ensure((efer & EFER_LMA != 0) == context.ia32e_mode_guest(), "IA32_EFER.LMA must match the IA-32e mode guest control", efer)?;
    if cr0(context) & CR0_PG != 0 {
        ensure((efer & EFER_LMA != 0) == (efer & EFER_LME != 0), "IA32_EFER.LMA must equal IA32_EFER.LME when paging is on", efer)?;
    }

    Ok(())
}

fn guest_bndcfgs(context: &Context<'_>) -> Outcome {
    if context.entry_controls() & entry::LOAD_IA32_BNDCFGS == 0 {
        return Ok(());
    }
    let bndcfgs = context.read(vmcs::guest::IA32_BNDCFGS_FULL);
    ensure(bndcfgs.get_bits(2..12) == 0, "IA32_BNDCFGS bits 11:2 must be 0", bndcfgs)?;
    ensure(is_canonical(bndcfgs & !0xFFF), "IA32_BNDCFGS base must be canonical", bndcfgs)
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.3.1.2 Checks on Guest Segment Registers
fn segment_selectors(context: &Context<'_>) -> Outcome {
    let tr = Segment::read(context, &TR);
    ensure(!tr.ti(), "TR selector must reference the GDT", tr.selector)?;

    let ldtr = Segment::read(context, &LDTR);
    if ldtr.usable() {
        ensure(!ldtr.ti(), "LDTR selector must reference the GDT", ldtr.selector)?;
    }

    if !virtual_8086(context) && !context.unrestricted_guest() {
        let cs = Segment::read(context, &CS);
        let ss = Segment::read(context, &SS);
        ensure(ss.rpl() == cs.rpl(), "SS.RPL must equal CS.RPL", ss.selector)?;
    }

    Ok(())
}

fn segment_bases(context: &Context<'_>) -> Outcome {
    for (fields, rule) in [(&TR, "TR base must be canonical"), (&FS, "FS base must be canonical"), (&GS, "GS base must be canonical")] {
        let segment = Segment::read(context, fields);
        ensure(is_canonical(segment.base), rule, segment.base)?;
    }

    let ldtr = Segment::read(context, &LDTR);
    if ldtr.usable() {
        ensure(is_canonical(ldtr.base), "LDTR base must be canonical", ldtr.base)?;
    }

    if virtual_8086(context) {
        return Ok(());
    }

    let cs = Segment::read(context, &CS);
    ensure(cs.base.get_bits(32..64) == 0, "CS base bits 63:32 must be 0", cs.base)?;

    for (fields, rule) in [(&SS, "SS base bits 63:32 must be 0"), (&DS, "DS base bits 63:32 must be 0"), (&ES, "ES base bits 63:32 must be 0")] {
        let segment = Segment::read(context, fields);
        if segment.usable() {
            ensure(segment.base.get_bits(32..64) == 0, rule, segment.base)?;
        }
    }

    Ok(())
}

/// In virtual-8086 mode every segment is a 64 KiB real-mode style data segment.
fn virtual_8086_segments(context: &Context<'_>) -> Outcome {
    if !virtual_8086(context) {
        return Ok(());
    }

    for fields in [&CS, &SS, &DS, &ES, &FS, &GS] {
        let segment = Segment::read(context, fields);
        ensure(segment.base == segment.selector << 4, "virtual-8086 segment base must be the selector shifted left by 4", segment.base)?;
        ensure(segment.limit == 0xFFFF, "virtual-8086 segment limit must be 0xFFFF", segment.limit)?;
        ensure(segment.access_rights() == 0xF3, "virtual-8086 segment access rights must be 0xF3", segment.access_rights())?;
    }

    Ok(())
}

fn cs_access_rights(context: &Context<'_>) -> Outcome {
    if virtual_8086(context) {
        return Ok(());
    }

    let cs = Segment::read(context, &CS);
    let ss = Segment::read(context, &SS);
    let value = cs.access_rights();
    let segment_type = cs.access.segment_type();

    ensure(cs.usable(), "CS must be usable", value)?;
    let type_allowed = matches!(segment_type, 9 | 11 | 13 | 15) || (segment_type == 3 && context.unrestricted_guest());
    ensure(type_allowed, "CS must be an accessed code segment", value)?;
    ensure(cs.access.descriptor_type(), "CS must be a code or data descriptor", value)?;

    match segment_type {
        3 => ensure(cs.access.dpl() == 0, "CS.DPL must be 0 for a data-segment CS", value)?,
        9 | 11 => ensure(cs.access.dpl() == ss.access.dpl(), "non-conforming CS.DPL must equal SS.DPL", value)?,
        _ => ensure(cs.access.dpl() <= ss.access.dpl(), "conforming CS.DPL must not exceed SS.DPL", value)?,
    }

    ensure(cs.access.present(), "CS must be present", value)?;
    ensure(cs.access.0 & AccessRights::RESERVED == 0, "CS access-rights reserved bits must be 0", value)?;
    if context.ia32e_mode_guest() && cs.access.long_mode() {
        ensure(!cs.access.default_big(), "a 64-bit CS must have D/B clear", value)?;
    }
    ensure(cs.granularity_matches_limit(), "CS granularity must match its limit", value)
}

fn ss_access_rights(context: &Context<'_>) -> Outcome {
    if virtual_8086(context) {
        return Ok(());
    }

    let ss = Segment::read(context, &SS);
    let cs = Segment::read(context, &CS);
    let value = ss.access_rights();

    if ss.usable() {
        ensure(matches!(ss.access.segment_type(), 3 | 7), "SS must be a read/write accessed data segment", value)?;
        ensure(ss.access.descriptor_type(), "SS must be a code or data descriptor", value)?;
        ensure(ss.access.present(), "SS must be present", value)?;
        ensure(ss.access.0 & AccessRights::RESERVED == 0, "SS access-rights reserved bits must be 0", value)?;
        ensure(ss.granularity_matches_limit(), "SS granularity must match its limit", value)?;
    }

    if !context.unrestricted_guest() {
        ensure(u64::from(ss.access.dpl()) == ss.rpl(), "SS.DPL must equal SS.RPL", value)?;
    }
    if cs.access.segment_type() == 3 || cr0(context) & CR0_PE == 0 {
        ensure(ss.access.dpl() == 0, "SS.DPL must be 0 in real mode or with a data-segment CS", value)?;
    }

    Ok(())
}

/// DS, ES, FS and GS, when usable.
fn data_segment(context: &Context<'_>, fields: &SegmentFields, rules: &DataSegmentRules) -> Outcome {
    if virtual_8086(context) {
        return Ok(());
    }

    let segment = Segment::read(context, fields);
    if !segment.usable() {
        return Ok(());
    }

    let value = segment.access_rights();
    ensure(segment.access.is_accessed(), rules.accessed, value)?;
    if segment.access.is_code() {
        ensure(segment.access.segment_type().get_bit(1), rules.readable, value)?;
    }
    ensure(segment.access.descriptor_type(), rules.descriptor_type, value)?;
    ensure(segment.access.present(), rules.present, value)?;
    if !context.unrestricted_guest() && segment.access.segment_type() <= 11 {
        ensure(u64::from(segment.access.dpl()) >= segment.rpl(), rules.dpl, value)?;
    }
    ensure(segment.access.0 & AccessRights::RESERVED == 0, rules.reserved, value)?;
    ensure(segment.granularity_matches_limit(), rules.granularity, value)
}

struct DataSegmentRules {
    accessed: &'static str,
    readable: &'static str,
    descriptor_type: &'static str,
    present: &'static str,
    dpl: &'static str,
    reserved: &'static str,
    granularity: &'static str,
}

macro_rules! data_segment_rules {
    ($segment:literal) => {
        DataSegmentRules {
            accessed: concat!($segment, " type must have the accessed bit set"),
            readable: concat!($segment, " code segment must be readable"),
            descriptor_type: concat!($segment, " must be a code or data descriptor"),
            present: concat!($segment, " must be present"),
            dpl: concat!($segment, ".DPL must not be below its RPL"),
            reserved: concat!($segment, " access-rights reserved bits must be 0"),
            granularity: concat!($segment, " granularity must match its limit"),
        }
    };
}

fn ds_access_rights(context: &Context<'_>) -> Outcome {
    data_segment(context, &DS, &data_segment_rules!("DS"))
}

fn es_access_rights(context: &Context<'_>) -> Outcome {
    data_segment(context, &ES, &data_segment_rules!("ES"))
}

fn fs_access_rights(context: &Context<'_>) -> Outcome {
    data_segment(context, &FS, &data_segment_rules!("FS"))
}

fn gs_access_rights(context: &Context<'_>) -> Outcome {
    data_segment(context, &GS, &data_segment_rules!("GS"))
}

fn tr_access_rights(context: &Context<'_>) -> Outcome {
    let tr = Segment::read(context, &TR);
    let value = tr.access_rights();

    let busy_tss = if context.ia32e_mode_guest() {
        tr.access.segment_type() == system_type::TSS_BUSY
    } else {
        matches!(tr.access.segment_type(), system_type::TSS16_BUSY | system_type::TSS_BUSY)
    };
    ensure(busy_tss, "TR must be a busy TSS", value)?;
    ensure(!tr.access.descriptor_type(), "TR must be a system descriptor", value)?;
    ensure(tr.access.present(), "TR must be present", value)?;
    ensure(tr.access.0 & AccessRights::RESERVED == 0, "TR access-rights reserved bits must be 0", value)?;
    ensure(tr.granularity_matches_limit(), "TR granularity must match its limit", value)?;
    ensure(tr.usable(), "TR must be usable", value)
}

fn ldtr_access_rights(context: &Context<'_>) -> Outcome {
    let ldtr = Segment::read(context, &LDTR);
    if !ldtr.usable() {
        return Ok(());
    }

    let value = ldtr.access_rights();
    ensure(ldtr.access.segment_type() == system_type::LDT, "LDTR must be an LDT descriptor", value)?;
    ensure(!ldtr.access.descriptor_type(), "LDTR must be a system descriptor", value)?;
    ensure(ldtr.access.present(), "LDTR must be present", value)?;
    ensure(ldtr.access.0 & AccessRights::RESERVED == 0, "LDTR access-rights reserved bits must be 0", value)?;
    ensure(ldtr.granularity_matches_limit(), "LDTR granularity must match its limit", value)
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.3.1.3 Checks on Guest Descriptor-Table Registers
fn descriptor_tables(context: &Context<'_>) -> Outcome {
    let gdtr_base = context.read(vmcs::guest::GDTR_BASE);
    ensure(is_canonical(gdtr_base), "GDTR base must be canonical", gdtr_base)?;
    let idtr_base = context.read(vmcs::guest::IDTR_BASE);
    ensure(is_canonical(idtr_base), "IDTR base must be canonical", idtr_base)?;

    let gdtr_limit = context.read(vmcs::guest::GDTR_LIMIT);
    ensure(gdtr_limit.get_bits(16..32) == 0, "GDTR limit bits 31:16 must be 0", gdtr_limit)?;
    let idtr_limit = context.read(vmcs::guest::IDTR_LIMIT);
    ensure(idtr_limit.get_bits(16..32) == 0, "IDTR limit bits 31:16 must be 0", idtr_limit)
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.3.1.4 Checks on Guest RIP, RFLAGS, and SSP
fn guest_rip(context: &Context<'_>) -> Outcome {
    let rip = context.read(vmcs::guest::RIP);
    let cs = Segment::read(context, &CS);

    if context.ia32e_mode_guest() && cs.access.long_mode() {
        ensure(is_canonical(rip), "RIP must be canonical in 64-bit mode", rip)
    } else {
        ensure(rip.get_bits(32..64) == 0, "RIP bits 63:32 must be 0 outside 64-bit mode", rip)
    }
}

fn guest_rflags(context: &Context<'_>) -> Outcome {
    let rflags = rflags(context);

    ensure(rflags & RFLAGS_RESERVED == 0, "RFLAGS reserved bits must be 0", rflags)?;
    ensure(rflags.get_bit(1), "RFLAGS bit 1 must be 1", rflags)?;
    if context.ia32e_mode_guest() || cr0(context) & CR0_PE == 0 {
        ensure(rflags & RFLAGS_VM == 0, "RFLAGS.VM must be 0 in IA-32e mode or real mode", rflags)?;
    }
    if let Some((InterruptionType::ExternalInterrupt, _)) = pending_event(context) {
        ensure(rflags & RFLAGS_IF != 0, "injecting an external interrupt requires RFLAGS.IF", rflags)?;
    }

    Ok(())
}

/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.3.1.5 Checks on Guest Non-Register State
fn activity_state(context: &Context<'_>) -> Outcome {
    let state = context.read(vmcs::guest::ACTIVITY_STATE);

    ensure(state <= activity::WAIT_FOR_SIPI, "activity state must be active, HLT, shutdown or wait-for-SIPI", state)?;
    if state != activity::ACTIVE {
        // IA32_VMX_MISC bits 8:6 report HLT, shutdown and wait-for-SIPI.
        let supported = context.capabilities().misc.get_bit(5 + state as usize);
        ensure(supported, "activity state is not supported by this processor", state)?;
    }
    if state == activity::HLT {
        let ss = Segment::read(context, &SS);
        ensure(ss.access.dpl() == 0, "HLT activity state requires SS.DPL 0", state)?;
    }

    Ok(())
}

fn interruptibility_state(context: &Context<'_>) -> Outcome {
    use interruptibility::*;

    let state = context.read(vmcs::guest::INTERRUPTIBILITY_STATE);

    ensure(state.get_bits(5..32) == 0, "interruptibility-state bits 31:5 must be 0", state)?;
    ensure(
        state & (BLOCKING_BY_STI | BLOCKING_BY_MOV_SS) != BLOCKING_BY_STI | BLOCKING_BY_MOV_SS,
        "blocking by STI and by MOV SS cannot both be set",
        state,
    )?;
    if rflags(context) & RFLAGS_IF == 0 {
        ensure(state & BLOCKING_BY_STI == 0, "blocking by STI requires RFLAGS.IF", state)?;
    }
    ensure(state & BLOCKING_BY_SMI == 0, "blocking by SMI is only valid in SMM", state)?;

    match pending_event(context) {
        Some((InterruptionType::ExternalInterrupt, _)) => {
            ensure(state & (BLOCKING_BY_STI | BLOCKING_BY_MOV_SS) == 0, "an external interrupt cannot be injected while STI or MOV SS blocking is in effect", state)?;
        }
        Some((InterruptionType::NonMaskableInterrupt, _)) => {
            ensure(state & BLOCKING_BY_MOV_SS == 0, "an NMI cannot be injected while MOV SS blocking is in effect", state)?;
            if context.pin_based_controls() & pin::VIRTUAL_NMIS != 0 {
                ensure(state & BLOCKING_BY_NMI == 0, "a virtual NMI cannot be injected while virtual-NMI blocking is in effect", state)?;
            }
        }
        _ => {}
    }

    Ok(())
}

fn pending_debug_exceptions(context: &Context<'_>) -> Outcome {
    let pending = context.read(vmcs::guest::PENDING_DBG_EXCEPTIONS);
    ensure(pending & PENDING_DEBUG_RESERVED == 0, "pending debug exceptions reserved bits must be 0", pending)
}

/// The link pointer must be all ones unless a shadow VMCS is linked.
fn vmcs_link_pointer(context: &Context<'_>) -> Outcome {
    let pointer = context.read(vmcs::guest::LINK_PTR_FULL);
    if pointer == u64::MAX {
        return Ok(());
    }
    ensure(context.is_page_address(pointer), "VMCS link pointer must be all ones or a page-aligned physical address", pointer)
}

/// With EPT and PAE paging outside IA-32e mode, the PDPTEs are loaded from the VMCS.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.3.1.6 Checks on Guest Page-Directory-Pointer-Table Entries
fn pdptes(context: &Context<'_>) -> Outcome {
    let pae_paging = cr0(context) & CR0_PG != 0 && cr4(context) & CR4_PAE != 0 && !context.ia32e_mode_guest();
    if !pae_paging || context.secondary_controls() & secondary::ENABLE_EPT == 0 {
        return Ok(());
    }

    let fields = [vmcs::guest::PDPTE0_FULL, vmcs::guest::PDPTE1_FULL, vmcs::guest::PDPTE2_FULL, vmcs::guest::PDPTE3_FULL];
    for pdpte in fields.map(|field| context.read(field)) {
        if !pdpte.get_bit(0) {
            continue;
        }
        ensure(pdpte.get_bits(1..3) == 0 && pdpte.get_bits(5..9) == 0, "PDPTE reserved bits must be 0", pdpte)?;
        ensure(context.is_physical_address(pdpte & !0xFFF), "PDPTE address must be below the physical-address width", pdpte)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{check::run, mock::MockHardware, setup::tests::configured_vmcs},
    };

    fn failing_check(hardware: &MockHardware) -> Option<&'static str> {
        run(BATTERY, &Context::new(hardware)).err().map(|violation| violation.check)
    }

    #[test]
    fn default_guest_state_passes() {
        let vmcs = configured_vmcs();
        assert_eq!(run(BATTERY, &Context::new(vmcs.hardware())), Ok(()));
    }

    #[test]
    fn cr0_fixed_bits_are_enforced() {
        let mut vmcs = configured_vmcs();
        vmcs.hardware_mut().set_field(vmcs::guest::CR0, 0x8000_0001);

        let violation = run(BATTERY, &Context::new(vmcs.hardware())).unwrap_err();

        assert_eq!(violation.check, "guest_cr0");
        assert_eq!(violation.rule, "CR0 bits fixed to 1 must be set");
        assert_eq!(violation.value, 0x8000_0001);
    }

    #[test]
    fn long_mode_needs_matching_efer() {
        let mut vmcs = configured_vmcs();
        vmcs.set_guest_ia32_efer(EFER_LME);
        assert_eq!(failing_check(vmcs.hardware()), Some("guest_efer"));
    }

    #[test]
    fn cs_must_be_code() {
        let mut vmcs = configured_vmcs();
        vmcs.set_guest_cs_access_rights(0xC093);
        assert_eq!(failing_check(vmcs.hardware()), Some("cs_access_rights"));
    }

    #[test]
    fn long_mode_cs_cannot_have_default_big_set() {
        let mut vmcs = configured_vmcs();
        vmcs.set_guest_cs_access_rights(0xE09B);

        let violation = run(BATTERY, &Context::new(vmcs.hardware())).unwrap_err();
        assert_eq!(violation.rule, "a 64-bit CS must have D/B clear");
    }

    #[test]
    fn unusable_data_segments_are_not_checked() {
        let mut vmcs = configured_vmcs();
        vmcs.set_guest_fs_access_rights(AccessRights::UNUSABLE | 0x1F00);
        assert_eq!(failing_check(vmcs.hardware()), None);

        vmcs.set_guest_fs_access_rights(0xC092);
        assert_eq!(failing_check(vmcs.hardware()), Some("fs_access_rights"));
    }

    #[test]
    fn granularity_must_match_limit() {
        let mut vmcs = configured_vmcs();
        vmcs.set_guest_ds_limit(0x000F_FFFE);

        let violation = run(BATTERY, &Context::new(vmcs.hardware())).unwrap_err();
        assert_eq!(violation.check, "ds_access_rights");
        assert_eq!(violation.rule, "DS granularity must match its limit");
    }

    #[test]
    fn tr_must_be_a_busy_tss() {
        let mut vmcs = configured_vmcs();
        vmcs.set_guest_tr_access_rights(0x89);
        assert_eq!(failing_check(vmcs.hardware()), Some("tr_access_rights"));
    }

    #[test]
    fn rip_must_be_canonical_in_64_bit_mode() {
        let mut vmcs = configured_vmcs();
        vmcs.set_guest_rip(0x0000_8000_0000_0000);
        assert_eq!(failing_check(vmcs.hardware()), Some("guest_rip"));
    }

    #[test]
    fn rflags_reserved_bit_1_must_be_set() {
        let mut vmcs = configured_vmcs();
        vmcs.set_guest_rflags(0);
        assert_eq!(failing_check(vmcs.hardware()), Some("guest_rflags"));
    }

    #[test]
    fn sti_blocking_requires_interrupts_enabled() {
        let mut vmcs = configured_vmcs();
        vmcs.set_guest_interruptibility_state(interruptibility::BLOCKING_BY_STI as u32);
        assert_eq!(failing_check(vmcs.hardware()), Some("interruptibility_state"));

        vmcs.set_guest_rflags(0x202);
        assert_eq!(failing_check(vmcs.hardware()), None);
    }

    #[test]
    fn link_pointer_must_be_all_ones_or_a_page() {
        let mut vmcs = configured_vmcs();
        vmcs.set_vmcs_link_pointer(0x1234);
        assert_eq!(failing_check(vmcs.hardware()), Some("vmcs_link_pointer"));
    }

    #[test]
    fn unsupported_activity_state() {
        let mut vmcs = configured_vmcs();
        vmcs.hardware_mut().set_msr(x86::msr::IA32_VMX_MISC, 0);
        vmcs.set_guest_activity_state(activity::HLT as u32);
        assert_eq!(failing_check(vmcs.hardware()), Some("activity_state"));
    }
}
