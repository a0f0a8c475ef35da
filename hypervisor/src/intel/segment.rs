//! Segment descriptors as the VMCS wants them: base, limit and access rights.

use {
    alloc::{boxed::Box, vec::Vec},
    bitfield::bitfield,
    core::mem::size_of,
};

bitfield! {
    /// Guest segment access-rights field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-2. Format of Access Rights
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct AccessRights(u32);

    impl Debug;

    pub segment_type, set_segment_type: 3, 0;
    pub descriptor_type, set_descriptor_type: 4;
    pub dpl, set_dpl: 6, 5;
    pub present, set_present: 7;
    pub available, set_available: 12;
    pub long_mode, set_long_mode: 13;
    pub default_big, set_default_big: 14;
    pub granularity, set_granularity: 15;
    pub unusable, set_unusable: 16;
}

impl AccessRights {
    /// Bits 11:8 and 31:17.
    pub const RESERVED: u32 = 0xFFFE_0F00;
    pub const UNUSABLE: u32 = 1 << 16;

    /// Type bit 3: code segment when S = 1.
    pub fn is_code(&self) -> bool {
        self.descriptor_type() && self.segment_type() & 0b1000 != 0
    }

    pub fn is_accessed(&self) -> bool {
        self.segment_type() & 0b0001 != 0
    }
}

/// System-segment types used by the checks and the TSS builder.
pub mod system_type {
    pub const LDT: u32 = 2;
    pub const TSS16_BUSY: u32 = 3;
    pub const TSS_AVAILABLE: u32 = 9;
    pub const TSS_BUSY: u32 = 11;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

impl SegmentDescriptor {
    pub const fn unusable(selector: u16) -> Self {
        Self { selector, base: 0, limit: 0, access_rights: AccessRights::UNUSABLE }
    }

    /// Decodes the GDT entry `selector` refers to.
    ///
    /// The null selector, LDT selectors and selectors past the end of `gdt` yield an unusable
    /// segment. Code and data segments are marked accessed and an available TSS is reported
    /// busy, since VM-entry requires both.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5 Segment Descriptors
    pub fn from_gdt(gdt: &[u64], selector: u16) -> Self {
        let index = usize::from(selector >> 3);
        if index == 0 || selector & 0b100 != 0 || index >= gdt.len() {
            return Self::unusable(selector);
        }

        let low = gdt[index];
        let mut access_rights = AccessRights((((low >> 40) & 0xFF) | (((low >> 52) & 0xF) << 12)) as u32);
        if !access_rights.present() {
            return Self::unusable(selector);
        }

        let mut base = ((low >> 16) & 0xFF_FFFF) | (((low >> 56) & 0xFF) << 24);
        if !access_rights.descriptor_type() {
            // System descriptors are 16 bytes in IA-32e mode.
            if let Some(high) = gdt.get(index + 1) {
                base |= (high & 0xFFFF_FFFF) << 32;
            }
            if access_rights.segment_type() == system_type::TSS_AVAILABLE {
                access_rights.set_segment_type(system_type::TSS_BUSY);
            }
        } else {
            access_rights.set_segment_type(access_rights.segment_type() | 1);
        }

        let mut limit = ((low & 0xFFFF) | ((low >> 32) & 0xF_0000)) as u32;
        if access_rights.granularity() {
            limit = (limit << 12) | 0xFFF;
        }

        Self { selector, base, limit, access_rights: access_rights.0 }
    }
}

/// Minimal 64-bit TSS: no I/O permission bitmap, no interrupt stacks.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
#[repr(C, align(16))]
pub struct TaskStateSegment {
    #[derivative(Debug = "ignore")]
    raw: [u8; TSS_SIZE],
}

const TSS_SIZE: usize = 104;

impl Default for TaskStateSegment {
    fn default() -> Self {
        let mut raw = [0; TSS_SIZE];
        // I/O map base past the segment limit.
        raw[102..104].copy_from_slice(&(TSS_SIZE as u16).to_le_bytes());
        Self { raw }
    }
}

impl TaskStateSegment {
    pub const LIMIT: u32 = TSS_SIZE as u32 - 1;
}

/// Builds the two GDT slots of an available 64-bit TSS descriptor.
pub fn tss_descriptor(base: u64, limit: u32) -> [u64; 2] {
    let limit = u64::from(limit);
    let mut low = limit & 0xFFFF;
    low |= (base & 0xFF_FFFF) << 16;
    low |= u64::from(system_type::TSS_AVAILABLE) << 40;
    low |= 1 << 47;
    low |= ((limit >> 16) & 0xF) << 48;
    low |= ((base >> 24) & 0xFF) << 56;
    [low, base >> 32]
}

/// Returns `descriptor` with a busy TSS type turned back into an available one.
///
/// LTR faults on a busy TSS, so the descriptor is fixed up before TR is reloaded.
pub fn mark_tss_available(descriptor: u64) -> u64 {
    let mut access_rights = AccessRights(((descriptor >> 40) & 0xFF) as u32);
    if access_rights.descriptor_type() || access_rights.segment_type() != system_type::TSS_BUSY {
        return descriptor;
    }
    access_rights.set_segment_type(system_type::TSS_AVAILABLE);
    (descriptor & !(0xFF << 40)) | (u64::from(access_rights.0) << 40)
}

/// A copy of a GDT with a TSS appended.
///
/// The host needs one because VM-exit requires a non-null TR. A guest captured from
/// firmware that never loaded TR gets one too, since VM-entry rejects an unusable TR.
#[derive(Debug)]
pub struct ExtendedGdt {
    pub entries: Vec<u64>,
    pub tr: u16,
    pub tss: Box<TaskStateSegment>,
}

impl ExtendedGdt {
    pub fn extend(current: &[u64]) -> Self {
        let tss = Box::new(TaskStateSegment::default());
        let mut entries = current.to_vec();
        let index = entries.len();
        entries.extend_from_slice(&tss_descriptor(&*tss as *const TaskStateSegment as u64, TaskStateSegment::LIMIT));

        let tr = (index as u16) << 3;
        log::debug!("GDT extended with a TSS at index {index}, TR: {tr:#x}");

        Self { entries, tr, tss }
    }

    pub fn base(&self) -> u64 {
        self.entries.as_ptr() as u64
    }

    /// GDTR limit covering every entry, the appended TSS included.
    pub fn limit(&self) -> u16 {
        (self.entries.len() * size_of::<u64>() - 1) as u16
    }

    pub fn tss_base(&self) -> u64 {
        &*self.tss as *const TaskStateSegment as u64
    }

    /// The appended TSS as VM-entry expects it in the guest TR.
    pub fn tr_descriptor(&self) -> SegmentDescriptor {
        SegmentDescriptor::from_gdt(&self.entries, self.tr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GDT: [u64; 4] = [0, 0x00AF_9B00_0000_FFFF, 0x00CF_9300_0000_FFFF, 0x00CF_9200_0000_FFFF];

    #[test]
    fn flat_segments_decode_to_full_limit() {
        let cs = SegmentDescriptor::from_gdt(&GDT, 0x08);
        assert_eq!(cs.base, 0);
        assert_eq!(cs.limit, 0xFFFF_FFFF);
        assert_eq!(cs.access_rights, 0xA09B);
        assert!(AccessRights(cs.access_rights).long_mode());

        let ss = SegmentDescriptor::from_gdt(&GDT, 0x10);
        assert_eq!(ss.access_rights, 0xC093);
    }

    #[test]
    fn data_segments_are_marked_accessed() {
        let ds = SegmentDescriptor::from_gdt(&GDT, 0x18);
        assert!(AccessRights(ds.access_rights).is_accessed());
    }

    #[test]
    fn null_and_out_of_range_selectors_are_unusable() {
        for selector in [0, 0x20, 0x0C] {
            let segment = SegmentDescriptor::from_gdt(&GDT, selector);
            assert!(AccessRights(segment.access_rights).unusable());
            assert_eq!(segment.selector, selector);
        }
    }

    #[test]
    fn appended_tss_decodes_busy_with_full_base() {
        let base = 0xFFFF_8000_1234_5000;
        let mut gdt = GDT.to_vec();
        gdt.extend_from_slice(&tss_descriptor(base, TaskStateSegment::LIMIT));

        let tr = SegmentDescriptor::from_gdt(&gdt, 4 << 3);
        assert_eq!(tr.base, base);
        assert_eq!(tr.limit, 103);
        assert_eq!(tr.access_rights, 0x8B);
    }

    #[test]
    fn extended_gdt_keeps_existing_entries() {
        let extended = ExtendedGdt::extend(&GDT);
        assert_eq!(&extended.entries[..4], &GDT);
        assert_eq!(extended.tr, 4 << 3);
        assert_eq!(extended.limit(), 6 * 8 - 1);
    }

    #[test]
    fn extended_gdt_gives_a_null_tr_a_usable_busy_tss() {
        // Firmware GDT without a TSS, TR never loaded.
        assert!(AccessRights(SegmentDescriptor::from_gdt(&GDT, 0).access_rights).unusable());

        let extended = ExtendedGdt::extend(&GDT);
        let tr = extended.tr_descriptor();
        let access_rights = AccessRights(tr.access_rights);

        assert!(!access_rights.unusable());
        assert!(access_rights.present());
        assert_eq!(access_rights.segment_type(), system_type::TSS_BUSY);
        assert_eq!(tr.selector, extended.tr);
        assert_eq!(tr.base, extended.tss_base());
        assert_eq!(tr.limit, TaskStateSegment::LIMIT);
        // The new TR lies inside the guest GDTR.
        assert!(usize::from(tr.selector) + 15 <= usize::from(extended.limit()));
    }

    #[test]
    fn busy_tss_is_made_available_for_ltr() {
        let [low, _] = tss_descriptor(0xFFFF_8000_1234_5000, TaskStateSegment::LIMIT);
        let busy = low | (2 << 40);

        let available = mark_tss_available(busy);
        assert_eq!(available, low);
        assert_eq!(SegmentDescriptor::from_gdt(&[0, available, 0xFFFF_8000], 0x08).base, 0xFFFF_8000_1234_5000);
    }

    #[test]
    fn other_descriptors_are_left_alone() {
        for descriptor in GDT {
            assert_eq!(mark_tss_available(descriptor), descriptor);
        }
        let [available, _] = tss_descriptor(0x1000, TaskStateSegment::LIMIT);
        assert_eq!(mark_tss_available(available), available);
    }
}
