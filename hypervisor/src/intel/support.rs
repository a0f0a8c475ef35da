//! The physical processor.
//!
//! [`BareMetal`] issues the real VMX instructions and captures the running processor's
//! state as the default guest and host configuration. VMX operation (VMXON) must already
//! be active on the calling processor.

use {
    crate::{
        error::HypervisorError,
        intel::{
            capture::GuestRegisters,
            hardware::{PromoteState, VmxHardware, VmxRead},
            segment::{mark_tss_available, ExtendedGdt, SegmentDescriptor},
            setup::{DescriptorTable, GuestState, HostState},
            vmlaunch::{vm_entry, vmexit_stub},
        },
    },
    core::arch::asm,
    log::*,
    x86::{
        bits64::vmx,
        cpuid::{cpuid, CpuIdResult},
        dtables::{self, DescriptorTablePointer},
        msr,
        segmentation::{self, SegmentSelector},
        task,
        vmx::VmFail,
    },
};

/// The processor this code runs on.
#[derive(Debug, Default)]
pub struct BareMetal {
    /// GDT with the host TSS appended, referenced by HOST_GDTR_BASE.
    host_gdt: Option<ExtendedGdt>,
    /// GDT with a guest TSS appended, when the captured TR was null.
    guest_gdt: Option<ExtendedGdt>,
}

impl BareMetal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the state of the running processor for a guest that continues at `rip`
    /// with stack `rsp`.
    ///
    /// Firmware often never loads TR. In that case the guest gets a copy of the GDT with a
    /// TSS appended, owned by this `BareMetal`, and TR points at the new entry.
    pub fn capture_guest_state(&mut self, rip: u64, rsp: u64) -> GuestState {
        let gdtr = sgdt();
        let idtr = sidt();
        let gdt = descriptor_table(&gdtr);

        // SAFETY: reading control registers and MSRs is side-effect free at CPL 0.
        let (cr0, cr3, cr4) = unsafe { (x86::controlregs::cr0().bits() as u64, x86::controlregs::cr3(), x86::controlregs::cr4().bits() as u64) };
        let mut fs = SegmentDescriptor::from_gdt(gdt, segmentation::fs().bits());
        let mut gs = SegmentDescriptor::from_gdt(gdt, segmentation::gs().bits());
        // SAFETY: see above.
        unsafe {
            fs.base = msr::rdmsr(msr::IA32_FS_BASE);
            gs.base = msr::rdmsr(msr::IA32_GS_BASE);
        }
        // SAFETY: see above.
        let (ldtr, tr) = unsafe { (dtables::ldtr(), task::tr()) };

        let mut tr = SegmentDescriptor::from_gdt(gdt, tr.bits());
        let mut gdtr = DescriptorTable { base: gdtr.base as u64, limit: gdtr.limit };
        if tr.selector & !0b111 == 0 {
            let guest_gdt = self.guest_gdt.insert(ExtendedGdt::extend(gdt));
            tr = guest_gdt.tr_descriptor();
            gdtr = DescriptorTable { base: guest_gdt.base(), limit: guest_gdt.limit() };
            debug!("TR is null, guest GDT extended with a TSS at {:#x}", tr.selector);
        }

        let state = GuestState {
            cr0,
            cr3,
            cr4,
            // SAFETY: see above.
            dr7: unsafe { x86::debugregs::dr7().0 as u64 },
            rsp,
            rip,
            rflags: x86::bits64::rflags::read().bits(),
            cs: SegmentDescriptor::from_gdt(gdt, segmentation::cs().bits()),
            ss: SegmentDescriptor::from_gdt(gdt, segmentation::ss().bits()),
            ds: SegmentDescriptor::from_gdt(gdt, segmentation::ds().bits()),
            es: SegmentDescriptor::from_gdt(gdt, segmentation::es().bits()),
            fs,
            gs,
            ldtr: SegmentDescriptor::from_gdt(gdt, ldtr.bits()),
            tr,
            gdtr,
            idtr: DescriptorTable { base: idtr.base as u64, limit: idtr.limit },
            // SAFETY: see above.
            ia32_debugctl: unsafe { msr::rdmsr(msr::IA32_DEBUGCTL) },
            ia32_efer: unsafe { msr::rdmsr(msr::IA32_EFER) },
            ia32_pat: unsafe { msr::rdmsr(msr::IA32_PAT) },
            sysenter_cs: unsafe { msr::rdmsr(msr::IA32_SYSENTER_CS) } as u32,
            sysenter_esp: unsafe { msr::rdmsr(msr::IA32_SYSENTER_ESP) },
            sysenter_eip: unsafe { msr::rdmsr(msr::IA32_SYSENTER_EIP) },
        };

        debug!("Captured guest state: RIP {:#x} CS {:#x} TR {:#x}", state.rip, state.cs.selector, state.tr.selector);

        state
    }

    /// Captures the running processor's state as the VM-exit context.
    ///
    /// The current GDT is copied with a TSS appended, since a VM-exit requires a non-null
    /// TR. The copy lives as long as this `BareMetal`.
    pub fn capture_host_state(&mut self) -> HostState {
        let gdtr = sgdt();
        let idtr = sidt();
        let host_gdt = self.host_gdt.insert(ExtendedGdt::extend(descriptor_table(&gdtr)));
        let data_selector = segmentation::ss().bits();

        // SAFETY: reading control registers and MSRs is side-effect free at CPL 0.
        unsafe {
            HostState {
                cr0: x86::controlregs::cr0().bits() as u64,
                cr3: x86::controlregs::cr3(),
                cr4: x86::controlregs::cr4().bits() as u64,
                rsp: 0,
                rip: vmexit_stub as usize as u64,
                cs_selector: segmentation::cs().bits(),
                ss_selector: data_selector,
                ds_selector: data_selector,
                es_selector: data_selector,
                fs_selector: data_selector,
                gs_selector: data_selector,
                tr_selector: host_gdt.tr,
                fs_base: msr::rdmsr(msr::IA32_FS_BASE),
                gs_base: msr::rdmsr(msr::IA32_GS_BASE),
                tr_base: host_gdt.tss_base(),
                gdtr_base: host_gdt.base(),
                idtr_base: idtr.base as u64,
                ia32_efer: msr::rdmsr(msr::IA32_EFER),
                ia32_pat: msr::rdmsr(msr::IA32_PAT),
                sysenter_cs: msr::rdmsr(msr::IA32_SYSENTER_CS) as u32,
                sysenter_esp: msr::rdmsr(msr::IA32_SYSENTER_ESP),
                sysenter_eip: msr::rdmsr(msr::IA32_SYSENTER_EIP),
            }
        }
    }
}

fn sgdt() -> DescriptorTablePointer<u64> {
    let mut gdtr = DescriptorTablePointer::<u64>::default();
    // SAFETY: SGDT only stores the register.
    unsafe { dtables::sgdt(&mut gdtr) };
    gdtr
}

fn sidt() -> DescriptorTablePointer<u64> {
    let mut idtr = DescriptorTablePointer::<u64>::default();
    // SAFETY: SIDT only stores the register.
    unsafe { dtables::sidt(&mut idtr) };
    idtr
}

fn descriptor_table(pointer: &DescriptorTablePointer<u64>) -> &'static [u64] {
    let entries = (usize::from(pointer.limit) + 1) / core::mem::size_of::<u64>();
    // SAFETY: the descriptor-table register describes a live table of `limit + 1` bytes.
    unsafe { core::slice::from_raw_parts(pointer.base, entries) }
}

impl VmxRead for BareMetal {
    fn vmread(&self, field: u32) -> u64 {
        // SAFETY: VMX operation is active. A field the processor does not support reads as 0.
        unsafe { vmx::vmread(field) }.unwrap_or_else(|_| {
            trace!("VMREAD {:#x} failed", field);
            0
        })
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        // SAFETY: the core only reads architectural MSRs gated on CPUID/VMX capabilities.
        unsafe { msr::rdmsr(msr) }
    }

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuIdResult {
        cpuid!(leaf, sub_leaf)
    }
}

impl VmxHardware for BareMetal {
    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), VmFail> {
        // SAFETY: VMX operation is active.
        unsafe { vmx::vmwrite(field, value) }
    }

    fn vmclear(&mut self, vmcs_pa: u64) -> Result<(), VmFail> {
        // SAFETY: `vmcs_pa` is the physical address of a VMCS region owned by the caller.
        unsafe { vmx::vmclear(vmcs_pa) }
    }

    fn vmptrld(&mut self, vmcs_pa: u64) -> Result<(), VmFail> {
        // SAFETY: see `vmclear`.
        unsafe { vmx::vmptrld(vmcs_pa) }
    }

    fn vmlaunch(&mut self, registers: &mut GuestRegisters) -> Result<(), VmFail> {
        vm_entry(registers, false)
    }

    fn vmresume(&mut self, registers: &mut GuestRegisters) -> Result<(), VmFail> {
        vm_entry(registers, true)
    }

    fn wbinvd(&mut self) {
        // SAFETY: WBINVD has no operands; it only costs time.
        unsafe { asm!("wbinvd", options(nostack, preserves_flags)) };
    }

    fn promote(&mut self, state: &PromoteState, registers: &GuestRegisters) -> Result<(), HypervisorError> {
        debug!("Promoting to guest context at {:#x}:{:#x}", state.cs_selector, state.rip);

        // SAFETY: the VMCS has been cleared; VMXOFF leaves VMX operation on this processor.
        if let Err(error) = unsafe { vmx::vmxoff() } {
            error!("VMXOFF failed: {:?}", error);
            return Err(HypervisorError::VmxOffFailed);
        }

        let gdtr = DescriptorTablePointer::<u64> { limit: state.gdtr_limit, base: state.gdtr_base as *const u64 };
        let idtr = DescriptorTablePointer::<u64> { limit: state.idtr_limit, base: state.idtr_base as *const u64 };

        // SAFETY: every value comes from the guest-state area of a VMCS the processor accepted.
        unsafe {
            dtables::lgdt(&gdtr);
            dtables::lidt(&idtr);
            x86::controlregs::cr4_write(x86::controlregs::Cr4::from_bits_truncate(state.cr4 as usize));
            x86::controlregs::cr3_write(state.cr3);
            x86::controlregs::cr0_write(x86::controlregs::Cr0::from_bits_truncate(state.cr0 as usize));
            msr::wrmsr(msr::IA32_EFER, state.ia32_efer);
            msr::wrmsr(msr::IA32_PAT, state.ia32_pat);

            segmentation::load_ds(SegmentSelector::from_raw(state.ds_selector));
            segmentation::load_es(SegmentSelector::from_raw(state.es_selector));
            segmentation::load_fs(SegmentSelector::from_raw(state.fs_selector));
            segmentation::load_gs(SegmentSelector::from_raw(state.gs_selector));
            dtables::load_ldtr(SegmentSelector::from_raw(state.ldtr_selector));
            if state.tr_selector & !0b111 != 0 {
                // The guest TR is busy in its GDT, and LTR faults on a busy TSS.
                let descriptor = (state.gdtr_base + u64::from(state.tr_selector & !0b111)) as *mut u64;
                descriptor.write_volatile(mark_tss_available(descriptor.read_volatile()));
                task::load_tr(SegmentSelector::from_raw(state.tr_selector));
            }
            // Loading FS and GS above replaced their bases.
            msr::wrmsr(msr::IA32_FS_BASE, state.fs_base);
            msr::wrmsr(msr::IA32_GS_BASE, state.gs_base);

            resume_guest_context(registers, state);
        }
    }

    fn halt(&mut self) -> ! {
        loop {
            // SAFETY: interrupts are disabled first so the core never leaves HLT.
            unsafe {
                asm!("cli", options(nomem, nostack));
                x86::halt();
            }
        }
    }
}

/// Loads the guest general-purpose registers and returns to `CS:RIP` on `SS:RSP` with IRETQ.
unsafe fn resume_guest_context(registers: &GuestRegisters, state: &PromoteState) -> ! {
    let frame: [u64; 21] = [
        state.rip,
        u64::from(state.cs_selector),
        state.rflags,
        state.rsp,
        u64::from(state.ss_selector),
        registers.rax,
        registers.rbx,
        registers.rcx,
        registers.rdx,
        registers.rbp,
        registers.rsi,
        registers.rdi,
        registers.r8,
        registers.r9,
        registers.r10,
        registers.r11,
        registers.r12,
        registers.r13,
        registers.r14,
        registers.r15,
        0,
    ];

    // RBX and RBP cannot be asm operands, so every register is loaded from `frame`.
    asm!(
        "push qword ptr [rax + 32]",
        "push qword ptr [rax + 24]",
        "push qword ptr [rax + 16]",
        "push qword ptr [rax + 8]",
        "push qword ptr [rax]",
        "mov rbx, [rax + 48]",
        "mov rcx, [rax + 56]",
        "mov rdx, [rax + 64]",
        "mov rbp, [rax + 72]",
        "mov rsi, [rax + 80]",
        "mov rdi, [rax + 88]",
        "mov r8, [rax + 96]",
        "mov r9, [rax + 104]",
        "mov r10, [rax + 112]",
        "mov r11, [rax + 120]",
        "mov r12, [rax + 128]",
        "mov r13, [rax + 136]",
        "mov r14, [rax + 144]",
        "mov r15, [rax + 152]",
        "mov rax, [rax + 40]",
        "iretq",
        in("rax") frame.as_ptr(),
        options(noreturn),
    );
}
