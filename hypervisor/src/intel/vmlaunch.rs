//! VM-entry and VM-exit stubs.
//!
//! `enter_guest` saves the host's callee-saved registers, records the resulting stack
//! pointer as HOST_RSP, loads the guest's general-purpose registers and executes
//! VMLAUNCH or VMRESUME. On a VM-exit the processor continues at `vmexit_stub` (HOST_RIP)
//! on that same stack, which spills the guest registers and returns from `enter_guest` as
//! if the entry instruction had completed.

use {
    crate::intel::capture::GuestRegisters,
    core::{arch::global_asm, mem},
    x86::vmx::{vmcs, VmFail},
    x86_64::registers::rflags::RFlags,
};

extern "sysv64" {
    /// Returns 0 after a VM-exit, or RFLAGS when the entry instruction failed.
    fn enter_guest(registers: *mut GuestRegisters, resume: u64) -> u64;

    /// HOST_RIP of every VMCS set up for this processor.
    pub fn vmexit_stub();
}

/// Enters the guest with VMLAUNCH (`resume == false`) or VMRESUME.
pub fn vm_entry(registers: &mut GuestRegisters, resume: bool) -> Result<(), VmFail> {
    // SAFETY: the current VMCS has HOST_RIP set to `vmexit_stub`, which returns here.
    let flags = unsafe { enter_guest(registers, u64::from(resume)) };
    vm_succeed(RFlags::from_bits_truncate(flags))
}

/// Decodes the VMX instruction status flags.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.2 Conventions
fn vm_succeed(flags: RFlags) -> Result<(), VmFail> {
    if flags.contains(RFlags::ZERO_FLAG) {
        Err(VmFail::VmFailValid)
    } else if flags.contains(RFlags::CARRY_FLAG) {
        Err(VmFail::VmFailInvalid)
    } else {
        Ok(())
    }
}

global_asm!(
    r#"
    .globl enter_guest
    .globl vmexit_stub

enter_guest:
    // rdi = &mut GuestRegisters, rsi = resume
    push    rdi
    push    rbx
    push    rbp
    push    r12
    push    r13
    push    r14
    push    r15

    mov     rax, {host_rsp}
    vmwrite rax, rsp
    jbe     .Lfailed

    mov     rax, rdi
    mov     rcx, [rax + {registers_rcx}]
    mov     rdx, [rax + {registers_rdx}]
    mov     rbx, [rax + {registers_rbx}]
    mov     rbp, [rax + {registers_rbp}]
    mov     rdi, [rax + {registers_rdi}]
    mov     r8,  [rax + {registers_r8}]
    mov     r9,  [rax + {registers_r9}]
    mov     r10, [rax + {registers_r10}]
    mov     r11, [rax + {registers_r11}]
    mov     r12, [rax + {registers_r12}]
    mov     r13, [rax + {registers_r13}]
    mov     r14, [rax + {registers_r14}]
    mov     r15, [rax + {registers_r15}]

    test    rsi, rsi
    mov     rsi, [rax + {registers_rsi}]
    mov     rax, [rax + {registers_rax}]
    jnz     .Lresume

    vmlaunch
    jmp     .Lfailed

.Lresume:
    vmresume

.Lfailed:
    pushfq
    pop     rax
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbp
    pop     rbx
    pop     rdi
    ret

vmexit_stub:
    // rsp = HOST_RSP; the GuestRegisters pointer sits above the six callee-saved registers.
    push    rax
    mov     rax, [rsp + 7 * 8]
    mov     [rax + {registers_rcx}], rcx
    mov     [rax + {registers_rdx}], rdx
    mov     [rax + {registers_rbx}], rbx
    mov     [rax + {registers_rbp}], rbp
    mov     [rax + {registers_rsi}], rsi
    mov     [rax + {registers_rdi}], rdi
    mov     [rax + {registers_r8}],  r8
    mov     [rax + {registers_r9}],  r9
    mov     [rax + {registers_r10}], r10
    mov     [rax + {registers_r11}], r11
    mov     [rax + {registers_r12}], r12
    mov     [rax + {registers_r13}], r13
    mov     [rax + {registers_r14}], r14
    mov     [rax + {registers_r15}], r15
    pop     rcx
    mov     [rax + {registers_rax}], rcx

    xor     eax, eax
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbp
    pop     rbx
    pop     rdi
    ret
"#,
    host_rsp = const vmcs::host::RSP,
    registers_rax = const mem::offset_of!(GuestRegisters, rax),
    registers_rcx = const mem::offset_of!(GuestRegisters, rcx),
    registers_rdx = const mem::offset_of!(GuestRegisters, rdx),
    registers_rbx = const mem::offset_of!(GuestRegisters, rbx),
    registers_rbp = const mem::offset_of!(GuestRegisters, rbp),
    registers_rsi = const mem::offset_of!(GuestRegisters, rsi),
    registers_rdi = const mem::offset_of!(GuestRegisters, rdi),
    registers_r8 = const mem::offset_of!(GuestRegisters, r8),
    registers_r9 = const mem::offset_of!(GuestRegisters, r9),
    registers_r10 = const mem::offset_of!(GuestRegisters, r10),
    registers_r11 = const mem::offset_of!(GuestRegisters, r11),
    registers_r12 = const mem::offset_of!(GuestRegisters, r12),
    registers_r13 = const mem::offset_of!(GuestRegisters, r13),
    registers_r14 = const mem::offset_of!(GuestRegisters, r14),
    registers_r15 = const mem::offset_of!(GuestRegisters, r15),
);
