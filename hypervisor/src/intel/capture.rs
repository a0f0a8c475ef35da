//! Guest general-purpose register file.

use static_assertions::const_assert_eq;

/// Registers spilled by the VM-exit stub and reloaded before every VM-entry.
///
/// RSP, RIP and RFLAGS live in the VMCS; the copies here are refreshed after every exit so
/// handlers can read them without a VMREAD.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rip: u64,
}

// The assembly stubs index this struct by `offset_of!`; keep it a flat array of u64.
const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 18 * 8);

impl GuestRegisters {
    /// Stores a CPUID result the way the instruction does: zero-extended into RAX..RDX.
    pub fn set_cpuid_result(&mut self, eax: u32, ebx: u32, ecx: u32, edx: u32) {
        self.rax = u64::from(eax);
        self.rbx = u64::from(ebx);
        self.rcx = u64::from(ecx);
        self.rdx = u64::from(edx);
    }
}
