//! Control-plane core of an Intel VT-x hypervisor.
//!
//! Owns the VMCS lifecycle (clear, load, launch, resume), routes VM-exits to registered
//! handler chains and, when the processor rejects a VM-entry, runs the VM-entry compliance
//! checks so the failure is reported as a named rule instead of an opaque error code.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
extern crate static_assertions;

pub mod error;
pub mod global_const;
pub mod intel;
pub mod logger;
pub mod vmm;
