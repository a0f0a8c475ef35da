//! Compile-time configuration shared across the crate.

use crate::logger::SerialPort;

/// Size of the per-reason handler table.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table C-1. Basic Exit Reasons
pub const EXIT_REASON_COUNT: usize = 76;

/// An x86 instruction is never longer than 15 bytes.
pub const MAX_INSTRUCTION_LENGTH: u64 = 15;

/// Serial port used by `vmm::start` when the loader did not install a logger.
pub const DEFAULT_SERIAL_PORT: SerialPort = SerialPort::COM1;

/// Log level used by `vmm::start` when the loader did not install a logger.
pub const DEFAULT_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Debug;

/// First leaf of the hypervisor CPUID range.
pub const HYPERVISOR_CPUID_LEAF: u32 = 0x4000_0000;

/// Vendor signature reported in EBX:ECX:EDX of [`HYPERVISOR_CPUID_LEAF`].
pub const HYPERVISOR_CPUID_SIGNATURE: [u8; 12] = *b"VmxCoreHvisr";

/// Physical-address width assumed when CPUID leaf 0x8000_0008 is not available.
pub const DEFAULT_PHYSICAL_ADDRESS_WIDTH: u8 = 36;
