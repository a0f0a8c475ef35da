//! Intel VT-x.

pub mod capabilities;
pub mod capture;
pub mod check;
pub mod controls;
#[cfg(feature = "diagnostics")]
pub mod diagnostics;
pub mod events;
pub mod hardware;
pub mod memory;
#[cfg(test)]
pub mod mock;
pub mod segment;
pub mod setup;
pub mod support;
pub mod vcpu;
pub mod vmcs;
pub mod vmerror;
pub mod vmexit;
pub mod vmlaunch;
