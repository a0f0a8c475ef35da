//! VM-exit dispatch.
//!
//! Handlers are kept per basic exit reason and run last-registered-first until one of them
//! claims the exit. A separate chain of unconditional handlers runs on every exit before
//! the reason chain; their results are ignored.

use {
    crate::{
        global_const::EXIT_REASON_COUNT,
        intel::{hardware::VmxHardware, vcpu::Vcpu, vmerror::VmxBasicExitReason},
    },
    alloc::{boxed::Box, vec::Vec},
    log::*,
};

pub mod cpuid;
pub mod invd;
pub mod vmx_instruction;

/// Something that can service a VM-exit.
///
/// Returns `true` when the exit was handled and dispatch should stop.
pub trait Handler<H> {
    fn invoke(&mut self, vcpu: &mut Vcpu<H>) -> bool;
}

impl<H, F> Handler<H> for F
where
    F: FnMut(&mut Vcpu<H>) -> bool,
{
    fn invoke(&mut self, vcpu: &mut Vcpu<H>) -> bool {
        self(vcpu)
    }
}

pub type BoxedHandler<H> = Box<dyn Handler<H>>;

pub struct ExitHandler<H> {
    handlers: [Vec<BoxedHandler<H>>; EXIT_REASON_COUNT],
    exit_handlers: Vec<BoxedHandler<H>>,
}

impl<H> Default for ExitHandler<H> {
    fn default() -> Self {
        Self {
            handlers: core::array::from_fn(|_| Vec::new()),
            exit_handlers: Vec::new(),
        }
    }
}

impl<H> core::fmt::Debug for ExitHandler<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let registered = self.handlers.iter().filter(|chain| !chain.is_empty()).count();
        f.debug_struct("ExitHandler")
            .field("reasons", &registered)
            .field("exit_handlers", &self.exit_handlers.len())
            .finish()
    }
}

impl<H: VmxHardware + 'static> ExitHandler<H> {
    /// Registers `handler` for `reason`. It runs before every handler registered earlier.
    pub fn add_handler(&mut self, reason: VmxBasicExitReason, handler: impl Handler<H> + 'static) {
        self.handlers[reason as usize].push(Box::new(handler));
    }

    /// Registers a handler that runs on every VM-exit. Its return value is ignored.
    pub fn add_exit_handler(&mut self, handler: impl Handler<H> + 'static) {
        self.exit_handlers.push(Box::new(handler));
    }

    /// Runs the handlers for the exit the processor just took.
    ///
    /// Returns `false` if no handler claimed the exit, which the caller treats as fatal.
    pub fn dispatch(&mut self, vcpu: &mut Vcpu<H>) -> bool {
        let exit_reason = vcpu.vmcs().exit_reason();

        for handler in self.exit_handlers.iter_mut().rev() {
            handler.invoke(vcpu);
        }

        let Some(chain) = self.handlers.get_mut((exit_reason & 0xFFFF) as usize) else {
            warn!("VM exit reason {:#x} is outside the handler table", exit_reason);
            return false;
        };

        if chain.is_empty() {
            return false;
        }

        chain.iter_mut().rev().any(|handler| handler.invoke(vcpu))
    }

    /// Moves handlers registered on `newer` (while this table was taken out for dispatch)
    /// behind the ones already here, so they keep running first.
    pub fn absorb(&mut self, newer: ExitHandler<H>) {
        for (chain, added) in self.handlers.iter_mut().zip(newer.handlers) {
            chain.extend(added);
        }
        self.exit_handlers.extend(newer.exit_handlers);
    }
}

/// Unconditional handler that counts VM-exits and traces each one.
pub fn exit_tracer<H: VmxHardware + 'static>() -> impl Handler<H> {
    let mut count = 0u64;
    move |vcpu: &mut Vcpu<H>| {
        count += 1;
        let exit_reason = vcpu.vmcs().exit_reason();
        match VmxBasicExitReason::from_exit_reason(exit_reason) {
            Some(reason) => trace!("vcpu {} exit #{}: {}", vcpu.id(), count, reason),
            None => trace!("vcpu {} exit #{}: unknown reason {:#x}", vcpu.id(), count, exit_reason),
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::HypervisorError,
            intel::{memory::IdentityMapped, mock::MockHardware, vcpu::VcpuRole},
        },
        alloc::{rc::Rc, vec},
        core::cell::{Cell, RefCell},
        x86::vmx::vmcs,
    };

    fn vcpu() -> Vcpu<MockHardware> {
        let mut vcpu = Vcpu::new(0, VcpuRole::Guest, MockHardware::new(), &mut IdentityMapped).unwrap();
        vcpu.vmcs_mut().load().unwrap();
        vcpu
    }

    fn take_exit(vcpu: &mut Vcpu<MockHardware>, reason: VmxBasicExitReason) -> Result<(), HypervisorError> {
        vcpu.vmcs_mut().hardware_mut().set_field(vmcs::ro::EXIT_REASON, reason as u64);
        vcpu.handle_exit()
    }

    #[test]
    fn reason_chain_runs_last_registered_first_and_stops_at_first_claim() {
        let mut vcpu = vcpu();
        let calls = Rc::new(RefCell::new(Vec::new()));

        for (name, claims) in [("h1", false), ("h2", true), ("h3", false)] {
            let calls = calls.clone();
            vcpu.add_handler(VmxBasicExitReason::Hlt, move |_: &mut Vcpu<MockHardware>| {
                calls.borrow_mut().push(name);
                claims
            });
        }

        assert_eq!(take_exit(&mut vcpu, VmxBasicExitReason::Hlt), Ok(()));
        assert_eq!(*calls.borrow(), vec!["h3", "h2"]);
    }

    #[test]
    fn unclaimed_exit_is_unhandled() {
        let mut vcpu = vcpu();
        vcpu.add_handler(VmxBasicExitReason::Rdtsc, |_: &mut Vcpu<MockHardware>| false);
        vcpu.add_handler(VmxBasicExitReason::Rdtsc, |_: &mut Vcpu<MockHardware>| false);

        assert_eq!(take_exit(&mut vcpu, VmxBasicExitReason::Rdtsc), Err(HypervisorError::UnhandledVmExit { reason: 16 }));
    }

    #[test]
    fn reason_without_handlers_is_unhandled() {
        let mut vcpu = vcpu();
        assert_eq!(take_exit(&mut vcpu, VmxBasicExitReason::Xsetbv), Err(HypervisorError::UnhandledVmExit { reason: 55 }));
    }

    #[test]
    fn unconditional_handlers_run_on_every_exit_and_never_claim() {
        let mut vcpu = vcpu();
        let count = Rc::new(Cell::new(0));

        let counter = count.clone();
        vcpu.add_exit_handler(move |_: &mut Vcpu<MockHardware>| {
            counter.set(counter.get() + 1);
            true
        });
        vcpu.add_handler(VmxBasicExitReason::Hlt, |_: &mut Vcpu<MockHardware>| true);
        vcpu.add_handler(VmxBasicExitReason::Invd, |_: &mut Vcpu<MockHardware>| true);

        let reasons = [
            VmxBasicExitReason::Hlt,
            VmxBasicExitReason::Invd,
            VmxBasicExitReason::Hlt,
            VmxBasicExitReason::Rdrand,
            VmxBasicExitReason::Invd,
        ];
        let outcomes: Vec<bool> = reasons.iter().map(|&reason| take_exit(&mut vcpu, reason).is_ok()).collect();

        assert_eq!(count.get(), 5);
        assert_eq!(outcomes, [true, true, true, false, true]);
    }

    #[test]
    fn unconditional_handlers_run_before_the_reason_chain() {
        let mut vcpu = vcpu();
        let calls = Rc::new(RefCell::new(Vec::new()));

        let first = calls.clone();
        vcpu.add_exit_handler(move |_: &mut Vcpu<MockHardware>| {
            first.borrow_mut().push("every exit (older)");
            false
        });
        let second = calls.clone();
        vcpu.add_exit_handler(move |_: &mut Vcpu<MockHardware>| {
            second.borrow_mut().push("every exit (newer)");
            false
        });
        let reason = calls.clone();
        vcpu.add_handler(VmxBasicExitReason::Hlt, move |_: &mut Vcpu<MockHardware>| {
            reason.borrow_mut().push("hlt");
            true
        });

        take_exit(&mut vcpu, VmxBasicExitReason::Hlt).unwrap();

        assert_eq!(*calls.borrow(), ["every exit (newer)", "every exit (older)", "hlt"]);
    }

    #[test]
    fn handlers_registered_during_dispatch_are_kept() {
        let mut vcpu = vcpu();
        let late = Rc::new(Cell::new(0));

        let counter = late.clone();
        vcpu.add_handler(VmxBasicExitReason::Hlt, move |vcpu: &mut Vcpu<MockHardware>| {
            let counter = counter.clone();
            vcpu.add_handler(VmxBasicExitReason::Pause, move |_: &mut Vcpu<MockHardware>| {
                counter.set(counter.get() + 1);
                true
            });
            true
        });

        take_exit(&mut vcpu, VmxBasicExitReason::Hlt).unwrap();
        take_exit(&mut vcpu, VmxBasicExitReason::Pause).unwrap();

        assert_eq!(late.get(), 1);
    }
}
