//! The run loop: one guest, driven synchronously by the host thread that owns it.

use alloc::format;
use core::fmt;

use axerrno::AxError;

use crate::cpu_local;
use crate::exit::{TrapReason, PAGE_FAULT_VECTOR};
use crate::guest::{Guest, Notification};
use crate::hal::GuestHal;
use crate::hypercall::{Hypercall, HypercallHandler};
use crate::irq::InterruptController;
use crate::memory::GuestMemory;
use crate::switcher::SwitcherWindow;
use crate::ArchGuest;

/// Why [`Guest::run`] came back without a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunError {
    /// A signal is pending for the calling thread. Handle it and invoke the loop again.
    Restart,
    /// The breakout flag is raised. Try again later.
    Breakout,
    /// The guest is dead and will never run again.
    Dead,
}

impl RunError {
    /// Whether invoking the loop again may make progress.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Dead)
    }

    /// The errno-style view: "try again later" or "no such entity".
    pub const fn to_ax_error(&self) -> AxError {
        match self {
            Self::Restart | Self::Breakout => AxError::WouldBlock,
            Self::Dead => AxError::NotFound,
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restart => f.write_str("interrupted by a signal, restart"),
            Self::Breakout => f.write_str("breakout requested, try again later"),
            Self::Dead => f.write_str("no such guest"),
        }
    }
}

impl<A: ArchGuest, M: GuestMemory> Guest<A, M> {
    /// Runs the guest until there is something for the caller: a notification, a reason to come
    /// back later, or the guest's death.
    ///
    /// Never reentered for the same guest; the only place it blocks is while the guest is halted.
    pub fn run<H, D, I>(
        &mut self,
        hal: &H,
        window: &SwitcherWindow,
        hypercalls: &mut D,
        irqs: &mut I,
    ) -> Result<Notification, RunError>
    where
        H: GuestHal,
        D: HypercallHandler<A, M>,
        I: InterruptController,
    {
        while !self.is_dead() {
            self.do_hypercalls(hypercalls);
            if self.is_dead() {
                break;
            }

            if let Some(notification) = self.pending_notify.take() {
                debug!("guest {}: notify {:?}", self.id(), notification);
                return Ok(notification);
            }

            if hal.signal_pending() {
                debug!("guest {}: signal pending", self.id());
                return Err(RunError::Restart);
            }

            if self.breakout_raised() {
                debug!("guest {}: breakout", self.id());
                return Err(RunError::Breakout);
            }

            if let Some(vector) = irqs.pending(self.id()) {
                if self.arch_mut().inject_interrupt(vector).is_ok() {
                    irqs.arm(self.id(), vector);
                    self.wake();
                }
            }

            if self.is_halted() {
                hal.wait_for_wakeup();
                continue;
            }

            hal.local_irq_disable();
            let id = self.id();
            let reload = cpu_local::enter_on_current_cpu(id, &mut self.last_cpu);
            trace!("guest {}: enter (reload: {})", id, reload);
            let trap = self.arch_mut().run(window, reload);
            hal.local_irq_enable();

            self.handle_trap(trap);
        }
        Err(RunError::Dead)
    }

    fn handle_trap(&mut self, trap: TrapReason) {
        trace!("guest {}: trap {:?}", self.id(), trap);
        match trap {
            TrapReason::Hypercall { nr, args } => {
                self.pending_hcall = Some(Hypercall::decode(nr, args));
            }
            TrapReason::ExternalInterrupt { .. } => {}
            TrapReason::PageFault { addr, error_code } => {
                if !self.arch_mut().handle_page_fault(addr, error_code)
                    && !self
                        .arch_mut()
                        .reflect_trap(PAGE_FAULT_VECTOR, Some(error_code))
                {
                    self.kill(format!("unhandled page fault at {:#x}", addr));
                }
            }
            TrapReason::Exception { vector, error_code } => {
                if !self.arch_mut().reflect_trap(vector, error_code) {
                    self.kill(format!("unhandled trap {}", vector));
                }
            }
            TrapReason::FailEntry { code } => {
                self.kill(format!("guest entry failed: {:#x}", code));
            }
        }
    }
}
