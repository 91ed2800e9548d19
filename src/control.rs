use crate::cpu_local;
use crate::guest::{BreakoutHandle, Guest, Notification};
use crate::hal::GuestHal;
use crate::host::Host;
use crate::hypercall::HypercallHandler;
use crate::irq::InterruptController;
use crate::memory::GuestMemory;
use crate::run::RunError;
use crate::{ArchGuest, GuestId};

/// The controlling caller's grip on one guest, in the manner of a character device: each
/// [`read`](ControlHandle::read) is one run-loop invocation.
///
/// Dropping the handle destroys the guest and removes it from the host's table.
pub struct ControlHandle<'h, H: GuestHal, A: ArchGuest, M: GuestMemory> {
    host: &'h Host<H>,
    guest: Guest<A, M>,
}

impl<'h, H: GuestHal, A: ArchGuest, M: GuestMemory> ControlHandle<'h, H, A, M> {
    pub(crate) fn new(host: &'h Host<H>, guest: Guest<A, M>) -> Self {
        Self { host, guest }
    }

    /// Get the id of the guest.
    pub fn id(&self) -> GuestId {
        self.guest.id()
    }

    /// Get the guest.
    pub fn guest(&self) -> &Guest<A, M> {
        &self.guest
    }

    /// Get the mutable guest.
    pub fn guest_mut(&mut self) -> &mut Guest<A, M> {
        &mut self.guest
    }

    /// A handle on the guest's breakout flag, which may be raised from another thread.
    pub fn breakout(&self) -> BreakoutHandle {
        self.guest.breakout()
    }

    /// Runs the guest until it notifies, returning the notification as `[addr, key]`.
    ///
    /// [`RunError::Restart`] and [`RunError::Breakout`] ask the caller to come back later;
    /// [`RunError::Dead`] means the guest is gone and every further read fails the same way.
    pub fn read<D, I>(&mut self, hypercalls: &mut D, irqs: &mut I) -> Result<[usize; 2], RunError>
    where
        D: HypercallHandler<A, M>,
        I: InterruptController,
    {
        let window = self.host.window();
        self.guest
            .run(self.host.hal(), &window, hypercalls, irqs)
            .map(Notification::to_words)
    }

    /// Destroys the guest.
    pub fn close(self) {}
}

impl<H: GuestHal, A: ArchGuest, M: GuestMemory> Drop for ControlHandle<'_, H, A, M> {
    fn drop(&mut self) {
        cpu_local::forget_on_current_cpu(self.guest.id());
        self.host.release(self.guest.id());
    }
}
