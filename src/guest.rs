use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::{ax_err, AxResult};

use crate::hypercall::{Hypercall, HypercallRing};
use crate::memory::{GuestMemory, GuestPhysAddr, PAGE_SIZE};
use crate::{ArchGuest, GuestId};

/// The state of a guest, as seen by the run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestState {
    /// The guest is runnable.
    Running = 0,
    /// The guest halted itself and waits for an interrupt.
    Halted = 1,
    /// The guest is gone. Terminal.
    Dead = 2,
}

/// Why a guest died.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadReason {
    /// Human-readable description.
    pub message: String,
    /// Whether the guest asked to be started again rather than powered off.
    pub restart: bool,
}

/// A "data ready" signal raised by the guest, surfaced to the controlling caller as a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Guest address the notification refers to.
    pub addr: usize,
    /// Caller-defined key.
    pub key: usize,
}

impl Notification {
    /// The two machine words handed back through the control handle.
    pub const fn to_words(self) -> [usize; 2] {
        [self.addr, self.key]
    }
}

/// A shareable switch which makes the run loop return [`RunError::Breakout`] instead of entering
/// the guest, so the host can interleave other work.
///
/// The flag stays raised until [`BreakoutHandle::clear`] is called.
///
/// [`RunError::Breakout`]: crate::RunError::Breakout
#[derive(Clone, Debug, Default)]
pub struct BreakoutHandle(Arc<AtomicBool>);

impl BreakoutHandle {
    /// Raises the flag.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Lowers the flag.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether the flag is raised.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Parameters for creating a guest.
#[derive(Debug, Clone)]
pub struct GuestConfig<C> {
    /// Memory ceiling in pages. Must be non-zero and covered by the backing memory.
    pub pfn_limit: usize,
    /// Where the guest starts executing.
    pub entry: GuestPhysAddr,
    /// Architecture-specific creation parameters.
    pub arch: C,
}

/// One virtual machine, driven by exactly one host thread through its run loop.
///
/// The guest is exclusively owned by its [`ControlHandle`](crate::ControlHandle); nothing in
/// here is synchronized except the breakout flag.
pub struct Guest<A: ArchGuest, M: GuestMemory> {
    id: GuestId,
    mem: M,
    pfn_limit: usize,
    halted: bool,
    dead: Option<DeadReason>,
    pub(crate) pending_hcall: Option<Hypercall>,
    pub(crate) pending_notify: Option<Notification>,
    pub(crate) ring: Option<HypercallRing>,
    /// The physical CPU this guest was last entered on.
    pub(crate) last_cpu: Option<usize>,
    breakout: BreakoutHandle,
    arch: A,
}

impl<A: ArchGuest, M: GuestMemory> Guest<A, M> {
    /// Create a new [`Guest`] over `mem`.
    pub fn new(id: GuestId, config: GuestConfig<A::CreateConfig>, mem: M) -> AxResult<Self> {
        if config.pfn_limit == 0 {
            return ax_err!(InvalidInput, "guest needs at least one page");
        }
        match config.pfn_limit.checked_mul(PAGE_SIZE) {
            Some(bytes) if bytes <= mem.size() => {}
            _ => return ax_err!(InvalidInput, "pfn_limit exceeds guest memory"),
        }

        let mut arch = A::new(id, config.arch)?;
        arch.set_entry(config.entry)?;
        Ok(Self {
            id,
            mem,
            pfn_limit: config.pfn_limit,
            halted: false,
            dead: None,
            pending_hcall: None,
            pending_notify: None,
            ring: None,
            last_cpu: None,
            breakout: BreakoutHandle::default(),
            arch,
        })
    }

    /// Get the id of the guest.
    pub const fn id(&self) -> GuestId {
        self.id
    }

    /// Memory ceiling in pages.
    pub const fn pfn_limit(&self) -> usize {
        self.pfn_limit
    }

    /// Get the state of the guest.
    pub fn state(&self) -> GuestState {
        if self.dead.is_some() {
            GuestState::Dead
        } else if self.halted {
            GuestState::Halted
        } else {
            GuestState::Running
        }
    }

    /// Whether the guest is dead.
    pub fn is_dead(&self) -> bool {
        self.dead.is_some()
    }

    /// Whether the guest is halted.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Why the guest died, if it did.
    pub fn dead_reason(&self) -> Option<&DeadReason> {
        self.dead.as_ref()
    }

    /// The notification waiting to be returned by the next loop iteration, if any.
    pub fn pending_notification(&self) -> Option<Notification> {
        self.pending_notify
    }

    /// Another handle on this guest's breakout flag.
    pub fn breakout(&self) -> BreakoutHandle {
        self.breakout.clone()
    }

    pub(crate) fn breakout_raised(&self) -> bool {
        self.breakout.is_raised()
    }

    /// Kills the guest.
    ///
    /// Killing a dead guest is a no-op: the first reason is kept.
    pub fn kill(&mut self, message: impl Into<String>) {
        self.die(message.into(), false);
    }

    /// Kills the guest, recording that it asked to be restarted.
    pub fn kill_for_restart(&mut self, message: impl Into<String>) {
        self.die(message.into(), true);
    }

    fn die(&mut self, message: String, restart: bool) {
        if self.dead.is_some() {
            return;
        }
        warn!("guest {}: killed: {}", self.id, message);
        self.pending_hcall = None;
        self.dead = Some(DeadReason { message, restart });
    }

    /// Marks the guest halted until an interrupt is delivered.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub(crate) fn wake(&mut self) {
        self.halted = false;
    }

    /// Queues a notification for the caller.
    pub fn notify(&mut self, notification: Notification) {
        self.pending_notify = Some(notification);
    }

    /// Get the backing memory of the guest.
    ///
    /// Reads through this bypass the `pfn_limit` check; prefer the accessors on [`Guest`].
    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub(crate) fn memory_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    /// Get the architecture-specific state of the guest.
    pub fn arch(&self) -> &A {
        &self.arch
    }

    /// Get the mutable architecture-specific state of the guest.
    pub fn arch_mut(&mut self) -> &mut A {
        &mut self.arch
    }
}
