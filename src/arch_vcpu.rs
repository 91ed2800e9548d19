use axerrno::AxResult;

use crate::exit::TrapReason;
use crate::memory::GuestPhysAddr;
use crate::switcher::SwitcherWindow;
use crate::GuestId;

/// Architecture-specific guest CPU trait definition.
///
/// This is the lower, hardware-specific layer beneath the run loop. It owns the guest's register
/// file and shadow page tables, and knows how to jump through the switcher trampoline. The
/// trampoline's machine code never crosses this boundary: the core only hands over the
/// [`SwitcherWindow`] it installed and gets a [`TrapReason`] back.
pub trait ArchGuest: Sized {
    /// Architecture-specific configuration for guest creation.
    type CreateConfig;

    /// Creates the architecture state of a new guest.
    fn new(id: GuestId, config: Self::CreateConfig) -> AxResult<Self>;

    /// Sets the guest entry point where execution will begin.
    fn set_entry(&mut self, entry: GuestPhysAddr) -> AxResult;

    /// Switches to the guest through the switcher and runs it until it traps.
    ///
    /// Called with host interrupts disabled. `reload` is true when the per-CPU switcher pages
    /// must be refreshed before entry: another guest (or none) ran on this CPU last, or this
    /// guest last ran on a different CPU and the pages here predate that run.
    fn run(&mut self, window: &SwitcherWindow, reload: bool) -> TrapReason;

    /// Arranges for `vector` to be raised in the guest on its next entry.
    ///
    /// Fails with `WouldBlock` if the guest cannot take the interrupt right now (for example
    /// because it has interrupts masked); the interrupt then stays pending.
    fn inject_interrupt(&mut self, vector: usize) -> AxResult;

    /// Sets the return value that will be delivered to the guest.
    fn set_return_value(&mut self, val: usize);

    /// Tries to resolve a guest page fault by populating the shadow page tables.
    ///
    /// Returns `false` if the fault is genuine and belongs to the guest.
    fn handle_page_fault(&mut self, addr: usize, error_code: usize) -> bool;

    /// Reflects a trap into the guest's own handler.
    ///
    /// Returns `false` if the guest has no usable handler for `vector`.
    fn reflect_trap(&mut self, vector: usize, error_code: Option<usize>) -> bool;
}
