use crate::GuestId;

/// The virtual interrupt controller of a guest, polled once per run-loop iteration.
///
/// Virtual timers live behind this interface too: a timer expiry simply makes an interrupt
/// pending, which is what wakes a halted guest.
pub trait InterruptController {
    /// The interrupt that should be delivered to `guest` next, if any.
    fn pending(&mut self, guest: GuestId) -> Option<usize>;

    /// Marks `vector` as handed to the guest, so it is not reported as pending again.
    fn arm(&mut self, guest: GuestId, vector: usize);
}

/// A controller that never has anything pending.
impl InterruptController for () {
    fn pending(&mut self, _guest: GuestId) -> Option<usize> {
        None
    }

    fn arm(&mut self, _guest: GuestId, _vector: usize) {}
}
