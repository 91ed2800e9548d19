use axerrno::AxResult;
use memory_addr::{PhysAddr, VirtAddr};

/// Host physical address.
pub type HostPhysAddr = PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = VirtAddr;

/// The interfaces which the underlying host (kernel or hypervisor process) must implement.
///
/// Every method takes `&self`: a single HAL instance is owned by the [`Host`](crate::Host)
/// singleton and shared by all guests it runs.
pub trait GuestHal {
    /// Allocates one physical page frame.
    ///
    /// The content of the frame is unspecified; callers zero it before exposing it to a guest.
    ///
    /// # Returns
    ///
    /// * `Option<HostPhysAddr>` - The physical address of the frame, or `None` if out of memory.
    fn alloc_frame(&self) -> Option<HostPhysAddr>;

    /// Returns a frame obtained from [`GuestHal::alloc_frame`].
    fn dealloc_frame(&self, paddr: HostPhysAddr);

    /// Converts a host physical address to a host virtual address the core may write through.
    fn phys_to_virt(&self, paddr: HostPhysAddr) -> HostVirtAddr;

    /// Reserves the virtual region starting at `base` and binds `frames` to it, one page each.
    fn map_switcher(&self, base: HostVirtAddr, frames: &[HostPhysAddr]) -> AxResult;

    /// Releases the binding created by [`GuestHal::map_switcher`].
    fn unmap_switcher(&self, base: HostVirtAddr, num_pages: usize);

    /// Disables interrupt delivery on the current physical CPU.
    fn local_irq_disable(&self);

    /// Re-enables interrupt delivery on the current physical CPU.
    fn local_irq_enable(&self);

    /// Whether the calling thread has a signal waiting to be handled.
    fn signal_pending(&self) -> bool {
        false
    }

    /// Blocks the calling thread until a virtual timer or an external waker fires.
    fn wait_for_wakeup(&self);
}
