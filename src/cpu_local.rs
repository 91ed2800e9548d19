use crate::GuestId;

/// The id of the guest whose state was last loaded into this CPU's switcher pages.
///
/// `0` means none: guest ids start at 1.
#[percpu::def_percpu]
static LAST_ENTERED: GuestId = 0;

/// Records that guest `id` is about to be entered on the current physical CPU.
///
/// `last_cpu` is the guest's own half of the cache: the CPU it was last entered on. Returns
/// whether the per-CPU switcher pages must be reloaded, i.e. whether some other guest (or none
/// at all) ran here last, or this guest last ran somewhere else.
///
/// Must be called with local interrupts disabled, so the caller cannot migrate between the read
/// and the write.
pub(crate) fn enter_on_current_cpu(id: GuestId, last_cpu: &mut Option<usize>) -> bool {
    // SAFETY: local interrupts are disabled by the caller, so nothing else on this CPU touches
    // the slot between the read and the write.
    unsafe {
        let cpu = LAST_ENTERED.current_ptr() as usize;
        record_entry(LAST_ENTERED.current_ref_mut_raw(), cpu, id, last_cpu)
    }
}

/// Forgets guest `id` if it was the last one entered on the current physical CPU.
pub(crate) fn forget_on_current_cpu(id: GuestId) {
    // SAFETY: single word written by the thread that owns the guest.
    unsafe {
        let last = LAST_ENTERED.current_ref_mut_raw();
        if *last == id {
            *last = 0;
        }
    }
}

/// `slot` is the per-CPU half for CPU `cpu`, identified by the address of its slot.
fn record_entry(
    slot: &mut GuestId,
    cpu: usize,
    id: GuestId,
    last_cpu: &mut Option<usize>,
) -> bool {
    let reload = *slot != id || *last_cpu != Some(cpu);
    *slot = id;
    *last_cpu = Some(cpu);
    reload
}
