use alloc::collections::BTreeSet;
use alloc::format;
use core::sync::atomic::{AtomicUsize, Ordering};

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::control::ControlHandle;
use crate::guest::{Guest, GuestConfig};
use crate::hal::GuestHal;
use crate::memory::GuestMemory;
use crate::switcher::{Switcher, SwitcherConfig, SwitcherWindow};
use crate::{ArchGuest, GuestId};

/// Structural state shared by every guest, only touched under [`Host::registry`].
struct Registry {
    switcher: Option<Switcher>,
    guests: BTreeSet<GuestId>,
}

/// The process-wide singleton: the installed switcher and the table of live guests.
///
/// Construct it once at bring-up with [`Host::init`] and pass it by reference to everything that
/// opens guests. The guard inside is taken only to install/uninstall the switcher and to insert
/// or remove guests; running a guest never touches it.
///
/// Recommended usage:
///
/// ```ignore
/// let host = Host::init(MyHal::new(), &SwitcherConfig { base, image, nr_cpus })?;
/// let mut handle = host.open::<MyArchGuest, _>(config, memory)?;
/// loop {
///     match handle.read(&mut devices, &mut vic) {
///         Ok([addr, key]) => devices.kick(addr, key),
///         Err(err) if err.is_retryable() => continue,
///         Err(_) => break,
///     }
/// }
/// drop(handle);
/// host.shutdown()?;
/// ```
pub struct Host<H: GuestHal> {
    hal: H,
    window: SwitcherWindow,
    next_id: AtomicUsize,
    registry: Mutex<Registry>,
}

impl<H: GuestHal> Host<H> {
    /// Installs the switcher. Failing here means there can be no guests at all.
    pub fn init(hal: H, config: &SwitcherConfig) -> AxResult<Self> {
        let switcher = Switcher::install(&hal, config)?;
        Ok(Self {
            hal,
            window: switcher.window(),
            next_id: AtomicUsize::new(1),
            registry: Mutex::new(Registry {
                switcher: Some(switcher),
                guests: BTreeSet::new(),
            }),
        })
    }

    /// Get the hardware abstraction layer.
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// The switcher window every guest is entered through.
    pub fn window(&self) -> SwitcherWindow {
        self.window
    }

    /// Whether the switcher is still installed.
    pub fn is_installed(&self) -> bool {
        self.registry.lock().switcher.is_some()
    }

    /// Number of guests currently open.
    pub fn guest_count(&self) -> usize {
        self.registry.lock().guests.len()
    }

    /// Creates a guest and registers it, returning the handle that owns it.
    pub fn open<A, M>(
        &self,
        config: GuestConfig<A::CreateConfig>,
        mem: M,
    ) -> AxResult<ControlHandle<'_, H, A, M>>
    where
        A: ArchGuest,
        M: GuestMemory,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guest = Guest::new(id, config, mem)?;

        let mut registry = self.registry.lock();
        if registry.switcher.is_none() {
            return ax_err!(BadState, "switcher is not installed");
        }
        registry.guests.insert(id);
        info!(
            "guest {}: opened ({} pages, {} guests)",
            id,
            guest.pfn_limit(),
            registry.guests.len()
        );
        drop(registry);

        Ok(ControlHandle::new(self, guest))
    }

    pub(crate) fn release(&self, id: GuestId) {
        let mut registry = self.registry.lock();
        if registry.guests.remove(&id) {
            info!("guest {}: closed ({} guests left)", id, registry.guests.len());
        }
    }

    /// Uninstalls the switcher once no guest remains.
    ///
    /// Fails with `ResourceBusy` while guests are open. Shutting down twice is a no-op.
    pub fn shutdown(&self) -> AxResult {
        let mut registry = self.registry.lock();
        if !registry.guests.is_empty() {
            return ax_err!(
                ResourceBusy,
                format!("{} guests still open", registry.guests.len())
            );
        }
        if let Some(switcher) = registry.switcher.take() {
            switcher.uninstall(&self.hal);
        }
        Ok(())
    }
}

impl<H: GuestHal> Drop for Host<H> {
    fn drop(&mut self) {
        if self.shutdown().is_err() {
            error!("host dropped with guests still registered, leaking the switcher");
        }
    }
}
