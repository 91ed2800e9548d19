//! The switcher: a small trampoline mapped at the same virtual address in the host and in every
//! guest, through which control passes in both directions.
//!
//! Layout of the window, one page per slot:
//!
//! ```text
//! base ─► ┌───────────────────────┐
//!         │ text (trampoline)     │  text_pages
//!         ├───────────────────────┤
//!         │ cpu 0: register page  │
//!         │ cpu 0: state page     │
//!         ├───────────────────────┤
//!         │ ...                   │  2 * nr_cpus
//!         └───────────────────────┘
//! ```

use alloc::vec::Vec;
use core::ptr;

use axerrno::{ax_err, AxResult};
use memory_addr::{is_aligned_4k, PAGE_SIZE_4K};

use crate::hal::{GuestHal, HostPhysAddr, HostVirtAddr};

/// Where and what to install.
#[derive(Debug, Clone, Copy)]
pub struct SwitcherConfig {
    /// Fixed virtual address of the window, identical in host and guests.
    pub base: HostVirtAddr,
    /// Precompiled trampoline image copied into the text pages.
    pub image: &'static [u8],
    /// Number of physical CPUs which may enter guests; each gets a register and a state page.
    pub nr_cpus: usize,
}

/// A copyable description of an installed window, handed to [`ArchGuest::run`].
///
/// [`ArchGuest::run`]: crate::ArchGuest::run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitcherWindow {
    base: HostVirtAddr,
    text_pages: usize,
    nr_cpus: usize,
}

impl SwitcherWindow {
    /// The fixed base address of the window.
    pub const fn base(&self) -> HostVirtAddr {
        self.base
    }

    /// Number of pages holding trampoline text.
    pub const fn text_pages(&self) -> usize {
        self.text_pages
    }

    /// Number of CPUs the window has per-CPU pages for.
    pub const fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Total size of the window in pages.
    pub const fn num_pages(&self) -> usize {
        self.text_pages + 2 * self.nr_cpus
    }

    /// The register page and the state page of `cpu`, or `None` if `cpu` is out of range.
    pub fn percpu_pages(&self, cpu: usize) -> Option<(HostVirtAddr, HostVirtAddr)> {
        if cpu >= self.nr_cpus {
            return None;
        }
        let regs = self.base + (self.text_pages + 2 * cpu) * PAGE_SIZE_4K;
        Some((regs, regs + PAGE_SIZE_4K))
    }
}

/// The installed switcher: the window plus the frames that back it.
///
/// Must be given back with [`Switcher::uninstall`]; dropping it leaks the frames and leaves the
/// window mapped.
#[derive(Debug)]
pub struct Switcher {
    window: SwitcherWindow,
    frames: Vec<HostPhysAddr>,
}

impl Switcher {
    /// Allocates and zeroes the backing frames, binds them at `config.base` and copies the
    /// trampoline in.
    ///
    /// On any failure every frame acquired so far is returned to `hal` before the error is.
    pub fn install<H: GuestHal>(hal: &H, config: &SwitcherConfig) -> AxResult<Self> {
        if config.image.is_empty() {
            return ax_err!(InvalidInput, "empty switcher image");
        }
        if !is_aligned_4k(config.base.as_usize()) {
            return ax_err!(InvalidInput, "switcher base is not page aligned");
        }
        if config.nr_cpus == 0 {
            return ax_err!(InvalidInput, "switcher needs at least one cpu");
        }

        let text_pages = config.image.len().div_ceil(PAGE_SIZE_4K);
        let fits = config
            .nr_cpus
            .checked_mul(2)
            .and_then(|pages| pages.checked_add(text_pages))
            .and_then(|pages| pages.checked_mul(PAGE_SIZE_4K))
            .and_then(|bytes| config.base.as_usize().checked_add(bytes))
            .is_some();
        if !fits {
            return ax_err!(InvalidInput, "switcher window does not fit the address space");
        }

        let window = SwitcherWindow {
            base: config.base,
            text_pages,
            nr_cpus: config.nr_cpus,
        };
        let num_pages = window.num_pages();

        let mut frames = Vec::new();
        if frames.try_reserve_exact(num_pages).is_err() {
            return ax_err!(NoMemory, "switcher frame table allocation failed");
        }
        for i in 0..num_pages {
            let Some(frame) = hal.alloc_frame() else {
                error!(
                    "switcher: out of memory at frame {} of {}",
                    i + 1,
                    num_pages
                );
                release_frames(hal, &frames);
                return ax_err!(NoMemory, "switcher frame allocation failed");
            };
            // The guest can read every one of these pages, so no stale host data may survive.
            // SAFETY: `frame` was just handed to us and `phys_to_virt` maps it writable.
            unsafe { ptr::write_bytes(hal.phys_to_virt(frame).as_mut_ptr(), 0, PAGE_SIZE_4K) };
            frames.push(frame);
        }

        if let Err(err) = hal.map_switcher(window.base, &frames) {
            error!("switcher: cannot bind window at {:?}: {:?}", window.base, err);
            release_frames(hal, &frames);
            return Err(err);
        }

        for (chunk, &frame) in config.image.chunks(PAGE_SIZE_4K).zip(&frames) {
            // SAFETY: each chunk is at most one page and the frame is a whole page we own.
            unsafe {
                ptr::copy_nonoverlapping(
                    chunk.as_ptr(),
                    hal.phys_to_virt(frame).as_mut_ptr(),
                    chunk.len(),
                )
            };
        }

        info!(
            "switcher: installed {} pages at {:?} ({} text, {} cpus)",
            num_pages, window.base, window.text_pages, window.nr_cpus
        );
        Ok(Self { window, frames })
    }

    /// Unbinds the window and frees every frame.
    ///
    /// The caller guarantees that no guest is in the middle of a switch.
    pub fn uninstall<H: GuestHal>(self, hal: &H) {
        hal.unmap_switcher(self.window.base, self.frames.len());
        release_frames(hal, &self.frames);
        info!("switcher: uninstalled from {:?}", self.window.base);
    }

    /// The window descriptor.
    pub const fn window(&self) -> SwitcherWindow {
        self.window
    }

    /// The frames backing the window, in page order.
    pub fn frames(&self) -> &[HostPhysAddr] {
        &self.frames
    }
}

fn release_frames<H: GuestHal>(hal: &H, frames: &[HostPhysAddr]) {
    for &frame in frames {
        hal.dealloc_frame(frame);
    }
}
