//! Hypercalls: requests a guest makes of the host.
//!
//! A guest issues a hypercall synchronously by trapping into the host, or batches several into
//! an asynchronous ring in its own memory which the host drains whenever the guest traps with
//! any hypercall. The handful of calls that steer the run loop itself are handled here; every
//! other number is forwarded to an external [`HypercallHandler`].

use alloc::format;
use alloc::string::String;

use axerrno::{AxError, AxResult};

use crate::guest::{Guest, Notification};
use crate::memory::{address_is_valid, GuestMemory, GuestPhysAddr, PAGE_SIZE};
use crate::ArchGuest;

/// Hypercall numbers understood by the core.
pub mod nr {
    /// Drain the asynchronous ring and do nothing else.
    pub const FLUSH_ASYNC: usize = 0;
    /// Register the asynchronous ring: `(shared)`.
    pub const INIT: usize = 1;
    /// Stop the guest: `(message, mode)`.
    pub const SHUTDOWN: usize = 2;
    /// Sleep until the next interrupt.
    pub const HALT: usize = 10;
    /// Notify the controlling caller: `(addr, key)`.
    pub const NOTIFY: usize = 17;
}

/// `mode` argument of [`nr::SHUTDOWN`] asking to be restarted instead of powered off.
pub const SHUTDOWN_RESTART: usize = 1;

/// Longest shutdown message read from the guest.
pub const SHUTDOWN_MSG_MAX: usize = 128;

/// Number of slots in the asynchronous ring.
pub const RING_SLOTS: usize = 64;
/// Status of a slot with nothing in it (or already processed).
pub const SLOT_EMPTY: u8 = 0xFF;
/// Status of a slot the guest has filled in.
pub const SLOT_READY: u8 = 0;

const RING_ENTRY_WORDS: usize = 5;
const RING_ENTRY_BYTES: usize = RING_ENTRY_WORDS * 4;

/// Size of the asynchronous ring: the status bytes, then the `[nr, a0, a1, a2, a3]` entries of
/// native-endian `u32`.
pub const RING_BYTES: usize = RING_SLOTS * (1 + RING_ENTRY_BYTES);

/// A decoded hypercall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypercall {
    /// [`nr::FLUSH_ASYNC`].
    FlushAsync,
    /// [`nr::INIT`].
    Init {
        /// Guest address of the asynchronous ring.
        shared: usize,
    },
    /// [`nr::SHUTDOWN`].
    Shutdown {
        /// Guest address of a NUL-terminated message.
        message: usize,
        /// Whether the guest wants to be restarted.
        restart: bool,
    },
    /// [`nr::HALT`].
    Halt,
    /// [`nr::NOTIFY`].
    Notify {
        /// Guest address the notification refers to.
        addr: usize,
        /// Caller-defined key.
        key: usize,
    },
    /// Anything else, left to the external handler.
    Other {
        /// The hypercall number.
        nr: usize,
        /// The arguments for the hypercall.
        args: [usize; 4],
    },
}

impl Hypercall {
    /// Decodes a raw hypercall.
    pub const fn decode(nr: usize, args: [usize; 4]) -> Self {
        match nr {
            nr::FLUSH_ASYNC => Self::FlushAsync,
            nr::INIT => Self::Init { shared: args[0] },
            nr::SHUTDOWN => Self::Shutdown {
                message: args[0],
                restart: args[1] == SHUTDOWN_RESTART,
            },
            nr::HALT => Self::Halt,
            nr::NOTIFY => Self::Notify {
                addr: args[0],
                key: args[1],
            },
            _ => Self::Other { nr, args },
        }
    }
}

/// The external hypercall dispatcher: device emulation and everything else the core does not
/// know about.
pub trait HypercallHandler<A: ArchGuest, M: GuestMemory> {
    /// Executes `call` (always [`Hypercall::Other`]) on behalf of `guest`.
    ///
    /// `Ok` carries the value returned to the guest. `Err(Unsupported)` marks an unknown number;
    /// any error kills the guest. The handler may also kill the guest itself.
    fn handle(&mut self, guest: &mut Guest<A, M>, call: &Hypercall) -> AxResult<usize>;
}

/// A dispatcher that knows no hypercalls beyond the core ones.
impl<A: ArchGuest, M: GuestMemory> HypercallHandler<A, M> for () {
    fn handle(&mut self, _guest: &mut Guest<A, M>, _call: &Hypercall) -> AxResult<usize> {
        Err(AxError::Unsupported)
    }
}

/// Registration of a guest's asynchronous ring.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HypercallRing {
    base: usize,
    next: usize,
}

impl HypercallRing {
    fn status_addr(&self) -> GuestPhysAddr {
        GuestPhysAddr::from(self.base + self.next)
    }

    fn entry_addr(&self) -> GuestPhysAddr {
        GuestPhysAddr::from(self.base + RING_SLOTS + self.next * RING_ENTRY_BYTES)
    }
}

impl<A: ArchGuest, M: GuestMemory> Guest<A, M> {
    /// Executes the pending synchronous hypercall, draining the asynchronous ring first.
    ///
    /// If a notification is raised before the synchronous call gets its turn, the call stays
    /// pending so the caller sees the notification first.
    pub(crate) fn do_hypercalls<D: HypercallHandler<A, M>>(&mut self, handler: &mut D) {
        let Some(call) = self.pending_hcall.take() else {
            return;
        };
        self.do_async_hypercalls(handler);
        if self.is_dead() {
            return;
        }
        if self.pending_notify.is_some() {
            self.pending_hcall = Some(call);
            return;
        }
        if let Some(ret) = self.dispatch(handler, call) {
            self.arch_mut().set_return_value(ret);
        }
    }

    fn do_async_hypercalls<D: HypercallHandler<A, M>>(&mut self, handler: &mut D) {
        for _ in 0..RING_SLOTS {
            let Some(mut ring) = self.ring else {
                return;
            };
            let mut status = [0u8];
            if self.read_bytes(ring.status_addr(), &mut status).is_err() {
                return;
            }
            if status[0] == SLOT_EMPTY {
                break;
            }

            let mut raw = [0u8; RING_ENTRY_BYTES];
            if self.read_bytes(ring.entry_addr(), &mut raw).is_err() {
                return;
            }
            if self.write_bytes(ring.status_addr(), &[SLOT_EMPTY]).is_err() {
                return;
            }
            ring.next = (ring.next + 1) % RING_SLOTS;
            self.ring = Some(ring);

            let mut words = [0usize; RING_ENTRY_WORDS];
            for (word, bytes) in words.iter_mut().zip(raw.chunks_exact(4)) {
                *word = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
            }
            let call = Hypercall::decode(words[0], [words[1], words[2], words[3], words[4]]);
            // Asynchronous calls have nobody to return a value to.
            let _ = self.dispatch(handler, call);

            if self.is_dead() || self.pending_notify.is_some() {
                break;
            }
        }
    }

    fn dispatch<D: HypercallHandler<A, M>>(
        &mut self,
        handler: &mut D,
        call: Hypercall,
    ) -> Option<usize> {
        debug!("guest {}: hypercall {:?}", self.id(), call);
        match call {
            Hypercall::FlushAsync => {}
            Hypercall::Init { shared } => self.register_ring(shared),
            Hypercall::Shutdown { message, restart } => self.shutdown(message, restart),
            Hypercall::Halt => self.halt(),
            Hypercall::Notify { addr, key } => self.notify(Notification { addr, key }),
            Hypercall::Other { nr, .. } => match handler.handle(self, &call) {
                Ok(ret) => return Some(ret),
                Err(AxError::Unsupported) => self.kill(format!("bad hypercall {}", nr)),
                Err(err) => self.kill(format!("hypercall {} failed: {:?}", nr, err)),
            },
        }
        None
    }

    fn register_ring(&mut self, shared: usize) {
        if self.ring.is_some() {
            self.kill("hypercall ring registered twice");
        } else if !address_is_valid(self.pfn_limit(), shared, RING_BYTES) {
            self.kill(format!("bad hypercall ring address {:#x}", shared));
        } else {
            self.ring = Some(HypercallRing {
                base: shared,
                next: 0,
            });
        }
    }

    fn shutdown(&mut self, message: usize, restart: bool) {
        // `pfn_limit` is non-zero and its byte size fits in `usize`, checked at creation.
        let last_byte = self.pfn_limit() * PAGE_SIZE - 1;
        let mut buf = [0u8; SHUTDOWN_MSG_MAX];
        let len = last_byte.saturating_sub(message).min(SHUTDOWN_MSG_MAX);
        if self
            .read_bytes(GuestPhysAddr::from(message), &mut buf[..len])
            .is_err()
        {
            return;
        }
        let end = buf[..len].iter().position(|&b| b == 0).unwrap_or(len);
        let text = String::from_utf8_lossy(&buf[..end]);
        let reason = format!("shutdown: {}", text);
        if restart {
            self.kill_for_restart(reason);
        } else {
            self.kill(reason);
        }
    }
}
