//! Every byte moving between the host and a guest goes through this module.
//!
//! A guest supplies addresses freely, so nothing here trusts them: each access is checked against
//! the guest's `pfn_limit` first, and any violation (or a failing copy underneath) kills the guest
//! on the spot. There is no partial recovery for a guest that crosses the boundary.

use core::fmt;
use core::ptr;

use alloc::format;
use axerrno::{ax_err, AxResult};
use memory_addr::{def_usize_addr, def_usize_addr_formatter, PAGE_SIZE_4K};

use crate::arch_vcpu::ArchGuest;
use crate::guest::Guest;
use crate::hal::HostVirtAddr;

/// Granularity of `pfn_limit`.
pub const PAGE_SIZE: usize = PAGE_SIZE_4K;

def_usize_addr! {
    /// Guest physical address, as seen by the guest.
    pub type GuestPhysAddr;
}

def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}

/// Whether `[addr, addr + len)` lies inside a guest with `pfn_limit` pages.
///
/// `addr + len` must not overflow and must fall on a page strictly below `pfn_limit`.
pub const fn address_is_valid(pfn_limit: usize, addr: usize, len: usize) -> bool {
    match addr.checked_add(len) {
        Some(end) => end / PAGE_SIZE < pfn_limit,
        None => false,
    }
}

/// Why a guest memory access was refused. Either one is fatal to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    /// The range overflowed or reached past `pfn_limit`.
    OutOfRange {
        /// Start of the requested range.
        addr: usize,
        /// Length of the requested range.
        len: usize,
    },
    /// The range was valid but the copy itself failed, e.g. the backing page went away.
    CopyFault {
        /// Start of the requested range.
        addr: usize,
        /// Length of the requested range.
        len: usize,
    },
}

impl fmt::Display for AccessFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { addr, len } => {
                write!(f, "bad address {:#x} len {}", addr, len)
            }
            Self::CopyFault { addr, len } => {
                write!(f, "copy fault at {:#x} len {}", addr, len)
            }
        }
    }
}

/// Host-side view of a guest's RAM.
///
/// Offsets are guest physical addresses. Implementations report a failing copy with an error;
/// they never need to check `pfn_limit`, the accessor has done that already.
pub trait GuestMemory {
    /// Size of the backing in bytes.
    fn size(&self) -> usize;

    /// Copies `buf.len()` bytes starting at `offset` out of guest memory.
    fn copy_from_guest(&self, offset: usize, buf: &mut [u8]) -> AxResult;

    /// Copies `data` into guest memory starting at `offset`.
    fn copy_to_guest(&mut self, offset: usize, data: &[u8]) -> AxResult;
}

/// Guest RAM mapped contiguously into the host address space.
#[derive(Debug)]
pub struct HostMappedMemory {
    base: HostVirtAddr,
    size: usize,
}

impl HostMappedMemory {
    /// Wraps the host mapping `[base, base + size)`.
    ///
    /// # Safety
    ///
    /// The range must stay mapped, readable and writable for as long as this value exists, and
    /// must not alias memory the host uses for anything else.
    pub const unsafe fn new(base: HostVirtAddr, size: usize) -> Self {
        Self { base, size }
    }

    /// The host address guest physical address 0 is mapped at.
    pub const fn base(&self) -> HostVirtAddr {
        self.base
    }

    fn check(&self, offset: usize, len: usize) -> AxResult {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => ax_err!(BadAddress, "access beyond guest mapping"),
        }
    }
}

impl GuestMemory for HostMappedMemory {
    fn size(&self) -> usize {
        self.size
    }

    fn copy_from_guest(&self, offset: usize, buf: &mut [u8]) -> AxResult {
        self.check(offset, buf.len())?;
        // SAFETY: in range of the mapping guaranteed by `new`.
        unsafe {
            ptr::copy_nonoverlapping(
                (self.base + offset).as_ptr(),
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
        Ok(())
    }

    fn copy_to_guest(&mut self, offset: usize, data: &[u8]) -> AxResult {
        self.check(offset, data.len())?;
        // SAFETY: in range of the mapping guaranteed by `new`.
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.base + offset).as_mut_ptr(),
                data.len(),
            )
        };
        Ok(())
    }
}

impl<A: ArchGuest, M: GuestMemory> Guest<A, M> {
    /// Whether `[addr, addr + len)` is inside this guest's memory.
    pub fn address_is_valid(&self, addr: GuestPhysAddr, len: usize) -> bool {
        address_is_valid(self.pfn_limit(), addr.as_usize(), len)
    }

    /// Reads `buf.len()` bytes at `addr`.
    ///
    /// On failure `buf` is zeroed and the guest is dead.
    pub fn read_bytes(&mut self, addr: GuestPhysAddr, buf: &mut [u8]) -> Result<(), AccessFault> {
        let (addr, len) = (addr.as_usize(), buf.len());
        let fault = if !address_is_valid(self.pfn_limit(), addr, len) {
            AccessFault::OutOfRange { addr, len }
        } else if self.memory().copy_from_guest(addr, buf).is_err() {
            AccessFault::CopyFault { addr, len }
        } else {
            return Ok(());
        };
        buf.fill(0);
        self.kill(format!("{}", fault));
        Err(fault)
    }

    /// Writes `data` at `addr`.
    ///
    /// Nothing is written if the range is out of bounds. On failure the guest is dead.
    pub fn write_bytes(&mut self, addr: GuestPhysAddr, data: &[u8]) -> Result<(), AccessFault> {
        let (addr, len) = (addr.as_usize(), data.len());
        let fault = if !address_is_valid(self.pfn_limit(), addr, len) {
            AccessFault::OutOfRange { addr, len }
        } else if self.memory_mut().copy_to_guest(addr, data).is_err() {
            AccessFault::CopyFault { addr, len }
        } else {
            return Ok(());
        };
        self.kill(format!("{}", fault));
        Err(fault)
    }

    /// Reads a native-endian `u32` at `addr`.
    ///
    /// Callers that want the conventional placeholder for a failed read use
    /// `unwrap_or_default()`, which gives `0`; the guest is dead by then either way.
    pub fn read_u32(&mut self, addr: GuestPhysAddr) -> Result<u32, AccessFault> {
        let mut bytes = [0u8; 4];
        self.read_bytes(addr, &mut bytes)?;
        Ok(u32::from_ne_bytes(bytes))
    }

    /// Writes a native-endian `u32` at `addr`.
    pub fn write_u32(&mut self, addr: GuestPhysAddr, value: u32) -> Result<(), AccessFault> {
        self.write_bytes(addr, &value.to_ne_bytes())
    }
}
