// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxGuest - control-plane core for running a cooperatively scheduled guest inside a host.
//!
//! One host thread drives one guest through a run loop. The guest is entered through a small
//! trampoline (the *switcher*) mapped at the same fixed address in the host and in every guest,
//! and comes back whenever it traps. Everything the guest hands to the host by address is checked
//! against its memory ceiling before the host touches it.
//!
//! # Features
//!
//! - Switcher installation with full rollback on allocation failure
//! - Fail-closed guest memory accessors (a guest crossing its boundary is killed)
//! - Run-loop state machine (Running → Halted → Dead) multiplexing hypercalls, virtual
//!   interrupts and notifications
//! - Asynchronous hypercall ring shared with the guest
//! - Process-wide host singleton with a guest table gating switcher teardown
//!
//! Architecture specifics (register state, shadow page tables, the trampoline itself) are
//! supplied through [`ArchGuest`]; host services through [`GuestHal`].
//!
//! The per-CPU cache used by the run loop relies on the `percpu` crate, so the host must
//! initialize per-CPU areas (`percpu::init`) before entering any guest.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

// Core modules
mod arch_vcpu; // Architecture-specific guest trait definition
mod control; // Control handle front end
mod cpu_local; // Per-CPU "last entered guest" cache
mod exit; // Trap reasons
mod guest; // Guest instance and its state
mod hal; // Hardware abstraction layer interfaces
mod host; // Process-wide singleton: switcher and guest table
mod irq; // Interrupt controller interface
mod memory; // Guest memory accessor
mod run; // Run loop
mod switcher; // Switcher installation

pub mod hypercall;

/// Identifier of a guest, unique for the lifetime of a [`Host`]. Never 0.
pub type GuestId = usize;

// Public API exports
pub use arch_vcpu::ArchGuest;
pub use control::ControlHandle;
pub use exit::{TrapReason, PAGE_FAULT_VECTOR};
pub use guest::{BreakoutHandle, DeadReason, Guest, GuestConfig, GuestState, Notification};
pub use hal::{GuestHal, HostPhysAddr, HostVirtAddr};
pub use host::Host;
pub use hypercall::{Hypercall, HypercallHandler};
pub use irq::InterruptController;
pub use memory::{
    address_is_valid, AccessFault, GuestMemory, GuestPhysAddr, HostMappedMemory, PAGE_SIZE,
};
pub use run::RunError;
pub use switcher::{Switcher, SwitcherConfig, SwitcherWindow};
