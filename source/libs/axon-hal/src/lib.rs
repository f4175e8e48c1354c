// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Boundary traits the paravirtual I/O core consumes
//! OWNERS: @runtime
//! PUBLIC API: Hypercall, PageAllocator, Translate, barrier::{wmb, rmb, mb}
//!
//! The core never talks to the hypervisor or the page pool directly;
//! everything goes through these seams so host tests can substitute
//! stubs, the same way drivers stub `Bus` elsewhere in the tree.

use core::ptr::NonNull;

use axon_abi::{DomId, Frame, GrantRef, MapHandle, Port, Status};

/// Synchronous hypercall boundary.
///
/// Each method marshals one sub-operation of the grant-table or
/// event-channel hypercall. Zero status is success; a negative status is
/// surfaced as `Err` and never swallowed. Calls may block the vcpu for
/// the duration of the hypercall, nothing more.
pub trait Hypercall {
    /// Registers `frames` pages of grant-table entries with the hypervisor.
    fn grant_setup_table(&self, frames: u32) -> Result<(), Status>;

    /// Maps `gref` of domain `peer` at `host_addr` in the caller's
    /// address space, returning the handle needed to unmap.
    fn grant_map(
        &self,
        host_addr: u64,
        peer: DomId,
        gref: GrantRef,
        writable: bool,
    ) -> Result<MapHandle, Status>;

    /// Releases the mapping previously established at `host_addr`.
    fn grant_unmap(&self, host_addr: u64, handle: MapHandle) -> Result<(), Status>;

    /// Completes the guest side of a page transfer: donates `frame`
    /// into `gref` of domain `peer`.
    fn grant_transfer(&self, peer: DomId, gref: GrantRef, frame: Frame) -> Result<(), Status>;

    /// Allocates a fresh port that `peer` may later bind to.
    fn evtchn_alloc_unbound(&self, peer: DomId) -> Result<Port, Status>;

    /// Binds to `remote_port`, a port `peer` has already allocated.
    fn evtchn_bind_interdomain(&self, peer: DomId, remote_port: Port) -> Result<Port, Status>;

    /// Binds virtual IRQ `virq` to a fresh port on the calling vcpu.
    fn evtchn_bind_virq(&self, virq: u32) -> Result<Port, Status>;

    /// Binds physical IRQ `pirq` to a fresh port.
    fn evtchn_bind_pirq(&self, pirq: u32, shareable: bool) -> Result<Port, Status>;

    /// Closes `port` at the hypervisor.
    fn evtchn_close(&self, port: Port) -> Result<(), Status>;

    /// Signals the peer end of `port`.
    fn evtchn_send(&self, port: Port) -> Result<(), Status>;

    /// Sets the port's mask bit in the shared-info page. Never faults.
    fn mask_event(&self, port: Port);

    /// Clears the port's mask bit.
    fn unmask_event(&self, port: Port);

    /// Clears the port's latched pending bit.
    fn clear_pending(&self, port: Port);
}

/// Page-granular allocator boundary.
///
/// Pages are `axon_abi::PAGE_SIZE` bytes, page-aligned and zeroed.
/// Exhaustion panics; this core does not handle allocator failure.
pub trait PageAllocator {
    /// Allocates one zeroed page.
    fn alloc_page(&self) -> NonNull<u8>;

    /// Returns a page to the pool.
    ///
    /// # Safety
    /// `page` must have come from `alloc_page` on this allocator and
    /// must not be referenced afterwards.
    unsafe fn free_page(&self, page: NonNull<u8>);
}

/// Virtual-to-frame translation boundary.
///
/// Grants name machine frames, drivers hold virtual addresses; the
/// platform layer owns the mapping between the two.
pub trait Translate {
    /// Machine frame backing the page that contains `addr`.
    fn frame_of(&self, addr: NonNull<u8>) -> Frame;
}

/// Memory barriers for the cross-domain handoff protocol.
///
/// Every index or flag publication follows "write payload, `wmb`, write
/// index"; every consumption follows "read index, `rmb`, read payload".
/// No OS memory model spans the isolation boundary, so this discipline
/// is the whole correctness story.
pub mod barrier {
    use core::sync::atomic::{fence, Ordering};

    /// Orders all prior writes before all later writes.
    #[inline]
    pub fn wmb() {
        fence(Ordering::Release);
    }

    /// Orders all prior reads before all later reads.
    #[inline]
    pub fn rmb() {
        fence(Ordering::Acquire);
    }

    /// Full fence.
    #[inline]
    pub fn mb() {
        fence(Ordering::SeqCst);
    }
}
