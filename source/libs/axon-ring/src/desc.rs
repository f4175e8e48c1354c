// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

//! Front-end view of a descriptor ring: fixed-size request/response
//! slots after a 64-byte index header, capacity a power of two.
//!
//! The private producer/consumer indices live here; only their shared
//! twins in the page header are visible to the peer. Publishing an
//! index is the commit point, so every slot write happens before the
//! producer store and every slot read happens after the producer load.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use axon_abi::{RingHeader, PAGE_SIZE, RING_HEADER_SIZE};
use axon_hal::barrier;

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Front-end (request producer) half of a descriptor ring.
///
/// `Req` and `Resp` are the wire slot types; a slot is sized for the
/// larger of the two so both sides agree on the stride.
pub struct FrontRing<Req: Copy, Resp: Copy> {
    header: NonNull<RingHeader>,
    slots: NonNull<u8>,
    req_prod_pvt: u32,
    rsp_cons: u32,
    _marker: PhantomData<(Req, Resp)>,
}

impl<Req: Copy, Resp: Copy> FrontRing<Req, Resp> {
    const SLOT_SIZE: usize = {
        let size = max(size_of::<Req>(), size_of::<Resp>());
        let align = max(align_of::<Req>(), align_of::<Resp>());
        (size + align - 1) / align * align
    };

    /// Slot count: the largest power of two that fits the page after
    /// the header. Both sides compute the same value.
    pub const CAPACITY: usize = {
        let raw = (PAGE_SIZE - RING_HEADER_SIZE) / Self::SLOT_SIZE;
        assert!(raw >= 1);
        1 << (usize::BITS - 1 - raw.leading_zeros())
    };

    const MASK: u32 = (Self::CAPACITY - 1) as u32;

    /// Takes over a fresh shared page: zeroes it and arms both event
    /// thresholds so the very first push and response notify.
    ///
    /// # Safety
    ///
    /// `page` must point to `PAGE_SIZE` bytes, page-aligned, valid and
    /// shared with the peer for the lifetime of the ring, and not
    /// aliased by any Rust reference.
    pub unsafe fn init(page: NonNull<u8>) -> Self {
        core::ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE);
        let ring = Self::attach(page);
        let header = ring.header();
        header.req_event.store(1, Ordering::Relaxed);
        header.rsp_event.store(1, Ordering::Relaxed);
        ring
    }

    /// Wraps an already-initialized shared page, picking the private
    /// indices up from the shared ones (resume path).
    ///
    /// # Safety
    ///
    /// Same contract as [`FrontRing::init`], and the page must already
    /// hold a valid ring state.
    pub unsafe fn attach(page: NonNull<u8>) -> Self {
        let header = page.cast::<RingHeader>();
        let slots = NonNull::new_unchecked(page.as_ptr().add(RING_HEADER_SIZE));
        let req_prod_pvt = header.as_ref().req_prod.load(Ordering::Relaxed);
        let rsp_cons = header.as_ref().rsp_prod.load(Ordering::Relaxed);
        Self { header, slots, req_prod_pvt, rsp_cons, _marker: PhantomData }
    }

    fn header(&self) -> &RingHeader {
        // The header is all atomics; shared access with the peer is the
        // point of the type.
        unsafe { self.header.as_ref() }
    }

    fn slot_ptr(&self, idx: u32) -> *mut u8 {
        let offset = (idx & Self::MASK) as usize * Self::SLOT_SIZE;
        unsafe { self.slots.as_ptr().add(offset) }
    }

    pub fn capacity(&self) -> usize {
        Self::CAPACITY
    }

    /// Next unpublished request index; fill slots from here.
    pub fn req_prod_pvt(&self) -> u32 {
        self.req_prod_pvt
    }

    /// Next unconsumed response index.
    pub fn rsp_cons(&self) -> u32 {
        self.rsp_cons
    }

    /// In-place access to the request slot at `idx`. The slot is not
    /// visible to the peer until a later `push_requests` covers it.
    pub fn request_slot(&mut self, idx: u32) -> &mut Req {
        debug_assert!(idx.wrapping_sub(self.rsp_cons) < Self::CAPACITY as u32 + 1);
        unsafe { &mut *self.slot_ptr(idx).cast::<Req>() }
    }

    /// Copies the response at `idx` out of the shared page. Only call
    /// for indices below the producer seen by
    /// [`FrontRing::has_unconsumed_responses`].
    pub fn response(&self, idx: u32) -> Resp {
        unsafe { self.slot_ptr(idx).cast::<Resp>().read() }
    }

    /// Publishes `n` filled requests. Returns true when the peer's
    /// event threshold was crossed and it must be notified; the caller
    /// owns the event-channel send.
    pub fn push_requests(&mut self, n: u32) -> bool {
        self.req_prod_pvt = self.req_prod_pvt.wrapping_add(n);
        let new = self.req_prod_pvt;
        let header = self.header();
        let old = header.req_prod.load(Ordering::Relaxed);
        // Slot payloads must be visible before the index that covers them.
        barrier::wmb();
        header.req_prod.store(new, Ordering::Relaxed);
        // The index store must be visible before req_event is read, or
        // both sides can decide the other will act and neither does.
        barrier::mb();
        let event = header.req_event.load(Ordering::Relaxed);
        new.wrapping_sub(event) < new.wrapping_sub(old)
    }

    /// True when the peer has published responses not yet acked here.
    pub fn has_unconsumed_responses(&self) -> bool {
        let prod = self.header().rsp_prod.load(Ordering::Relaxed);
        barrier::rmb();
        prod.wrapping_sub(self.rsp_cons) != 0
    }

    /// Acknowledges `n` consumed responses and re-arms the response
    /// event threshold. Returns true when more responses arrived in the
    /// window between the caller's poll and the re-arm; the caller must
    /// loop rather than sleep, as there is no lock to close that race.
    pub fn ack_responses(&mut self, n: u32) -> bool {
        self.rsp_cons = self.rsp_cons.wrapping_add(n);
        if self.has_unconsumed_responses() {
            return true;
        }
        self.header().rsp_event.store(self.rsp_cons.wrapping_add(1), Ordering::Relaxed);
        barrier::mb();
        self.has_unconsumed_responses()
    }
}
