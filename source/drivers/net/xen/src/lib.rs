// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Paravirtual network front end (descriptor-ring consumer)
//! OWNERS: @runtime
//! STATUS: In Progress (bring-up, polling-oriented)
//!
//! PUBLIC API:
//!   - NetFront: TX/RX descriptor rings over granted pages
//!   - transmit()/drain_tx(): grant a payload page, queue it, reap it
//!   - refill_rx()/receive(): offer empty pages, collect packets
//!   - fini(): end every outstanding grant before the device goes away
//!
//! Payload pages follow the grant lifecycle: granted and ref-counted
//! while a request is in flight, ended and released when the matching
//! response is reaped. The ring pages themselves are granted once at
//! construction and stay granted until `fini` ends them.

extern crate alloc;

use core::fmt;
use core::ptr::NonNull;

use alloc::vec::Vec;

use axon_abi::{
    DomId, GrantRef, NetRxRequest, NetRxResponse, NetTxRequest, NetTxResponse, Port, Status,
    PAGE_SIZE,
};
use axon_buf::{BufError, PageBuffer};
use axon_grant::{GrantError, GrantTable};
use axon_hal::{Hypercall, PageAllocator, Translate};
use axon_ring::FrontRing;

/// Payload buffers kept per direction. Plenty for bring-up; the rings
/// themselves hold far more slots.
pub const POOL_SIZE: usize = 16;

/// Errors surfaced by the network front end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetError {
    /// No free transmit buffer; reap completions and retry.
    TxFull,
    /// Frame does not fit a single page.
    TooLarge,
    /// Grant bookkeeping failed.
    Grant(GrantError),
    /// Payload buffer access failed.
    Buffer(BufError),
    /// Notifying the backend failed.
    Hypervisor(Status),
    /// The backend reported an error status for a packet.
    Backend(Status),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TxFull => write!(f, "transmit pool exhausted"),
            Self::TooLarge => write!(f, "frame exceeds one page"),
            Self::Grant(err) => write!(f, "grant: {err}"),
            Self::Buffer(err) => write!(f, "buffer: {err}"),
            Self::Hypervisor(status) => write!(f, "hypervisor: {status}"),
            Self::Backend(status) => write!(f, "backend: {status}"),
        }
    }
}

impl From<GrantError> for NetError {
    fn from(err: GrantError) -> Self {
        Self::Grant(err)
    }
}

impl From<BufError> for NetError {
    fn from(err: BufError) -> Self {
        Self::Buffer(err)
    }
}

struct IoSlot<A: PageAllocator> {
    buf: PageBuffer<A>,
    gref: Option<GrantRef>,
}

/// Network front end: request producer on both rings.
pub struct NetFront<A: PageAllocator, T: Translate> {
    tx: FrontRing<NetTxRequest, NetTxResponse>,
    rx: FrontRing<NetRxRequest, NetRxResponse>,
    backend: DomId,
    port: Port,
    translate: T,
    tx_ring_gref: Option<GrantRef>,
    rx_ring_gref: Option<GrantRef>,
    tx_slots: Vec<IoSlot<A>>,
    tx_free: Vec<u16>,
    rx_slots: Vec<IoSlot<A>>,
}

impl<A: PageAllocator + Clone, T: Translate> NetFront<A, T> {
    /// Builds the device: initializes both rings on the given pages,
    /// grants them to the backend, and allocates the payload pools.
    ///
    /// The ring grant references are published to the backend out of
    /// band (configuration store); see [`NetFront::ring_grefs`].
    ///
    /// # Safety
    ///
    /// `tx_page` and `rx_page` must each point to `PAGE_SIZE` valid,
    /// page-aligned bytes owned by the caller for the lifetime of the
    /// device and not aliased by any Rust reference.
    pub unsafe fn new<H: Hypercall>(
        grants: &mut GrantTable<H>,
        backend: DomId,
        port: Port,
        tx_page: NonNull<u8>,
        rx_page: NonNull<u8>,
        alloc: A,
        translate: T,
    ) -> Result<Self, NetError> {
        let tx = FrontRing::init(tx_page);
        let rx = FrontRing::init(rx_page);

        let tx_ring_gref = grants.alloc_ref()?;
        grants.grant_access(tx_ring_gref, translate.frame_of(tx_page), backend, false)?;
        let rx_ring_gref = grants.alloc_ref()?;
        grants.grant_access(rx_ring_gref, translate.frame_of(rx_page), backend, false)?;

        let mut tx_slots = Vec::with_capacity(POOL_SIZE);
        let mut rx_slots = Vec::with_capacity(POOL_SIZE);
        for _ in 0..POOL_SIZE {
            tx_slots.push(IoSlot { buf: PageBuffer::alloc(alloc.clone()), gref: None });
            rx_slots.push(IoSlot { buf: PageBuffer::alloc(alloc.clone()), gref: None });
        }
        let tx_free = (0..POOL_SIZE as u16).rev().collect();

        Ok(Self {
            tx,
            rx,
            backend,
            port,
            translate,
            tx_ring_gref: Some(tx_ring_gref),
            rx_ring_gref: Some(rx_ring_gref),
            tx_slots,
            tx_free,
            rx_slots,
        })
    }

    /// Grant references of the (tx, rx) ring pages, for the backend
    /// handshake. `None` once the device has been torn down.
    pub fn ring_grefs(&self) -> Option<(GrantRef, GrantRef)> {
        Some((self.tx_ring_gref?, self.rx_ring_gref?))
    }

    /// Queues one ethernet frame. Copies it into a pooled page, grants
    /// the page read-only to the backend, and publishes the request.
    pub fn transmit<H: Hypercall>(
        &mut self,
        grants: &mut GrantTable<H>,
        frame: &[u8],
    ) -> Result<(), NetError> {
        if frame.len() > PAGE_SIZE {
            return Err(NetError::TooLarge);
        }
        let id = self.tx_free.pop().ok_or(NetError::TxFull)?;
        let slot = &mut self.tx_slots[id as usize];
        slot.buf.blit(0, frame)?;

        let gref = match grants.alloc_ref() {
            Ok(gref) => gref,
            Err(err) => {
                self.tx_free.push(id);
                return Err(err.into());
            }
        };
        let page = slot.buf.base()?;
        if let Err(err) = grants.grant_access(gref, self.translate.frame_of(page), self.backend, true)
        {
            grants.release_ref(gref);
            self.tx_free.push(id);
            return Err(err.into());
        }
        slot.buf.ref_incr();
        slot.gref = Some(gref);

        let idx = self.tx.req_prod_pvt();
        *self.tx.request_slot(idx) = NetTxRequest {
            gref: gref.0,
            offset: 0,
            flags: 0,
            id,
            size: frame.len() as u16,
        };
        if self.tx.push_requests(1) {
            grants.hypercall().evtchn_send(self.port).map_err(NetError::Hypervisor)?;
        }
        Ok(())
    }

    /// Reaps transmit completions, returning how many were reaped.
    /// Errors from the backend are logged, not fatal; the buffer is
    /// recycled either way.
    pub fn drain_tx<H: Hypercall>(
        &mut self,
        grants: &mut GrantTable<H>,
    ) -> Result<usize, NetError> {
        let mut reaped = 0;
        let mut more = self.tx.has_unconsumed_responses();
        while more {
            let resp = self.tx.response(self.tx.rsp_cons());
            if resp.status < 0 {
                log::warn!("net tx: id {} failed with status {}", resp.id, resp.status);
            }
            self.recycle_tx(grants, resp.id)?;
            reaped += 1;
            more = self.tx.ack_responses(1);
        }
        Ok(reaped)
    }

    fn recycle_tx<H: Hypercall>(
        &mut self,
        grants: &mut GrantTable<H>,
        id: u16,
    ) -> Result<(), NetError> {
        let slot = &mut self.tx_slots[id as usize];
        if let Some(gref) = slot.gref.take() {
            if let Err(err) = grants.end_access(gref) {
                // Peer still holds the page; keep the slot quarantined.
                slot.gref = Some(gref);
                return Err(err.into());
            }
            grants.release_ref(gref);
            slot.buf.ref_decr();
            self.tx_free.push(id);
        } else {
            log::warn!("net tx: response for idle id {id}");
        }
        Ok(())
    }

    /// Posts every idle receive buffer to the backend, granting each
    /// page writable. Returns how many were posted.
    pub fn refill_rx<H: Hypercall>(
        &mut self,
        grants: &mut GrantTable<H>,
    ) -> Result<usize, NetError> {
        let mut posted = 0u32;
        for id in 0..self.rx_slots.len() as u16 {
            let slot = &mut self.rx_slots[id as usize];
            if slot.gref.is_some() {
                continue;
            }
            let gref = grants.alloc_ref()?;
            let page = slot.buf.base()?;
            if let Err(err) =
                grants.grant_access(gref, self.translate.frame_of(page), self.backend, false)
            {
                grants.release_ref(gref);
                return Err(err.into());
            }
            slot.buf.ref_incr();
            slot.gref = Some(gref);

            let idx = self.rx.req_prod_pvt().wrapping_add(posted);
            *self.rx.request_slot(idx) = NetRxRequest { id, gref: gref.0 };
            posted += 1;
        }
        if posted > 0 && self.rx.push_requests(posted) {
            grants.hypercall().evtchn_send(self.port).map_err(NetError::Hypervisor)?;
        }
        Ok(posted as usize)
    }

    /// Collects one received packet into `sink`, if any is pending.
    /// Returns the copied length, truncated to `sink`. The buffer is
    /// recycled for the next refill before returning.
    pub fn receive<H: Hypercall>(
        &mut self,
        grants: &mut GrantTable<H>,
        sink: &mut [u8],
    ) -> Result<Option<usize>, NetError> {
        if !self.rx.has_unconsumed_responses() {
            return Ok(None);
        }
        let resp = self.rx.response(self.rx.rsp_cons());
        let slot = &mut self.rx_slots[resp.id as usize];
        let outcome = if resp.status < 0 {
            Err(NetError::Backend(Status(resp.status)))
        } else {
            let len = resp.status as usize;
            let n = len.min(sink.len());
            slot.buf
                .read_into(resp.offset as usize, &mut sink[..n])
                .map(|()| Some(n))
                .map_err(NetError::Buffer)
        };
        if let Some(gref) = slot.gref.take() {
            match grants.end_access(gref) {
                Ok(()) => {
                    grants.release_ref(gref);
                    slot.buf.ref_decr();
                }
                Err(err) => {
                    slot.gref = Some(gref);
                    log::warn!("net rx: grant for id {} still busy: {err}", resp.id);
                }
            }
        }
        self.rx.ack_responses(1);
        outcome
    }

    /// True when transmit completions are waiting to be reaped.
    pub fn tx_completions_pending(&self) -> bool {
        self.tx.has_unconsumed_responses()
    }

    /// Tears the device down: ends every in-flight payload grant, then
    /// the ring-page grants, so dropping the front end afterwards
    /// returns all pages to the allocator.
    ///
    /// Fails on the first grant the backend still holds, leaving that
    /// grant and everything after it in place; retry once the backend
    /// lets go.
    pub fn fini<H: Hypercall>(&mut self, grants: &mut GrantTable<H>) -> Result<(), NetError> {
        for id in 0..self.tx_slots.len() as u16 {
            let slot = &mut self.tx_slots[id as usize];
            if let Some(gref) = slot.gref.take() {
                if let Err(err) = end_grant(grants, gref) {
                    slot.gref = Some(gref);
                    return Err(err);
                }
                slot.buf.ref_decr();
                self.tx_free.push(id);
            }
        }
        for slot in &mut self.rx_slots {
            if let Some(gref) = slot.gref.take() {
                if let Err(err) = end_grant(grants, gref) {
                    slot.gref = Some(gref);
                    return Err(err);
                }
                slot.buf.ref_decr();
            }
        }
        if let Some(gref) = self.tx_ring_gref.take() {
            if let Err(err) = end_grant(grants, gref) {
                self.tx_ring_gref = Some(gref);
                return Err(err);
            }
        }
        if let Some(gref) = self.rx_ring_gref.take() {
            if let Err(err) = end_grant(grants, gref) {
                self.rx_ring_gref = Some(gref);
                return Err(err);
            }
        }
        Ok(())
    }
}

fn end_grant<H: Hypercall>(grants: &mut GrantTable<H>, gref: GrantRef) -> Result<(), NetError> {
    grants.end_access(gref)?;
    grants.release_ref(gref);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_buf::HeapPages;
    use std::alloc::Layout;
    use std::cell::RefCell;
    use std::rc::Rc;

    use axon_abi::{Frame, MapHandle};

    #[derive(Default)]
    struct HvStub;

    impl Hypercall for HvStub {
        fn grant_setup_table(&self, _frames: u32) -> Result<(), Status> {
            Ok(())
        }
        fn grant_map(
            &self,
            _host_addr: u64,
            _peer: DomId,
            _gref: GrantRef,
            _writable: bool,
        ) -> Result<MapHandle, Status> {
            Ok(MapHandle(0))
        }
        fn grant_unmap(&self, _host_addr: u64, _handle: MapHandle) -> Result<(), Status> {
            Ok(())
        }
        fn grant_transfer(&self, _peer: DomId, _gref: GrantRef, _frame: Frame) -> Result<(), Status> {
            Ok(())
        }
        fn evtchn_alloc_unbound(&self, _peer: DomId) -> Result<Port, Status> {
            Ok(Port(0))
        }
        fn evtchn_bind_interdomain(&self, _peer: DomId, _remote: Port) -> Result<Port, Status> {
            Ok(Port(0))
        }
        fn evtchn_bind_virq(&self, _virq: u32) -> Result<Port, Status> {
            Ok(Port(0))
        }
        fn evtchn_bind_pirq(&self, _pirq: u32, _shareable: bool) -> Result<Port, Status> {
            Ok(Port(0))
        }
        fn evtchn_close(&self, _port: Port) -> Result<(), Status> {
            Ok(())
        }
        fn evtchn_send(&self, _port: Port) -> Result<(), Status> {
            Ok(())
        }
        fn mask_event(&self, _port: Port) {}
        fn unmask_event(&self, _port: Port) {}
        fn clear_pending(&self, _port: Port) {}
    }

    // Hands out small fake frame numbers so they fit v1 grant entries.
    #[derive(Clone, Default)]
    struct FakeMmu {
        frames: Rc<RefCell<Vec<*const u8>>>,
    }

    impl Translate for FakeMmu {
        fn frame_of(&self, addr: NonNull<u8>) -> Frame {
            let mut frames = self.frames.borrow_mut();
            let raw = addr.as_ptr() as *const u8;
            let idx = match frames.iter().position(|&known| known == raw) {
                Some(idx) => idx,
                None => {
                    frames.push(raw);
                    frames.len() - 1
                }
            };
            Frame(idx as u64 + 0x1000)
        }
    }

    fn page() -> NonNull<u8> {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap()
    }

    fn device() -> (GrantTable<HvStub>, NetFront<HeapPages, FakeMmu>) {
        let mut grants = GrantTable::init(HvStub, 1).unwrap();
        let front = unsafe {
            NetFront::new(
                &mut grants,
                DomId(0),
                Port(9),
                page(),
                page(),
                HeapPages,
                FakeMmu::default(),
            )
        }
        .unwrap();
        (grants, front)
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let (mut grants, mut front) = device();
        let jumbo = vec![0u8; PAGE_SIZE + 1];
        assert_eq!(front.transmit(&mut grants, &jumbo), Err(NetError::TooLarge));
    }

    #[test]
    fn pool_exhaustion_reports_tx_full() {
        let (mut grants, mut front) = device();
        for _ in 0..POOL_SIZE {
            front.transmit(&mut grants, b"ping").unwrap();
        }
        assert_eq!(front.transmit(&mut grants, b"ping"), Err(NetError::TxFull));
        front.fini(&mut grants).unwrap();
    }

    #[test]
    fn ring_pages_are_granted_at_construction() {
        let (grants, front) = device();
        let (tx_gref, rx_gref) = front.ring_grefs().unwrap();
        assert!(grants.shared_entry(tx_gref).is_some());
        assert_ne!(tx_gref, rx_gref);
    }

    #[test]
    fn fini_ends_every_grant_so_drop_is_clean() {
        let (mut grants, mut front) = device();
        for _ in 0..4 {
            front.transmit(&mut grants, b"ping").unwrap();
        }
        front.refill_rx(&mut grants).unwrap();

        front.fini(&mut grants).unwrap();
        assert!(front.ring_grefs().is_none());
        // Pool whole again: a full burst of ids is available.
        for _ in 0..POOL_SIZE {
            front.transmit(&mut grants, b"ping").unwrap();
        }
        front.fini(&mut grants).unwrap();
        drop(front);
    }
}
