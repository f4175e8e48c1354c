// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Event channels — the notification fabric between domains
//! OWNERS: @runtime
//! PUBLIC API: EventDispatcher, EventContext, Handler, EventError
//! INVARIANTS: a handler's data word is published before the handler
//!             pointer (release order), so a dispatch racing a bind
//!             never runs a handler against stale data; dispatch never
//!             blocks and never allocates.

extern crate alloc;

use core::fmt;

use alloc::boxed::Box;
use alloc::vec::Vec;

use axon_abi::{DomId, Port, Status};
use axon_hal::barrier;
use axon_hal::Hypercall;

/// Number of addressable event ports.
pub const NR_EVENTS: usize = 1024;

/// Saved machine state handed to handlers by the upcall path.
///
/// Handlers treat it as read-only context; on the host-test path it is
/// simply constructed by the test driving `dispatch`.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventContext {
    pub ip: usize,
    pub sp: usize,
}

/// Port notification handler. Receives the port, the interrupted
/// context, and the data word registered at bind time.
pub type Handler = fn(Port, &mut EventContext, usize);

/// Errors surfaced by event-channel operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventError {
    /// Port number is outside `[0, NR_EVENTS)`.
    PortOutOfRange,
    /// The hypervisor rejected a bind, close, or send.
    Hypervisor(Status),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortOutOfRange => write!(f, "event port out of range"),
            Self::Hypervisor(status) => write!(f, "hypervisor: {status}"),
        }
    }
}

fn default_handler(port: Port, _ctx: &mut EventContext, _data: usize) {
    log::debug!("event: spurious notification on port {}", port.0);
}

struct Action {
    handler: Handler,
    data: usize,
    count: u32,
}

impl Action {
    fn idle() -> Self {
        Self { handler: default_handler, data: 0, count: 0 }
    }
}

/// Routes hypervisor notifications to registered handlers.
///
/// One dispatcher per domain. Binding and teardown run in the guest's
/// cooperative control flow; `dispatch` is the only entry reached from
/// the upcall path and must stay allocation-free.
pub struct EventDispatcher<H: Hypercall> {
    hv: H,
    actions: Box<[Action]>,
    bound: [u64; NR_EVENTS / 64],
}

impl<H: Hypercall> EventDispatcher<H> {
    pub fn new(hv: H) -> Self {
        let mut actions = Vec::with_capacity(NR_EVENTS);
        actions.resize_with(NR_EVENTS, Action::idle);
        Self { hv, actions: actions.into_boxed_slice(), bound: [0; NR_EVENTS / 64] }
    }

    /// Releases the hypercall interface, for teardown paths.
    pub fn fini(self) -> H {
        self.hv
    }

    fn check(port: Port) -> Result<usize, EventError> {
        let idx = port.0 as usize;
        if idx >= NR_EVENTS {
            return Err(EventError::PortOutOfRange);
        }
        Ok(idx)
    }

    fn is_bound(&self, idx: usize) -> bool {
        self.bound[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set_bound(&mut self, idx: usize, on: bool) {
        if on {
            self.bound[idx / 64] |= 1 << (idx % 64);
        } else {
            self.bound[idx / 64] &= !(1 << (idx % 64));
        }
    }

    /// Installs `handler` on `port`. Rebinding an already-bound port is
    /// legal but suspicious, so it is logged rather than rejected.
    pub fn bind(&mut self, port: Port, handler: Handler, data: usize) -> Result<(), EventError> {
        let idx = Self::check(port)?;
        if self.is_bound(idx) {
            log::warn!("event: handler for port {} overwritten", port.0);
        }
        self.actions[idx].data = data;
        // Data must be visible before a concurrent dispatch can see the
        // new handler pointer.
        barrier::wmb();
        self.actions[idx].handler = handler;
        self.set_bound(idx, true);
        Ok(())
    }

    /// Tears a port down: mask, drop any latched notification, revert to
    /// the default handler, then close it at the hypervisor.
    pub fn unbind(&mut self, port: Port) -> Result<(), EventError> {
        let idx = Self::check(port)?;
        if !self.is_bound(idx) {
            log::warn!("event: unbind of never-bound port {}", port.0);
        }
        self.hv.mask_event(port);
        self.hv.clear_pending(port);
        // Reverse of bind: handler first, then the data word.
        self.actions[idx].handler = default_handler;
        barrier::wmb();
        self.actions[idx].data = 0;
        self.set_bound(idx, false);
        self.hv.evtchn_close(port).map_err(EventError::Hypervisor)
    }

    /// Allocates a port a peer may later bind to, and installs the
    /// handler locally. Local state is untouched if the hypercall fails.
    pub fn alloc_unbound(
        &mut self,
        peer: DomId,
        handler: Handler,
        data: usize,
    ) -> Result<Port, EventError> {
        let port = self.hv.evtchn_alloc_unbound(peer).map_err(EventError::Hypervisor)?;
        self.bind(port, handler, data)?;
        Ok(port)
    }

    /// Connects to a port the peer already allocated.
    pub fn bind_interdomain(
        &mut self,
        peer: DomId,
        remote_port: Port,
        handler: Handler,
        data: usize,
    ) -> Result<Port, EventError> {
        let port = self
            .hv
            .evtchn_bind_interdomain(peer, remote_port)
            .map_err(EventError::Hypervisor)?;
        self.bind(port, handler, data)?;
        Ok(port)
    }

    /// Binds a virtual IRQ to a fresh port.
    pub fn bind_virq(&mut self, virq: u32, handler: Handler, data: usize) -> Result<Port, EventError> {
        let port = self.hv.evtchn_bind_virq(virq).map_err(EventError::Hypervisor)?;
        self.bind(port, handler, data)?;
        Ok(port)
    }

    /// Binds a physical IRQ to a fresh port.
    pub fn bind_pirq(
        &mut self,
        pirq: u32,
        shareable: bool,
        handler: Handler,
        data: usize,
    ) -> Result<Port, EventError> {
        let port = self.hv.evtchn_bind_pirq(pirq, shareable).map_err(EventError::Hypervisor)?;
        self.bind(port, handler, data)?;
        Ok(port)
    }

    /// Routes one notification. The sole entry used by the upcall path:
    /// no blocking, no allocation, port number is validated rather than
    /// trusted.
    pub fn dispatch(&mut self, port: Port, ctx: &mut EventContext) -> Result<(), EventError> {
        let idx = Self::check(port)?;
        self.hv.clear_pending(port);
        let action = &mut self.actions[idx];
        action.count = action.count.wrapping_add(1);
        (action.handler)(port, ctx, action.data);
        Ok(())
    }

    /// Pokes the peer on `port`.
    pub fn notify(&self, port: Port) -> Result<(), EventError> {
        self.hv.evtchn_send(port).map_err(EventError::Hypervisor)
    }

    /// Masks `port` without tearing it down.
    pub fn mask(&self, port: Port) {
        self.hv.mask_event(port);
    }

    /// Unmasks `port`.
    pub fn unmask(&self, port: Port) {
        self.hv.unmask_event(port);
    }

    /// How many notifications `port` has received.
    pub fn occurrences(&self, port: Port) -> Result<u32, EventError> {
        Ok(self.actions[Self::check(port)?].count)
    }

    /// Shutdown path: forcibly unbinds every bound port not in `keep`.
    pub fn unbind_all(&mut self, keep: &[Port]) {
        for idx in 0..NR_EVENTS {
            let port = Port(idx as u32);
            if !self.is_bound(idx) || keep.contains(&port) {
                continue;
            }
            if let Err(err) = self.unbind(port) {
                log::warn!("event: teardown close of port {} failed: {err}", port.0);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn hypercall(&self) -> &H {
        &self.hv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct HvState {
        next_port: u32,
        masked: Vec<u32>,
        cleared: Vec<u32>,
        closed: Vec<u32>,
        sent: Vec<u32>,
        fail_binds: bool,
    }

    #[derive(Default)]
    struct StubHypervisor {
        state: RefCell<HvState>,
    }

    impl StubHypervisor {
        fn next(&self) -> Result<Port, Status> {
            let mut st = self.state.borrow_mut();
            if st.fail_binds {
                return Err(Status(-1));
            }
            let port = Port(st.next_port);
            st.next_port += 1;
            Ok(port)
        }
    }

    impl Hypercall for StubHypervisor {
        fn grant_setup_table(&self, _frames: u32) -> Result<(), Status> {
            Ok(())
        }
        fn grant_map(
            &self,
            _host_addr: u64,
            _peer: DomId,
            _gref: axon_abi::GrantRef,
            _writable: bool,
        ) -> Result<axon_abi::MapHandle, Status> {
            Ok(axon_abi::MapHandle(0))
        }
        fn grant_unmap(&self, _host_addr: u64, _handle: axon_abi::MapHandle) -> Result<(), Status> {
            Ok(())
        }
        fn grant_transfer(
            &self,
            _peer: DomId,
            _gref: axon_abi::GrantRef,
            _frame: axon_abi::Frame,
        ) -> Result<(), Status> {
            Ok(())
        }
        fn evtchn_alloc_unbound(&self, _peer: DomId) -> Result<Port, Status> {
            self.next()
        }
        fn evtchn_bind_interdomain(&self, _peer: DomId, _remote: Port) -> Result<Port, Status> {
            self.next()
        }
        fn evtchn_bind_virq(&self, _virq: u32) -> Result<Port, Status> {
            self.next()
        }
        fn evtchn_bind_pirq(&self, _pirq: u32, _shareable: bool) -> Result<Port, Status> {
            self.next()
        }
        fn evtchn_close(&self, port: Port) -> Result<(), Status> {
            self.state.borrow_mut().closed.push(port.0);
            Ok(())
        }
        fn evtchn_send(&self, port: Port) -> Result<(), Status> {
            self.state.borrow_mut().sent.push(port.0);
            Ok(())
        }
        fn mask_event(&self, port: Port) {
            self.state.borrow_mut().masked.push(port.0);
        }
        fn unmask_event(&self, _port: Port) {}
        fn clear_pending(&self, port: Port) {
            self.state.borrow_mut().cleared.push(port.0);
        }
    }

    thread_local! {
        static HITS: RefCell<Vec<(u32, usize)>> = RefCell::new(Vec::new());
    }

    fn recording_handler(port: Port, _ctx: &mut EventContext, data: usize) {
        HITS.with(|hits| hits.borrow_mut().push((port.0, data)));
    }

    fn dispatcher() -> EventDispatcher<StubHypervisor> {
        HITS.with(|hits| hits.borrow_mut().clear());
        EventDispatcher::new(StubHypervisor::default())
    }

    #[test]
    fn dispatch_invokes_handler_and_counts() {
        let mut d = dispatcher();
        d.bind(Port(5), recording_handler, 0xfeed).unwrap();
        let mut ctx = EventContext::default();
        for _ in 0..3 {
            d.dispatch(Port(5), &mut ctx).unwrap();
        }
        assert_eq!(d.occurrences(Port(5)).unwrap(), 3);
        HITS.with(|hits| {
            assert_eq!(*hits.borrow(), vec![(5, 0xfeed); 3]);
        });
        // Pending state cleared once per delivery.
        assert_eq!(d.hypercall().state.borrow().cleared, vec![5, 5, 5]);
    }

    #[test]
    fn out_of_range_port_is_rejected_without_side_effects() {
        let mut d = dispatcher();
        let mut ctx = EventContext::default();
        let port = Port(NR_EVENTS as u32);
        assert_eq!(d.dispatch(port, &mut ctx), Err(EventError::PortOutOfRange));
        assert!(d.hypercall().state.borrow().cleared.is_empty());
        HITS.with(|hits| assert!(hits.borrow().is_empty()));
    }

    #[test]
    fn unbound_port_runs_the_default_handler() {
        let mut d = dispatcher();
        let mut ctx = EventContext::default();
        d.dispatch(Port(7), &mut ctx).unwrap();
        assert_eq!(d.occurrences(Port(7)).unwrap(), 1);
        HITS.with(|hits| assert!(hits.borrow().is_empty()));
    }

    #[test]
    fn unbind_masks_clears_and_closes() {
        let mut d = dispatcher();
        d.bind(Port(9), recording_handler, 1).unwrap();
        d.unbind(Port(9)).unwrap();
        let st = d.hypercall().state.borrow();
        assert_eq!(st.masked, vec![9]);
        assert_eq!(st.cleared, vec![9]);
        assert_eq!(st.closed, vec![9]);
        drop(st);
        // Handler reverted: dispatch records nothing.
        let mut ctx = EventContext::default();
        d.dispatch(Port(9), &mut ctx).unwrap();
        HITS.with(|hits| assert!(hits.borrow().is_empty()));
    }

    #[test]
    fn hypervisor_binds_leave_local_state_untouched_on_failure() {
        let mut d = dispatcher();
        d.hv.state.borrow_mut().fail_binds = true;
        let err = d.bind_virq(3, recording_handler, 0).unwrap_err();
        assert_eq!(err, EventError::Hypervisor(Status(-1)));
        for idx in 0..NR_EVENTS {
            assert!(!d.is_bound(idx));
        }
    }

    #[test]
    fn allocation_ops_bind_the_returned_port() {
        let mut d = dispatcher();
        let a = d.alloc_unbound(DomId(1), recording_handler, 10).unwrap();
        let b = d.bind_interdomain(DomId(1), Port(44), recording_handler, 11).unwrap();
        let c = d.bind_virq(2, recording_handler, 12).unwrap();
        let e = d.bind_pirq(6, true, recording_handler, 13).unwrap();
        assert_eq!([a.0, b.0, c.0, e.0], [0, 1, 2, 3]);
        let mut ctx = EventContext::default();
        d.dispatch(b, &mut ctx).unwrap();
        HITS.with(|hits| assert_eq!(*hits.borrow(), vec![(1, 11)]));
    }

    #[test]
    fn unbind_all_spares_protected_ports() {
        let mut d = dispatcher();
        let a = d.bind_virq(1, recording_handler, 0).unwrap();
        let b = d.bind_virq(2, recording_handler, 0).unwrap();
        let c = d.bind_virq(3, recording_handler, 0).unwrap();
        d.unbind_all(&[b]);
        let st = d.hypercall().state.borrow();
        assert_eq!(st.closed, vec![a.0, c.0]);
        drop(st);
        assert!(d.is_bound(b.0 as usize));
        assert!(!d.is_bound(a.0 as usize));
    }

    #[test]
    fn notify_sends_on_the_port() {
        let d = dispatcher();
        d.notify(Port(12)).unwrap();
        assert_eq!(d.hypercall().state.borrow().sent, vec![12]);
    }
}
