// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Paravirtual console front end (byte-ring consumer)
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! PUBLIC API:
//!   - XenConsole: console front end over the shared console page
//!   - write()/read(): short-count byte I/O plus peer notification
//!
//! The console page and event port come from the platform start info;
//! this driver only speaks the ring protocol and pokes the port.

use core::ptr::NonNull;

use axon_abi::{Port, Status};
use axon_hal::Hypercall;
use axon_ring::ConsoleRing;

/// Errors surfaced by console I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleError {
    /// Notifying the backend failed.
    Hypervisor(Status),
}

impl core::fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Hypervisor(status) => write!(f, "hypervisor: {status}"),
        }
    }
}

/// Console front end: output ring producer, input ring consumer.
pub struct XenConsole<H: Hypercall> {
    hv: H,
    ring: ConsoleRing,
    port: Port,
}

impl<H: Hypercall> XenConsole<H> {
    /// Wraps the console page shared with the backend.
    ///
    /// # Safety
    ///
    /// `page` must point to the live console interface page for the
    /// lifetime of the driver, with this guest as the only writer of
    /// the guest-owned cursors.
    pub unsafe fn attach(hv: H, page: NonNull<u8>, port: Port) -> Self {
        Self { hv, ring: ConsoleRing::attach(page), port }
    }

    /// Queues as much of `bytes` as fits and wakes the backend.
    /// Returns the short count; the caller retries the remainder.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, ConsoleError> {
        let sent = self.ring.write(bytes);
        if sent > 0 {
            self.hv.evtchn_send(self.port).map_err(ConsoleError::Hypervisor)?;
        }
        Ok(sent)
    }

    /// Drains pending input into `buf`. Notifies the backend when bytes
    /// were consumed, since it may be stalled on a full input ring.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConsoleError> {
        let got = self.ring.read(buf);
        if got > 0 {
            self.hv.evtchn_send(self.port).map_err(ConsoleError::Hypervisor)?;
        }
        Ok(got)
    }

    /// Pending input bytes.
    pub fn input_available(&self) -> usize {
        self.ring.input_available()
    }
}
