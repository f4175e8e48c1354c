// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Grant table — the capability system for sharing pages with peers
//! OWNERS: @runtime
//! PUBLIC API: GrantTable, GrantMap, GrantError, MapError, TransferPoll
//! INVARIANTS: frame/domid are published before the flag word that
//!             authorizes the peer to use them (release order); a
//!             reference is never recycled while peer status bits are set.
//!
//! The entry array is guest-owned storage registered with the hypervisor
//! via the setup-table operation. Peers and the hypervisor mutate the
//! flag words concurrently, which is why those are the only place this
//! crate uses compare-and-swap; everything else runs in the guest's
//! single cooperative control flow.

extern crate alloc;

use core::fmt;
use core::sync::atomic::Ordering;

use alloc::boxed::Box;
use alloc::vec::Vec;

use axon_abi::{DomId, Frame, GrantEntry, GrantFlags, GrantRef, Status};
use axon_abi::{GRANT_ENTRIES_PER_FRAME, RESERVED_GRANT_ENTRIES};
use axon_hal::barrier;
use axon_hal::Hypercall;

mod map;

pub use map::{GrantMap, MapError, DEFAULT_MAX_MAPPED};

/// Errors surfaced by grant-table operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantError {
    /// Reference is outside `[RESERVED_GRANT_ENTRIES, max_entries)`.
    BadRef,
    /// The entry already carries an active grant; it must be ended first.
    InUse,
    /// The peer still holds a mapping; the grant was left intact.
    StillInUse,
    /// Frame number does not fit the v1 entry layout.
    FrameTooBig,
    /// No free grant references remain.
    Exhausted,
    /// The hypervisor rejected an operation.
    Hypervisor(Status),
}

impl fmt::Display for GrantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRef => write!(f, "grant reference out of range"),
            Self::InUse => write!(f, "grant entry already active"),
            Self::StillInUse => write!(f, "peer still holds a mapping"),
            Self::FrameTooBig => write!(f, "frame number exceeds entry width"),
            Self::Exhausted => write!(f, "grant references exhausted"),
            Self::Hypervisor(status) => write!(f, "hypervisor: {status}"),
        }
    }
}

/// One observation of an in-flight transfer; see [`GrantTable::end_transfer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferPoll {
    /// Peer activity observed but not finished; poll again.
    Pending,
    /// The offer was reclaimed before the peer committed a frame.
    Abandoned,
    /// Transfer finished; the peer donated this frame.
    Complete(Frame),
}

/// The domain's grant table. Guest-wide singleton by convention, but
/// constructed explicitly and passed by reference so tests can run
/// independent instances.
pub struct GrantTable<H: Hypercall> {
    hv: H,
    entries: Box<[GrantEntry]>,
    free: Vec<GrantRef>,
}

impl<H: Hypercall> GrantTable<H> {
    /// One-time setup: registers `frames` pages of entries with the
    /// hypervisor, then builds the local array and free list. Reserved
    /// references (toolstack rings) are excluded from the free list.
    pub fn init(hv: H, frames: u32) -> Result<Self, GrantError> {
        hv.grant_setup_table(frames).map_err(GrantError::Hypervisor)?;
        let count = frames as usize * GRANT_ENTRIES_PER_FRAME;
        let mut entries = Vec::with_capacity(count);
        entries.resize_with(count, GrantEntry::free);
        let free = (RESERVED_GRANT_ENTRIES..count as u32).rev().map(GrantRef).collect();
        Ok(Self { hv, entries: entries.into_boxed_slice(), free })
    }

    /// Tears the table down. The hypervisor registration persists until
    /// domain teardown; this releases the guest-side storage.
    pub fn fini(self) -> H {
        self.hv
    }

    /// Total number of entries, reserved ones included.
    pub fn max_entries(&self) -> usize {
        self.entries.len()
    }

    /// Takes a free grant reference for the caller to populate.
    pub fn alloc_ref(&mut self) -> Result<GrantRef, GrantError> {
        self.free.pop().ok_or(GrantError::Exhausted)
    }

    /// Returns a reference to the free list once its entry is cleared.
    pub fn release_ref(&mut self, gref: GrantRef) {
        debug_assert!(self.entry(gref).is_ok(), "releasing out-of-range grant ref");
        self.free.push(gref);
    }

    fn entry(&self, gref: GrantRef) -> Result<&GrantEntry, GrantError> {
        if gref.0 < RESERVED_GRANT_ENTRIES {
            return Err(GrantError::BadRef);
        }
        self.entries.get(gref.0 as usize).ok_or(GrantError::BadRef)
    }

    /// The shared view of an entry — what the peer and the hypervisor
    /// see. Exposed so protocol peers (and tests standing in for them)
    /// can operate on the flag word.
    pub fn shared_entry(&self, gref: GrantRef) -> Option<&GrantEntry> {
        self.entries.get(gref.0 as usize)
    }

    /// Grants `peer` access to `frame` through slot `gref`.
    ///
    /// Publication order matters: frame and domid become visible before
    /// the flag write that authorizes the peer to use them.
    pub fn grant_access(
        &self,
        gref: GrantRef,
        frame: Frame,
        peer: DomId,
        readonly: bool,
    ) -> Result<(), GrantError> {
        let entry = self.entry(gref)?;
        let frame = u32::try_from(frame.0).map_err(|_| GrantError::FrameTooBig)?;
        let current = GrantFlags::from_bits_truncate(entry.flags.load(Ordering::Relaxed));
        if current.intersects(GrantFlags::PERMIT_ACCESS | GrantFlags::ACCEPT_TRANSFER) {
            return Err(GrantError::InUse);
        }
        entry.frame.store(frame, Ordering::Relaxed);
        entry.domid.store(peer.0, Ordering::Relaxed);
        barrier::wmb();
        let mut flags = GrantFlags::PERMIT_ACCESS;
        if readonly {
            flags |= GrantFlags::READONLY;
        }
        entry.flags.store(flags.bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Offers slot `gref` for `peer` to transfer a frame of its own
    /// into, donating `frame` as the placeholder page.
    pub fn grant_transfer(&self, gref: GrantRef, frame: Frame, peer: DomId) -> Result<(), GrantError> {
        let entry = self.entry(gref)?;
        let frame = u32::try_from(frame.0).map_err(|_| GrantError::FrameTooBig)?;
        let current = GrantFlags::from_bits_truncate(entry.flags.load(Ordering::Relaxed));
        if current.intersects(GrantFlags::PERMIT_ACCESS | GrantFlags::ACCEPT_TRANSFER) {
            return Err(GrantError::InUse);
        }
        entry.frame.store(frame, Ordering::Relaxed);
        entry.domid.store(peer.0, Ordering::Relaxed);
        barrier::wmb();
        entry.flags.store(GrantFlags::ACCEPT_TRANSFER.bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Revokes the access grant in `gref`, reclaiming the page.
    ///
    /// Fails without touching the entry while the peer's reading/writing
    /// status bits are set. Otherwise clears the entry by CAS, retrying
    /// while unrelated bits move underneath.
    pub fn end_access(&self, gref: GrantRef) -> Result<(), GrantError> {
        let entry = self.entry(gref)?;
        let mut flags = entry.flags.load(Ordering::SeqCst);
        loop {
            if GrantFlags::from_bits_truncate(flags)
                .intersects(GrantFlags::READING | GrantFlags::WRITING)
            {
                log::warn!("grant {}: end_access while peer mapping active", gref.0);
                return Err(GrantError::StillInUse);
            }
            match entry
                .flags
                .compare_exchange(flags, 0, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(()),
                Err(current) => flags = current,
            }
        }
    }

    /// One non-blocking step of transfer completion.
    ///
    /// If the peer has not committed, attempts to reclaim the offer
    /// (CAS to free); losing that race means the peer is mid-commit, so
    /// the caller polls again. Once committed, waits for the completed
    /// bit, then reads the donated frame behind a read barrier.
    pub fn poll_transfer(&self, gref: GrantRef) -> Result<TransferPoll, GrantError> {
        let entry = self.entry(gref)?;
        let flags = entry.flags.load(Ordering::SeqCst);
        let parsed = GrantFlags::from_bits_truncate(flags);
        if !parsed.contains(GrantFlags::TRANSFER_COMMITTED) {
            return match entry
                .flags
                .compare_exchange(flags, 0, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => Ok(TransferPoll::Abandoned),
                Err(_) => Ok(TransferPoll::Pending),
            };
        }
        if !parsed.contains(GrantFlags::TRANSFER_COMPLETED) {
            return Ok(TransferPoll::Pending);
        }
        barrier::rmb();
        let frame = Frame(u64::from(entry.frame.load(Ordering::Relaxed)));
        entry.flags.store(0, Ordering::Relaxed);
        Ok(TransferPoll::Complete(frame))
    }

    /// Blocks until the transfer in `gref` finishes or is abandoned.
    ///
    /// The one operation in this subsystem allowed to spin on the peer;
    /// never call it from event-dispatch context. Callers needing a
    /// bounded wait drive [`Self::poll_transfer`] themselves.
    pub fn end_transfer(&self, gref: GrantRef) -> Result<Option<Frame>, GrantError> {
        loop {
            match self.poll_transfer(gref)? {
                TransferPoll::Pending => core::hint::spin_loop(),
                TransferPoll::Abandoned => return Ok(None),
                TransferPoll::Complete(frame) => return Ok(Some(frame)),
            }
        }
    }

    /// The hypercall interface the table was initialized with. Drivers
    /// use it to pair grant work with event-channel notifications.
    pub fn hypercall(&self) -> &H {
        &self.hv
    }
}
