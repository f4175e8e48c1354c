// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mappings of other domains' grants into the local address space.
//!
//! The table is an array of (host address, hypervisor handle) pairs;
//! handles come from the map hypercall and are required for the
//! corresponding unmap. Lookup is a linear scan: correct but O(n), and
//! fine because the number of concurrently mapped grants stays small.

use core::fmt;

use alloc::vec::Vec;

use axon_abi::{DomId, GrantRef, MapHandle, Status, PAGE_SIZE};
use axon_hal::Hypercall;

/// Lazy table size used when the caller never called `set_max_grants`.
pub const DEFAULT_MAX_MAPPED: usize = 128;

/// Errors surfaced by mapping operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Slice lengths do not match the requested count.
    BadArguments,
    /// The table was already sized; `set_max_grants` is one-shot.
    Busy,
    /// No free mapping-table slots remain.
    NoSpace,
    /// The address range asked to be unmapped is not currently mapped.
    NotMapped,
    /// The hypervisor rejected a map or unmap.
    Hypervisor(Status),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadArguments => write!(f, "argument slices do not match count"),
            Self::Busy => write!(f, "mapping table already sized"),
            Self::NoSpace => write!(f, "mapping table full"),
            Self::NotMapped => write!(f, "address not currently mapped"),
            Self::Hypervisor(status) => write!(f, "hypervisor: {status}"),
        }
    }
}

#[derive(Clone, Copy)]
struct MapEntry {
    /// Nonzero iff the slot is in use.
    host_addr: u64,
    handle: MapHandle,
}

impl MapEntry {
    const FREE: MapEntry = MapEntry { host_addr: 0, handle: MapHandle(0) };

    fn used(&self) -> bool {
        self.host_addr != 0
    }
}

/// Tracks foreign grants mapped into the local address space.
///
/// Address space comes from a caller-provided window: the table hands
/// out page-aligned addresses bump-style and never recycles them, the
/// same contract the original code gets from its on-demand region.
pub struct GrantMap<H: Hypercall> {
    hv: H,
    entries: Vec<MapEntry>,
    next_addr: u64,
}

impl<H: Hypercall> GrantMap<H> {
    /// Creates an unsized table drawing addresses from `window_base`.
    pub fn new(hv: H, window_base: u64) -> Self {
        debug_assert!(window_base != 0 && window_base as usize % PAGE_SIZE == 0);
        Self { hv, entries: Vec::new(), next_addr: window_base }
    }

    /// Sizes the table. One-shot: fails with `Busy` once sized (also by
    /// the lazy default sizing in `map_grant_refs`).
    pub fn set_max_grants(&mut self, count: usize) -> Result<(), MapError> {
        if !self.entries.is_empty() {
            return Err(MapError::Busy);
        }
        self.entries.resize(count, MapEntry::FREE);
        Ok(())
    }

    fn find_free(&mut self) -> Option<usize> {
        self.entries.iter().position(|entry| !entry.used())
    }

    fn find_addr(&self, addr: u64) -> Option<usize> {
        self.entries.iter().position(|entry| entry.host_addr == addr)
    }

    /// Maps `count` grant references as contiguous pages, returning the
    /// base address. All-or-nothing: the first failure unwinds every
    /// page mapped so far and surfaces the hypervisor status.
    pub fn map_grant_refs(
        &mut self,
        count: usize,
        peers: &[DomId],
        refs: &[GrantRef],
        writable: bool,
    ) -> Result<u64, MapError> {
        if peers.len() != count || refs.len() != count || count == 0 {
            return Err(MapError::BadArguments);
        }
        if self.entries.is_empty() {
            // Matches set_max_grants; cannot fail on an empty table.
            self.set_max_grants(DEFAULT_MAX_MAPPED)?;
        }
        let base = self.next_addr;
        self.next_addr += (count * PAGE_SIZE) as u64;
        for i in 0..count {
            let addr = base + (i * PAGE_SIZE) as u64;
            let result = match self.find_free() {
                None => Err(MapError::NoSpace),
                Some(slot) => match self.hv.grant_map(addr, peers[i], refs[i], writable) {
                    Ok(handle) => {
                        self.entries[slot] = MapEntry { host_addr: addr, handle };
                        Ok(())
                    }
                    Err(status) => Err(MapError::Hypervisor(status)),
                },
            };
            if let Err(err) = result {
                // Best-effort unwind of the pages already mapped.
                let _ = self.unmap(base, i);
                return Err(err);
            }
        }
        Ok(base)
    }

    /// Unmaps `count` pages starting at `start`. Asking to release an
    /// address that is not mapped is a caller error and stops the walk.
    pub fn unmap(&mut self, start: u64, count: usize) -> Result<(), MapError> {
        for i in 0..count {
            let addr = start + (i * PAGE_SIZE) as u64;
            let slot = match self.find_addr(addr) {
                Some(slot) => slot,
                None => {
                    log::warn!("grant map: unmap of unmapped address {addr:#x}");
                    return Err(MapError::NotMapped);
                }
            };
            self.hv
                .grant_unmap(addr, self.entries[slot].handle)
                .map_err(MapError::Hypervisor)?;
            self.entries[slot] = MapEntry::FREE;
        }
        Ok(())
    }

    /// Number of active mappings, for diagnostics.
    pub fn active(&self) -> usize {
        self.entries.iter().filter(|entry| entry.used()).count()
    }
}
