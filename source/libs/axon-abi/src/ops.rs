// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sub-operation numbers of the two hypercalls this substrate consumes.
//!
//! The `axon-hal::Hypercall` trait exposes these as typed methods; the
//! numbers matter only to the arch backend that marshals the actual
//! hypercall arguments, and to anyone reading traces.

/// `grant_table_op` sub-operations.
pub mod grant {
    /// Map a peer's grant reference at a host virtual address.
    pub const MAP_GRANT_REF: u32 = 0;
    /// Release an active mapping by handle.
    pub const UNMAP_GRANT_REF: u32 = 1;
    /// Tell the hypervisor how many grant-table frames the domain uses.
    pub const SETUP_TABLE: u32 = 2;
    /// Complete the guest side of a page transfer.
    pub const TRANSFER: u32 = 4;
    /// Query the current and maximum table size.
    pub const QUERY_SIZE: u32 = 6;
}

/// `event_channel_op` sub-operations.
pub mod event {
    /// Bind to a port a peer domain has offered.
    pub const BIND_INTERDOMAIN: u32 = 0;
    /// Bind a virtual IRQ to a fresh port.
    pub const BIND_VIRQ: u32 = 1;
    /// Bind a physical IRQ to a fresh port.
    pub const BIND_PIRQ: u32 = 2;
    /// Close a port.
    pub const CLOSE: u32 = 3;
    /// Signal the peer end of a port.
    pub const SEND: u32 = 4;
    /// Allocate a port for a named peer to bind to.
    pub const ALLOC_UNBOUND: u32 = 6;
    /// Clear a port's mask bit.
    pub const UNMASK: u32 = 9;
}
