// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Hypervisor wire ABI shared by the paravirtual I/O crates
//! OWNERS: @runtime
//! PUBLIC API: DomId, Port, GrantRef, Frame, MapHandle, GrantEntry, GrantFlags,
//!             RingHeader, ConsoleInterface, StoreInterface, netif slot types, Status
//! INVARIANTS: Every `#[repr(C)]` type here reproduces the hypervisor ABI
//!             byte-for-byte (field order and padding included); index fields
//!             shared with a peer domain are atomics because the peer mutates
//!             them concurrently with no lock spanning the isolation boundary.

use core::fmt;
use core::sync::atomic::{AtomicU16, AtomicU32};

use bitflags::bitflags;

pub mod ops;

/// Size of one machine page / frame, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Identifier of an isolation domain. Domain 0 is the managing domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DomId(pub u16);

/// The managing domain.
pub const DOMID_BACKEND: DomId = DomId(0);

/// An event channel port number, in `[0, NR_EVENTS)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Port(pub u32);

/// A grant reference: an index into the domain's grant table. Names a
/// permission, not a pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GrantRef(pub u32);

/// Machine frame number of one page of physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Frame(pub u64);

/// Hypervisor-issued handle for an active foreign mapping; required to unmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct MapHandle(pub u32);

/// Grant references below this index are reserved for the toolstack
/// (console and store rings); dynamically issued grants start here.
pub const RESERVED_GRANT_ENTRIES: u32 = 8;

/// Grant entries per grant-table frame.
pub const GRANT_ENTRIES_PER_FRAME: usize = PAGE_SIZE / core::mem::size_of::<GrantEntry>();

bitflags! {
    /// Flag word of a grant-table entry.
    ///
    /// The low two bits select the entry type; the remaining bits are
    /// either guest-written subflags or hypervisor-written status bits,
    /// depending on the type. Transfer status bits alias the access
    /// subflag bits, exactly as in the hypervisor headers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GrantFlags: u16 {
        /// Peer may map the named frame for access.
        const PERMIT_ACCESS = 1 << 0;
        /// Peer may transfer a frame of its own into this entry.
        const ACCEPT_TRANSFER = 1 << 1;
        /// Subflag of `PERMIT_ACCESS`: restrict the peer to read-only.
        const READONLY = 1 << 2;
        /// Status bit: peer currently holds a readable mapping.
        const READING = 1 << 3;
        /// Status bit: peer currently holds a writable mapping.
        const WRITING = 1 << 4;
        /// Status bit (transfer entries): peer has committed a frame.
        const TRANSFER_COMMITTED = 1 << 2;
        /// Status bit (transfer entries): the committed frame number is valid.
        const TRANSFER_COMPLETED = 1 << 3;
    }
}

/// One slot of the version-1 grant table, shared with the hypervisor.
///
/// Fields are atomics: the flag word is the publication point of the
/// release/acquire protocol between domains, and the hypervisor writes
/// status bits into it concurrently. The structure is exactly 8 bytes.
#[repr(C)]
pub struct GrantEntry {
    /// `GrantFlags` bits. Written last when granting (after a write
    /// barrier), read first when inspecting.
    pub flags: AtomicU16,
    /// Peer domain the permission names.
    pub domid: AtomicU16,
    /// Machine frame being shared, or (for completed transfers) the
    /// frame the peer donated.
    pub frame: AtomicU32,
}

impl GrantEntry {
    /// An unused entry (type bits zero).
    pub const fn free() -> Self {
        Self {
            flags: AtomicU16::new(0),
            domid: AtomicU16::new(0),
            frame: AtomicU32::new(0),
        }
    }
}

/// Shared header of a descriptor ring page. 64 bytes, followed by the
/// power-of-two slot array.
///
/// `req_event` and `rsp_event` are the notification thresholds each side
/// publishes so the producer can suppress redundant event-channel signals.
#[repr(C)]
pub struct RingHeader {
    /// Request producer index (written by the front end).
    pub req_prod: AtomicU32,
    /// Request consumer event threshold (written by the back end).
    pub req_event: AtomicU32,
    /// Response producer index (written by the back end).
    pub rsp_prod: AtomicU32,
    /// Response consumer event threshold (written by the front end).
    pub rsp_event: AtomicU32,
    /// Pads the header to 64 bytes; slot arrays start past it.
    pub pad: [u8; 48],
}

/// Byte offset of the first ring slot past the header.
pub const RING_HEADER_SIZE: usize = 64;

/// Capacity of the console output byte ring.
pub const CONSOLE_OUT_SIZE: usize = 2048;
/// Capacity of the console input byte ring.
pub const CONSOLE_IN_SIZE: usize = 1024;

/// The console shared page: two circular byte buffers with their cursor
/// pairs at the tail, as laid out by the hypervisor console backend.
#[repr(C)]
pub struct ConsoleInterface {
    /// Bytes from the backend to the guest (keyboard/serial input).
    pub input: [u8; CONSOLE_IN_SIZE],
    /// Bytes from the guest to the backend (console output).
    pub output: [u8; CONSOLE_OUT_SIZE],
    /// Input consumer cursor (guest-owned).
    pub in_cons: AtomicU32,
    /// Input producer cursor (backend-owned).
    pub in_prod: AtomicU32,
    /// Output consumer cursor (backend-owned).
    pub out_cons: AtomicU32,
    /// Output producer cursor (guest-owned).
    pub out_prod: AtomicU32,
}

/// Capacity of each configuration-store byte ring.
pub const STORE_RING_SIZE: usize = 1024;

/// The configuration-store shared page: request and reply byte rings.
#[repr(C)]
pub struct StoreInterface {
    /// Request bytes from the guest to the store daemon.
    pub req: [u8; STORE_RING_SIZE],
    /// Reply bytes from the store daemon to the guest.
    pub rsp: [u8; STORE_RING_SIZE],
    /// Request consumer cursor (daemon-owned).
    pub req_cons: AtomicU32,
    /// Request producer cursor (guest-owned).
    pub req_prod: AtomicU32,
    /// Reply consumer cursor (guest-owned).
    pub rsp_cons: AtomicU32,
    /// Reply producer cursor (daemon-owned).
    pub rsp_prod: AtomicU32,
}

/// Network transmit request slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetTxRequest {
    /// Grant reference of the page holding the packet payload.
    pub gref: u32,
    /// Payload offset within the granted page.
    pub offset: u16,
    /// Transmit flags (checksum offload etc.); zero during bring-up.
    pub flags: u16,
    /// Echoed back in the matching response.
    pub id: u16,
    /// Payload length in bytes.
    pub size: u16,
}

/// Network transmit response slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetTxResponse {
    /// Matches the id of the request being answered.
    pub id: u16,
    /// `status::OKAY` or a negative error.
    pub status: i16,
}

/// Network receive request slot: offers a granted page for the backend
/// to deposit a packet into.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetRxRequest {
    /// Echoed back in the matching response.
    pub id: u16,
    /// Grant reference of the empty receive page.
    pub gref: u32,
}

/// Network receive response slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetRxResponse {
    /// Matches the id of the posted receive request.
    pub id: u16,
    /// Packet offset within the granted page.
    pub offset: u16,
    /// Receive flags.
    pub flags: u16,
    /// Packet length when positive, negative error otherwise.
    pub status: i16,
}

/// Hypervisor status code returned by a hypercall: zero is success,
/// negative values are hypervisor-defined errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Status(pub i16);

impl Status {
    /// Successful completion.
    pub const OKAY: Status = Status(0);

    /// True when the code reports success.
    pub const fn is_okay(self) -> bool {
        self.0 == 0
    }

    fn message(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "okay",
            -1 => "general error",
            -2 => "unrecognised domain id",
            -3 => "unrecognised or inappropriate grant reference",
            -4 => "unrecognised or inappropriate map handle",
            -5 => "inappropriate virtual address to map",
            -6 => "inappropriate device address to unmap",
            -7 => "out of space in I/O MMU",
            -8 => "not enough privilege for operation",
            -9 => "specified page was invalid for operation",
            -10 => "copy arguments cross page boundary",
            -11 => "transfer page address too large",
            -12 => "operation not done; try again",
            -13 => "out of space",
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{} ({})", msg, self.0),
            None => write!(f, "unknown hypervisor status {}", self.0),
        }
    }
}
