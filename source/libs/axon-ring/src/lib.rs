// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Ring transports — shared-page queues between domains
//! OWNERS: @runtime
//! PUBLIC API: FrontRing, ByteRing, ConsoleRing, StoreRing
//! INVARIANTS: producer - consumer (mod 2^32) never exceeds capacity on
//!             either index pair; payload is published before the index
//!             that makes it visible (release order) and indices are
//!             read before the payload they cover (acquire order); each
//!             index has exactly one writer, preserved by construction.
//!
//! No locks can span the isolation boundary, so both transports rely
//! entirely on the barrier discipline above. Both sides derive the same
//! capacity from the page and slot sizes; that equality is a protocol
//! assumption the page layout cannot express.

mod byte;
mod desc;

pub use byte::{ByteRing, ConsoleRing, StoreRing};
pub use desc::FrontRing;
