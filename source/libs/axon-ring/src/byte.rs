// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

//! Circular byte rings and the console/store page views built on them.
//!
//! A `ByteRing` is one direction of a shared page: a power-of-two byte
//! buffer and a cursor pair. Cursors increase without bound and are
//! masked on use, so `prod - cons` is the fill level even across
//! wraparound. Lock-free only because each cursor has a single writer;
//! the page views below hand out one direction per role to keep it so.

use core::cmp::min;
use core::ptr::{addr_of_mut, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};

use axon_abi::{ConsoleInterface, StoreInterface};
use axon_hal::barrier;

/// One direction of a shared circular byte buffer.
pub struct ByteRing {
    data: NonNull<u8>,
    capacity: u32,
    cons: NonNull<AtomicU32>,
    prod: NonNull<AtomicU32>,
}

impl ByteRing {
    /// Wraps a buffer and its cursor pair.
    ///
    /// # Safety
    ///
    /// `data` must point to `capacity` valid shared bytes and the
    /// cursor pointers to live atomics on the same shared page, all for
    /// the lifetime of the ring. `capacity` must be a power of two. The
    /// caller must ensure this side writes at most one of the two
    /// cursors (prod for `write`, cons for `read`).
    pub unsafe fn new(
        data: NonNull<u8>,
        capacity: u32,
        cons: NonNull<AtomicU32>,
        prod: NonNull<AtomicU32>,
    ) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self { data, capacity, cons, prod }
    }

    fn cons(&self) -> &AtomicU32 {
        unsafe { self.cons.as_ref() }
    }

    fn prod(&self) -> &AtomicU32 {
        unsafe { self.prod.as_ref() }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Bytes currently queued.
    pub fn available(&self) -> usize {
        let cons = self.cons().load(Ordering::Relaxed);
        let prod = self.prod().load(Ordering::Relaxed);
        prod.wrapping_sub(cons) as usize
    }

    /// Queues up to `bytes.len()` bytes, returning how many fit. A full
    /// ring yields a short count (possibly zero), never an error.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let cons = self.cons().load(Ordering::Relaxed);
        let prod = self.prod().load(Ordering::Relaxed);
        barrier::mb();
        debug_assert!(prod.wrapping_sub(cons) <= self.capacity);

        let free = (self.capacity - prod.wrapping_sub(cons)) as usize;
        let count = min(bytes.len(), free);
        let mask = self.capacity - 1;
        let start = (prod & mask) as usize;
        // Up to two copies when the span crosses the wrap point.
        let first = min(count, self.capacity as usize - start);
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.as_ptr().add(start), first);
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr().add(first),
                self.data.as_ptr(),
                count - first,
            );
        }
        // Payload before cursor.
        barrier::wmb();
        self.prod().store(prod.wrapping_add(count as u32), Ordering::Relaxed);
        count
    }

    /// Dequeues up to `buf.len()` bytes, returning how many were
    /// available. An empty ring yields zero.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let cons = self.cons().load(Ordering::Relaxed);
        let prod = self.prod().load(Ordering::Relaxed);
        barrier::rmb();
        debug_assert!(prod.wrapping_sub(cons) <= self.capacity);

        let avail = prod.wrapping_sub(cons) as usize;
        let count = min(buf.len(), avail);
        let mask = self.capacity - 1;
        let start = (cons & mask) as usize;
        let first = min(count, self.capacity as usize - start);
        unsafe {
            core::ptr::copy_nonoverlapping(self.data.as_ptr().add(start), buf.as_mut_ptr(), first);
            core::ptr::copy_nonoverlapping(
                self.data.as_ptr(),
                buf.as_mut_ptr().add(first),
                count - first,
            );
        }
        // The bytes must be out before the peer may overwrite them.
        barrier::mb();
        self.cons().store(cons.wrapping_add(count as u32), Ordering::Relaxed);
        count
    }
}

/// Guest view of the console shared page: write to the output ring,
/// read from the input ring.
pub struct ConsoleRing {
    page: NonNull<ConsoleInterface>,
}

impl ConsoleRing {
    /// # Safety
    ///
    /// `page` must point to a live `ConsoleInterface` shared with the
    /// console backend for the lifetime of the view, with this guest as
    /// the only writer of `out_prod` and `in_cons`.
    pub unsafe fn attach(page: NonNull<u8>) -> Self {
        Self { page: page.cast() }
    }

    fn out_ring(&self) -> ByteRing {
        let p = self.page.as_ptr();
        unsafe {
            ByteRing::new(
                NonNull::new_unchecked(addr_of_mut!((*p).output)).cast(),
                axon_abi::CONSOLE_OUT_SIZE as u32,
                NonNull::new_unchecked(addr_of_mut!((*p).out_cons)),
                NonNull::new_unchecked(addr_of_mut!((*p).out_prod)),
            )
        }
    }

    fn in_ring(&self) -> ByteRing {
        let p = self.page.as_ptr();
        unsafe {
            ByteRing::new(
                NonNull::new_unchecked(addr_of_mut!((*p).input)).cast(),
                axon_abi::CONSOLE_IN_SIZE as u32,
                NonNull::new_unchecked(addr_of_mut!((*p).in_cons)),
                NonNull::new_unchecked(addr_of_mut!((*p).in_prod)),
            )
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> usize {
        self.out_ring().write(bytes)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.in_ring().read(buf)
    }

    /// Pending input bytes.
    pub fn input_available(&self) -> usize {
        self.in_ring().available()
    }
}

/// Guest view of the configuration-store shared page: requests go out,
/// replies come back.
pub struct StoreRing {
    page: NonNull<StoreInterface>,
}

impl StoreRing {
    /// # Safety
    ///
    /// `page` must point to a live `StoreInterface` shared with the
    /// store daemon for the lifetime of the view, with this guest as
    /// the only writer of `req_prod` and `rsp_cons`.
    pub unsafe fn attach(page: NonNull<u8>) -> Self {
        Self { page: page.cast() }
    }

    fn req_ring(&self) -> ByteRing {
        let p = self.page.as_ptr();
        unsafe {
            ByteRing::new(
                NonNull::new_unchecked(addr_of_mut!((*p).req)).cast(),
                axon_abi::STORE_RING_SIZE as u32,
                NonNull::new_unchecked(addr_of_mut!((*p).req_cons)),
                NonNull::new_unchecked(addr_of_mut!((*p).req_prod)),
            )
        }
    }

    fn rsp_ring(&self) -> ByteRing {
        let p = self.page.as_ptr();
        unsafe {
            ByteRing::new(
                NonNull::new_unchecked(addr_of_mut!((*p).rsp)).cast(),
                axon_abi::STORE_RING_SIZE as u32,
                NonNull::new_unchecked(addr_of_mut!((*p).rsp_cons)),
                NonNull::new_unchecked(addr_of_mut!((*p).rsp_prod)),
            )
        }
    }

    pub fn write_request(&mut self, bytes: &[u8]) -> usize {
        self.req_ring().write(bytes)
    }

    pub fn read_reply(&mut self, buf: &mut [u8]) -> usize {
        self.rsp_ring().read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_abi::PAGE_SIZE;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use std::alloc::Layout;
    use std::collections::VecDeque;

    fn page() -> NonNull<u8> {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap()
    }

    // A self-contained ring for exercising ByteRing directly: buffer
    // and cursors owned by the test.
    struct Harness {
        _storage: Box<[u8; 2048]>,
        cons: Box<AtomicU32>,
        prod: Box<AtomicU32>,
        ring: ByteRing,
    }

    fn harness() -> Harness {
        let mut storage = Box::new([0u8; 2048]);
        let cons = Box::new(AtomicU32::new(0));
        let prod = Box::new(AtomicU32::new(0));
        let ring = unsafe {
            ByteRing::new(
                NonNull::new(storage.as_mut_ptr()).unwrap(),
                2048,
                NonNull::from(cons.as_ref()),
                NonNull::from(prod.as_ref()),
            )
        };
        Harness { _storage: storage, cons, prod, ring }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut h = harness();
        assert_eq!(h.ring.write(b"hello"), 5);
        let mut buf = [0u8; 5];
        assert_eq!(h.ring.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn partial_writes_concatenate() {
        let mut h = harness();
        assert_eq!(h.ring.write(b"hel"), 3);
        assert_eq!(h.ring.write(b"lo"), 2);
        let mut buf = [0u8; 5];
        assert_eq!(h.ring.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn full_ring_returns_a_short_count() {
        let mut h = harness();
        let oversized = vec![0xabu8; 2048 + 10];
        assert_eq!(h.ring.write(&oversized), 2048);
        assert_eq!(h.ring.write(b"x"), 0);
    }

    #[test]
    fn empty_ring_reads_zero_bytes() {
        let mut h = harness();
        let mut buf = [0u8; 16];
        assert_eq!(h.ring.read(&mut buf), 0);
    }

    #[test]
    fn data_survives_the_wrap_point() {
        let mut h = harness();
        // Park the cursors near the wrap.
        let filler = vec![0u8; 2040];
        assert_eq!(h.ring.write(&filler), 2040);
        let mut sink = vec![0u8; 2040];
        assert_eq!(h.ring.read(&mut sink), 2040);

        // This write spans the boundary: 8 bytes of room at the end.
        assert_eq!(h.ring.write(b"0123456789abcdef"), 16);
        let mut buf = [0u8; 16];
        assert_eq!(h.ring.read(&mut buf), 16);
        assert_eq!(&buf, b"0123456789abcdef");
    }

    #[test]
    fn console_view_uses_the_right_directions() {
        let mut console = unsafe { ConsoleRing::attach(page()) };
        assert_eq!(console.write(b"hi"), 2);
        let intf = unsafe { console.page.as_ref() };
        assert_eq!(intf.out_prod.load(Ordering::Relaxed), 2);
        assert_eq!(intf.output[..2], *b"hi");
        assert_eq!(intf.in_prod.load(Ordering::Relaxed), 0);

        // Backend delivers input.
        unsafe {
            let p = console.page.as_ptr();
            addr_of_mut!((*p).input).cast::<u8>().copy_from(b"ok".as_ptr(), 2);
        }
        intf.in_prod.store(2, Ordering::Relaxed);
        assert_eq!(console.input_available(), 2);
        let mut buf = [0u8; 8];
        assert_eq!(console.read(&mut buf), 2);
        assert_eq!(&buf[..2], b"ok");
        assert_eq!(intf.in_cons.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn store_view_round_trips_a_request_and_reply() {
        let mut store = unsafe { StoreRing::attach(page()) };
        assert_eq!(store.write_request(b"read /vm/name"), 13);
        let intf = unsafe { store.page.as_ref() };
        assert_eq!(intf.req_prod.load(Ordering::Relaxed), 13);
        assert_eq!(intf.req[..13], *b"read /vm/name");

        unsafe {
            let p = store.page.as_ptr();
            addr_of_mut!((*p).rsp).cast::<u8>().copy_from(b"guest0".as_ptr(), 6);
        }
        intf.rsp_prod.store(6, Ordering::Relaxed);
        let mut buf = [0u8; 16];
        assert_eq!(store.read_reply(&mut buf), 6);
        assert_eq!(&buf[..6], b"guest0");
    }

    proptest! {
        // Any interleaving of writes and reads keeps the cursor
        // invariant and preserves byte order against a queue model.
        #[test]
        fn cursor_invariant_and_fifo_hold_under_interleaving(
            ops in vec((any::<bool>(), vec(any::<u8>(), 0..600)), 1..60)
        ) {
            let mut h = harness();
            let mut model: VecDeque<u8> = VecDeque::new();
            for (is_write, data) in ops {
                if is_write {
                    let n = h.ring.write(&data);
                    prop_assert!(n <= data.len());
                    model.extend(&data[..n]);
                } else {
                    let mut buf = vec![0u8; data.len()];
                    let n = h.ring.read(&mut buf);
                    prop_assert!(n <= model.len());
                    for byte in &buf[..n] {
                        prop_assert_eq!(Some(*byte), model.pop_front());
                    }
                }
                let fill = h
                    .prod
                    .load(Ordering::Relaxed)
                    .wrapping_sub(h.cons.load(Ordering::Relaxed));
                prop_assert!(fill as usize <= h.ring.capacity());
                prop_assert_eq!(fill as usize, model.len());
            }
        }
    }
}
