// Copyright 2025 Axon Project Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]

//! CONTEXT: Page-granular buffers shared across the isolation boundary
//! OWNERS: @runtime
//! PUBLIC API: PageBuffer, HeapPages, BufError
//! INVARIANTS: Every accessor bounds-checks before touching memory; a
//!             buffer is returned to the allocator only at refcount zero.
//!
//! `PageBuffer` is the payload unit of the ring transports: a front end
//! wraps a fresh page, grants it to the peer, and carries the grant
//! reference inside ring slots. The reference count tracks how many
//! in-flight slots still name the page; freeing a page the peer may
//! still map would corrupt shared memory, so that path fails loudly.

extern crate alloc;

use core::cell::Cell;
use core::fmt;
use core::ptr::NonNull;

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use axon_abi::PAGE_SIZE;
use axon_hal::PageAllocator;

/// Errors surfaced by buffer operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufError {
    /// Offset plus access width exceeds the buffer size.
    OutOfBounds,
    /// The buffer is still referenced by in-flight I/O.
    RefsOutstanding,
    /// The buffer was already freed.
    Freed,
}

impl fmt::Display for BufError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds => write!(f, "access beyond buffer bounds"),
            Self::RefsOutstanding => write!(f, "buffer still referenced"),
            Self::Freed => write!(f, "buffer already freed"),
        }
    }
}

/// Heap-backed page pool: the guest's allocator already hands out
/// page-aligned zeroed memory, so this is a thin shim over it.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapPages;

impl HeapPages {
    fn layout() -> Layout {
        // SAFETY: PAGE_SIZE is a nonzero power of two.
        unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) }
    }
}

impl PageAllocator for HeapPages {
    fn alloc_page(&self) -> NonNull<u8> {
        // SAFETY: layout has nonzero size.
        let raw = unsafe { alloc_zeroed(Self::layout()) };
        match NonNull::new(raw) {
            Some(page) => page,
            None => handle_alloc_error(Self::layout()),
        }
    }

    unsafe fn free_page(&self, page: NonNull<u8>) {
        // SAFETY: caller guarantees the page came from alloc_page.
        unsafe { dealloc(page.as_ptr(), Self::layout()) };
    }
}

/// One page of memory with an explicit, cooperative reference count.
///
/// The count is not atomic: this type lives in the single-threaded
/// cooperative regime of the guest, and the count only tracks local
/// in-flight I/O, never the peer's view. `free` (and drop) enforce the
/// refcount-zero rule.
pub struct PageBuffer<A: PageAllocator> {
    page: Option<NonNull<u8>>,
    size: usize,
    refs: Cell<u32>,
    alloc: A,
}

impl<A: PageAllocator> PageBuffer<A> {
    /// Wraps one freshly allocated page, refcount zero.
    pub fn alloc(alloc: A) -> Self {
        let page = alloc.alloc_page();
        Self { page: Some(page), size: PAGE_SIZE, refs: Cell::new(0), alloc }
    }

    /// Total size in bytes (zero once freed).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current reference count.
    pub fn refs(&self) -> u32 {
        self.refs.get()
    }

    /// Notes one more in-flight user of the page.
    pub fn ref_incr(&self) {
        self.refs.set(self.refs.get() + 1);
    }

    /// Drops one in-flight user.
    pub fn ref_decr(&self) {
        let refs = self.refs.get();
        debug_assert!(refs > 0, "ref_decr below zero");
        self.refs.set(refs.saturating_sub(1));
    }

    /// Returns the page to the allocator.
    ///
    /// Fails (leaving the buffer intact) while the refcount is nonzero:
    /// some grant or ring slot still names this page.
    pub fn free(&mut self) -> Result<(), BufError> {
        if self.refs.get() != 0 {
            return Err(BufError::RefsOutstanding);
        }
        let page = self.page.take().ok_or(BufError::Freed)?;
        // SAFETY: page came from self.alloc and is no longer reachable.
        unsafe { self.alloc.free_page(page) };
        self.size = 0;
        Ok(())
    }

    /// Base address of the page, for formatting it as a shared ring.
    pub fn base(&self) -> Result<NonNull<u8>, BufError> {
        self.page.ok_or(BufError::Freed)
    }

    fn bytes(&self) -> Result<&[u8], BufError> {
        let page = self.page.ok_or(BufError::Freed)?;
        // SAFETY: page is live and self.size bytes long.
        Ok(unsafe { core::slice::from_raw_parts(page.as_ptr(), self.size) })
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8], BufError> {
        let page = self.page.ok_or(BufError::Freed)?;
        // SAFETY: page is live, self.size bytes long, and we hold &mut self.
        Ok(unsafe { core::slice::from_raw_parts_mut(page.as_ptr(), self.size) })
    }

    fn check(&self, off: usize, width: usize) -> Result<(), BufError> {
        if self.page.is_none() {
            return Err(BufError::Freed);
        }
        match off.checked_add(width) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(BufError::OutOfBounds),
        }
    }

    /// Reads the byte at `off`.
    pub fn get_byte(&self, off: usize) -> Result<u8, BufError> {
        self.check(off, 1)?;
        Ok(self.bytes()?[off])
    }

    /// Writes the byte at `off`.
    pub fn set_byte(&mut self, off: usize, v: u8) -> Result<(), BufError> {
        self.check(off, 1)?;
        self.bytes_mut()?[off] = v;
        Ok(())
    }

    /// Reads a big-endian u16 at `off`.
    pub fn get_u16_be(&self, off: usize) -> Result<u16, BufError> {
        self.check(off, 2)?;
        let b = self.bytes()?;
        Ok(u16::from_be_bytes([b[off], b[off + 1]]))
    }

    /// Writes a big-endian u16 at `off`.
    pub fn set_u16_be(&mut self, off: usize, v: u16) -> Result<(), BufError> {
        self.check(off, 2)?;
        self.bytes_mut()?[off..off + 2].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Reads a big-endian u32 at `off`.
    pub fn get_u32_be(&self, off: usize) -> Result<u32, BufError> {
        self.check(off, 4)?;
        let b = self.bytes()?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&b[off..off + 4]);
        Ok(u32::from_be_bytes(raw))
    }

    /// Writes a big-endian u32 at `off`.
    pub fn set_u32_be(&mut self, off: usize, v: u32) -> Result<(), BufError> {
        self.check(off, 4)?;
        self.bytes_mut()?[off..off + 4].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Reads a big-endian u64 at `off`.
    pub fn get_u64_be(&self, off: usize) -> Result<u64, BufError> {
        self.check(off, 8)?;
        let b = self.bytes()?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&b[off..off + 8]);
        Ok(u64::from_be_bytes(raw))
    }

    /// Writes a big-endian u64 at `off`.
    pub fn set_u64_be(&mut self, off: usize, v: u64) -> Result<(), BufError> {
        self.check(off, 8)?;
        self.bytes_mut()?[off..off + 8].copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Copies `src` into the buffer at `dst_off`.
    pub fn blit(&mut self, dst_off: usize, src: &[u8]) -> Result<(), BufError> {
        self.check(dst_off, src.len())?;
        self.bytes_mut()?[dst_off..dst_off + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Copies `len` bytes out of the buffer at `off`.
    pub fn read_into(&self, off: usize, dst: &mut [u8]) -> Result<(), BufError> {
        self.check(off, dst.len())?;
        dst.copy_from_slice(&self.bytes()?[off..off + dst.len()]);
        Ok(())
    }

    /// Copies `len` bytes from `src` at `src_off` into `self` at `dst_off`.
    pub fn blit_view<B: PageAllocator>(
        &mut self,
        dst_off: usize,
        src: &PageBuffer<B>,
        src_off: usize,
        len: usize,
    ) -> Result<(), BufError> {
        self.check(dst_off, len)?;
        src.check(src_off, len)?;
        self.bytes_mut()?[dst_off..dst_off + len]
            .copy_from_slice(&src.bytes()?[src_off..src_off + len]);
        Ok(())
    }

    /// Ones'-complement (Internet) checksum over `len` bytes at `off`,
    /// seeded with `initial`. Bytes pair into big-endian words; a
    /// trailing odd byte contributes its raw value.
    ///
    /// Writing the result into a zeroed checksum field inside the summed
    /// range and re-summing yields zero.
    pub fn ones_complement_checksum(
        &self,
        off: usize,
        len: usize,
        initial: u32,
    ) -> Result<u16, BufError> {
        self.check(off, len)?;
        let data = &self.bytes()?[off..off + len];
        let mut sum = initial;
        let mut chunks = data.chunks_exact(2);
        for pair in &mut chunks {
            sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
        }
        if let [last] = chunks.remainder() {
            sum += u32::from(*last);
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        Ok(!(sum as u16))
    }
}

impl<A: PageAllocator> Drop for PageBuffer<A> {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            // A shared page going away while grants or ring slots still
            // name it is a protocol violation, not a cleanup problem.
            assert!(self.refs.get() == 0, "page buffer dropped while still referenced");
            // SAFETY: page came from self.alloc and is no longer reachable.
            unsafe { self.alloc.free_page(page) };
        }
    }
}
