//! Buffer allocation for bounce buffers and caller-owned common buffers.
//!
//! Two pools back the allocator, one per lifetime category. Both must hand
//! out memory mapped non-cacheable or write-combined, so CPU accesses are
//! coherent with the device without explicit maintenance.

use core::ptr::NonNull;

use uncached_pool::{PoolError, SharedPool, UncachedPool};

use crate::{DmaError, Result};

/// Lifetime category of a buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferCategory {
    /// Scoped to the current boot phase; reclaimed at handoff.
    Transient,
    /// Must stay valid across the OS handoff.
    Persistent,
}

/// Why a pool refused to release an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// The address was not produced by this pool.
    NotOwned,
    /// The page count does not match the count used at allocation.
    CountMismatch,
}

/// Page-granular uncached memory source backing one category.
pub trait UncachedPages {
    /// Allocate contiguous uncached pages, or `None` when exhausted.
    fn reserve_pages(&mut self, pages: usize) -> Option<NonNull<u8>>;

    /// Release an allocation made with the same page count.
    ///
    /// # Safety
    ///
    /// No device transfer may still target the allocation.
    unsafe fn release_pages(
        &mut self,
        base: NonNull<u8>,
        pages: usize,
    ) -> core::result::Result<(), FreeError>;
}

fn free_error(err: PoolError) -> FreeError {
    match err {
        PoolError::CountMismatch => FreeError::CountMismatch,
        _ => FreeError::NotOwned,
    }
}

impl UncachedPages for UncachedPool {
    fn reserve_pages(&mut self, pages: usize) -> Option<NonNull<u8>> {
        self.alloc_pages(pages).ok()
    }

    unsafe fn release_pages(
        &mut self,
        base: NonNull<u8>,
        pages: usize,
    ) -> core::result::Result<(), FreeError> {
        self.dealloc_pages(base, pages).map_err(free_error)
    }
}

impl UncachedPages for SharedPool {
    fn reserve_pages(&mut self, pages: usize) -> Option<NonNull<u8>> {
        self.alloc_pages(pages).ok()
    }

    unsafe fn release_pages(
        &mut self,
        base: NonNull<u8>,
        pages: usize,
    ) -> core::result::Result<(), FreeError> {
        self.dealloc_pages(base, pages).map_err(free_error)
    }
}

// A shared pool can back the allocator by reference, so drivers keep their
// own handle to the same pool.
impl<'a> UncachedPages for &'a SharedPool {
    fn reserve_pages(&mut self, pages: usize) -> Option<NonNull<u8>> {
        self.alloc_pages(pages).ok()
    }

    unsafe fn release_pages(
        &mut self,
        base: NonNull<u8>,
        pages: usize,
    ) -> core::result::Result<(), FreeError> {
        self.dealloc_pages(base, pages).map_err(free_error)
    }
}

/// Routes each category to its own uncached pool.
pub struct BufferAllocator<B> {
    transient: B,
    persistent: B,
}

impl<B: UncachedPages> BufferAllocator<B> {
    /// Build the allocator from one backing pool per category.
    pub fn new(transient: B, persistent: B) -> Self {
        Self { transient, persistent }
    }

    /// Allocate `pages` uncached pages from the category's pool.
    pub fn allocate(&mut self, category: BufferCategory, pages: usize) -> Result<NonNull<u8>> {
        if pages == 0 {
            return Err(DmaError::InvalidArgument);
        }
        let pool = match category {
            BufferCategory::Transient => &mut self.transient,
            BufferCategory::Persistent => &mut self.persistent,
        };
        pool.reserve_pages(pages).ok_or_else(|| {
            log::warn!("buffer allocation failed: {:?}, {} pages", category, pages);
            DmaError::OutOfResources
        })
    }

    /// Release an allocation made with the same page count.
    ///
    /// The owning pool is found by the address itself; the caller does not
    /// name the category again.
    ///
    /// # Safety
    ///
    /// No device transfer may still target the allocation.
    pub unsafe fn free(&mut self, base: NonNull<u8>, pages: usize) -> Result<()> {
        match self.transient.release_pages(base, pages) {
            Ok(()) => return Ok(()),
            Err(FreeError::CountMismatch) => return Err(DmaError::InvalidArgument),
            Err(FreeError::NotOwned) => {}
        }
        match self.persistent.release_pages(base, pages) {
            Ok(()) => Ok(()),
            Err(_) => Err(DmaError::InvalidArgument),
        }
    }
}
