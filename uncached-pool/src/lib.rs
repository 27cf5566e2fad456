//! Page-pool allocator over uncached memory.
//!
//! Bus-master devices on non-coherent platforms need buffers the CPU can
//! touch without explicit cache maintenance. This crate manages such buffers:
//! the embedding firmware hands over a region it has mapped non-cacheable (or
//! write-combined) and identity-mapped, and the pool carves page-granular
//! allocations out of it.
//!
//! # Design Philosophy
//!
//! - **Zero firmware dependencies**: works on any platform that can provide
//!   a suitable region
//! - **Instance-based**: no global singleton; the owner decides lifetime and
//!   sharing
//! - **Exact-match free**: every free must name the page count used at
//!   allocation, so a stale or miscounted free is caught instead of
//!   corrupting the pool
//!
//! # Usage
//!
//! ```ignore
//! use uncached_pool::{UncachedPool, PoolRegion};
//!
//! // Region comes from the platform, already mapped UC/WC.
//! let mut pool = unsafe { UncachedPool::new(PoolRegion::new(base, size))? };
//!
//! let buf = pool.alloc_pages(4)?;
//! // ... device I/O through buf ...
//! unsafe { pool.dealloc_pages(buf, 4)? };
//! ```
//!
//! For callers that need a `Sync` pool shared between driver paths, wrap it
//! in [`SharedPool`].

#![no_std]

use core::ptr::NonNull;

/// Page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Maximum live allocations tracked per pool.
pub const MAX_ALLOCATIONS: usize = 128;

// ============================================================================
// Utility functions
// ============================================================================

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Align a value down to the given alignment.
#[inline]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

/// Convert pages to bytes.
#[inline]
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages * PAGE_SIZE
}

/// Convert bytes to pages (rounded up).
#[inline]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    align_up(bytes, PAGE_SIZE) / PAGE_SIZE
}

// ============================================================================
// Pool region
// ============================================================================

/// A memory region suitable for backing a pool.
///
/// The address doubles as the bus address: the region must be identity
/// mapped (or behind a translation the device side already accounts for).
#[derive(Debug, Clone, Copy)]
pub struct PoolRegion {
    /// Base address.
    pub base: usize,
    /// Size in bytes.
    pub size: usize,
}

impl PoolRegion {
    /// Create a new pool region.
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Whole pages contained in the region.
    pub const fn page_count(&self) -> usize {
        align_down(self.size, PAGE_SIZE) / PAGE_SIZE
    }

    /// Check if the region can back a pool (page-aligned, at least one page).
    pub const fn is_usable(&self) -> bool {
        self.base % PAGE_SIZE == 0 && self.base != 0 && self.page_count() >= 1
    }
}

// ============================================================================
// Error types
// ============================================================================

/// Pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Requested 0 pages.
    ZeroPages,
    /// Not enough contiguous space (or tracking slots) left in the pool.
    OutOfMemory,
    /// Region handed to the pool is misaligned or too small.
    InvalidRegion,
    /// Address was not produced by this pool.
    NotOwned,
    /// Page count does not match the count used at allocation.
    CountMismatch,
}

/// Result type for pool operations.
pub type Result<T> = core::result::Result<T, PoolError>;

// ============================================================================
// Allocation tracking
// ============================================================================

#[derive(Clone, Copy)]
struct Allocation {
    /// Offset from the pool base, in pages.
    offset: usize,
    pages: usize,
    live: bool,
}

impl Allocation {
    const fn empty() -> Self {
        Self { offset: 0, pages: 0, live: false }
    }

    const fn end(&self) -> usize {
        self.offset + self.pages
    }
}

// ============================================================================
// UncachedPool
// ============================================================================

/// Page allocator over a caller-supplied uncached region.
///
/// First-fit allocation with exact-match free: freed space is returned to
/// the pool and can satisfy later requests of any size that fits.
pub struct UncachedPool {
    base: usize,
    pages: usize,
    allocs: [Allocation; MAX_ALLOCATIONS],
}

impl UncachedPool {
    /// Take ownership of a region and zero it.
    ///
    /// # Safety
    ///
    /// - The region must be valid, writable memory mapped non-cacheable or
    ///   write-combined.
    /// - The region must be identity-mapped (address == bus address).
    /// - Nothing else may use the region for the lifetime of the pool.
    pub unsafe fn new(region: PoolRegion) -> Result<Self> {
        if !region.is_usable() {
            return Err(PoolError::InvalidRegion);
        }

        let pages = region.page_count();
        core::ptr::write_bytes(region.base as *mut u8, 0, pages_to_bytes(pages));

        log::debug!(
            "uncached pool at {:#x}: {} pages ({} KB)",
            region.base,
            pages,
            pages_to_bytes(pages) / 1024
        );

        Ok(Self {
            base: region.base,
            pages,
            allocs: [Allocation::empty(); MAX_ALLOCATIONS],
        })
    }

    /// Allocate contiguous pages. Memory is zeroed before return.
    pub fn alloc_pages(&mut self, pages: usize) -> Result<NonNull<u8>> {
        if pages == 0 {
            return Err(PoolError::ZeroPages);
        }

        let offset = self.find_fit(pages).ok_or(PoolError::OutOfMemory)?;

        let slot = match self.allocs.iter().position(|a| !a.live) {
            Some(slot) => slot,
            None => {
                log::warn!("uncached pool: allocation tracking exhausted");
                return Err(PoolError::OutOfMemory);
            }
        };
        self.allocs[slot] = Allocation { offset, pages, live: true };

        let addr = self.base + pages_to_bytes(offset);
        // SAFETY: addr lies inside the region validated at construction.
        unsafe {
            core::ptr::write_bytes(addr as *mut u8, 0, pages_to_bytes(pages));
        }

        log::trace!("pool alloc: {} pages at {:#x}", pages, addr);

        // addr is non-zero: the base was validated non-null at construction.
        NonNull::new(addr as *mut u8).ok_or(PoolError::OutOfMemory)
    }

    /// Lowest page offset where `pages` contiguous pages are free.
    ///
    /// Walks candidate offsets past any overlapping live allocation until
    /// the request fits or the pool is exhausted. The candidate only ever
    /// moves forward, so the scan terminates.
    fn find_fit(&self, pages: usize) -> Option<usize> {
        let mut candidate = 0usize;
        loop {
            if candidate + pages > self.pages {
                return None;
            }
            let mut moved = false;
            for alloc in self.allocs.iter().filter(|a| a.live) {
                if alloc.offset < candidate + pages && candidate < alloc.end() {
                    candidate = alloc.end();
                    moved = true;
                }
            }
            if !moved {
                return Some(candidate);
            }
        }
    }

    /// Release an allocation made with the same page count.
    ///
    /// The freed space becomes available to later `alloc_pages` calls.
    ///
    /// # Safety
    ///
    /// No device transfer may still target the allocation.
    pub unsafe fn dealloc_pages(&mut self, base: NonNull<u8>, pages: usize) -> Result<()> {
        let addr = base.as_ptr() as usize;
        if addr < self.base || addr >= self.base + pages_to_bytes(self.pages) {
            return Err(PoolError::NotOwned);
        }
        let rel = addr - self.base;
        if rel % PAGE_SIZE != 0 {
            return Err(PoolError::NotOwned);
        }
        let offset = rel / PAGE_SIZE;

        let alloc = self
            .allocs
            .iter_mut()
            .find(|a| a.live && a.offset == offset)
            .ok_or(PoolError::NotOwned)?;
        if alloc.pages != pages {
            return Err(PoolError::CountMismatch);
        }
        alloc.live = false;

        log::trace!("pool free: {} pages at {:#x}", pages, addr);
        Ok(())
    }

    /// Get remaining free space in bytes.
    pub fn free_space(&self) -> usize {
        let used: usize = self.allocs.iter().filter(|a| a.live).map(|a| a.pages).sum();
        pages_to_bytes(self.pages - used)
    }

    /// Get total pool size in bytes.
    pub fn total_size(&self) -> usize {
        pages_to_bytes(self.pages)
    }

    /// Get pool base address.
    pub fn base_address(&self) -> usize {
        self.base
    }

    /// Drop every allocation record.
    ///
    /// # Safety
    ///
    /// All previous allocations must be freed or abandoned.
    pub unsafe fn reset(&mut self) {
        for alloc in self.allocs.iter_mut() {
            *alloc = Allocation::empty();
        }
    }
}

// ============================================================================
// SharedPool
// ============================================================================

/// A pool behind a spinlock, for sharing between driver paths.
pub struct SharedPool {
    inner: spin::Mutex<UncachedPool>,
}

impl SharedPool {
    /// Wrap a pool for shared use.
    pub const fn new(pool: UncachedPool) -> Self {
        Self { inner: spin::Mutex::new(pool) }
    }

    /// Allocate contiguous pages. Memory is zeroed before return.
    pub fn alloc_pages(&self, pages: usize) -> Result<NonNull<u8>> {
        self.inner.lock().alloc_pages(pages)
    }

    /// Release an allocation made with the same page count.
    ///
    /// # Safety
    ///
    /// No device transfer may still target the allocation.
    pub unsafe fn dealloc_pages(&self, base: NonNull<u8>, pages: usize) -> Result<()> {
        self.inner.lock().dealloc_pages(base, pages)
    }

    /// Get remaining free space in bytes.
    pub fn free_space(&self) -> usize {
        self.inner.lock().free_space()
    }

    /// Get total pool size in bytes.
    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size()
    }

    /// Get pool base address.
    pub fn base_address(&self) -> usize {
        self.inner.lock().base_address()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA_PAGES: usize = 16;

    #[repr(C, align(4096))]
    struct Arena([u8; ARENA_PAGES * PAGE_SIZE]);

    impl Arena {
        fn new() -> Self {
            Arena([0xAA; ARENA_PAGES * PAGE_SIZE])
        }

        fn region(&mut self) -> PoolRegion {
            PoolRegion::new(self.0.as_mut_ptr() as usize, self.0.len())
        }
    }

    fn pool(arena: &mut Arena) -> UncachedPool {
        unsafe { UncachedPool::new(arena.region()).unwrap() }
    }

    #[test]
    fn test_align_functions() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(bytes_to_pages(1), 1);
        assert_eq!(bytes_to_pages(4096), 1);
        assert_eq!(bytes_to_pages(4097), 2);
    }

    #[test]
    fn test_region_usable() {
        assert!(PoolRegion::new(4096, 4096).is_usable());
        // Misaligned base
        assert!(!PoolRegion::new(4097, 8192).is_usable());
        // Too small to hold a page
        assert!(!PoolRegion::new(4096, 1024).is_usable());
        assert!(!PoolRegion::new(0, 8192).is_usable());
    }

    #[test]
    fn test_new_rejects_bad_region() {
        let mut arena = Arena::new();
        let base = arena.0.as_mut_ptr() as usize;
        let err = unsafe { UncachedPool::new(PoolRegion::new(base + 1, PAGE_SIZE)) };
        assert_eq!(err.err(), Some(PoolError::InvalidRegion));
    }

    #[test]
    fn test_alloc_zeroes_memory() {
        let mut arena = Arena::new();
        let mut pool = pool(&mut arena);

        let buf = pool.alloc_pages(2).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(buf.as_ptr(), 2 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_free_returns_space() {
        let mut arena = Arena::new();
        let mut pool = pool(&mut arena);

        // Exhaust the pool, free, and allocate again at the same spot.
        let buf = pool.alloc_pages(ARENA_PAGES).unwrap();
        assert_eq!(pool.free_space(), 0);
        unsafe { pool.dealloc_pages(buf, ARENA_PAGES).unwrap() };
        assert_eq!(pool.free_space(), pool.total_size());

        let again = pool.alloc_pages(ARENA_PAGES).unwrap();
        assert_eq!(again, buf);
    }

    #[test]
    fn test_first_fit_skips_live_allocations() {
        let mut arena = Arena::new();
        let mut pool = pool(&mut arena);

        let a = pool.alloc_pages(2).unwrap();
        let b = pool.alloc_pages(2).unwrap();
        unsafe { pool.dealloc_pages(a, 2).unwrap() };

        // A 4-page request no longer fits in the 2-page hole.
        let c = pool.alloc_pages(4).unwrap();
        assert_eq!(c.as_ptr() as usize, b.as_ptr() as usize + 2 * PAGE_SIZE);

        // A 2-page request reuses the hole.
        let d = pool.alloc_pages(2).unwrap();
        assert_eq!(d, a);
    }

    #[test]
    fn test_exhaustion() {
        let mut arena = Arena::new();
        let mut pool = pool(&mut arena);

        let _ = pool.alloc_pages(ARENA_PAGES - 1).unwrap();
        assert_eq!(pool.alloc_pages(2).err(), Some(PoolError::OutOfMemory));
        // The last page is still available.
        assert!(pool.alloc_pages(1).is_ok());
    }

    #[test]
    fn test_zero_pages_rejected() {
        let mut arena = Arena::new();
        let mut pool = pool(&mut arena);
        assert_eq!(pool.alloc_pages(0).err(), Some(PoolError::ZeroPages));
    }

    #[test]
    fn test_dealloc_count_mismatch_rejected() {
        let mut arena = Arena::new();
        let mut pool = pool(&mut arena);

        let buf = pool.alloc_pages(4).unwrap();
        let err = unsafe { pool.dealloc_pages(buf, 2) };
        assert_eq!(err.err(), Some(PoolError::CountMismatch));
        // The allocation is still live after the rejected free.
        assert_eq!(pool.free_space(), pool.total_size() - pages_to_bytes(4));
        unsafe { pool.dealloc_pages(buf, 4).unwrap() };
    }

    #[test]
    fn test_dealloc_foreign_address_rejected() {
        let mut arena = Arena::new();
        let mut other = Arena::new();
        let mut pool = pool(&mut arena);

        let foreign = NonNull::new(other.0.as_mut_ptr()).unwrap();
        let err = unsafe { pool.dealloc_pages(foreign, 1) };
        assert_eq!(err.err(), Some(PoolError::NotOwned));

        // In-range but never allocated.
        let buf = pool.alloc_pages(1).unwrap();
        let hole = unsafe { NonNull::new_unchecked(buf.as_ptr().add(PAGE_SIZE)) };
        let err = unsafe { pool.dealloc_pages(hole, 1) };
        assert_eq!(err.err(), Some(PoolError::NotOwned));
    }

    #[test]
    fn test_shared_pool() {
        let mut arena = Arena::new();
        let shared = SharedPool::new(pool(&mut arena));

        let buf = shared.alloc_pages(2).unwrap();
        assert_eq!(shared.free_space(), shared.total_size() - pages_to_bytes(2));
        unsafe { shared.dealloc_pages(buf, 2).unwrap() };
        assert_eq!(shared.free_space(), shared.total_size());
    }
}
