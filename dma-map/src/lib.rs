//! Cache-coherent DMA mapping.
//!
//! Lets a bus-master device read or write host memory on platforms where the
//! device does not participate in CPU cache coherency. Per transfer, the
//! mapper either operates directly on the caller's buffer with explicit cache
//! maintenance, or relocates the transfer through a dedicated uncached bounce
//! buffer. Either way, once a mapping is torn down, CPU-visible and
//! device-visible memory agree.
//!
//! # Architecture
//!
//! ```text
//! caller ──► DmaMapper::map ──► BusTranslate        (host addr -> bus addr)
//!                          ├──► BufferAllocator     (bounce/common buffers)
//!                          └──► CacheMaintenance    (flush / invalidate)
//!        ◄── Mapping handle
//!
//!        ... device transfer happens outside this crate ...
//!
//! caller ──► DmaMapper::unmap(handle) ──► copy-back / invalidate / free
//! ```
//!
//! The capabilities on the right are platform-supplied: the mapper is handed
//! a [`CoherencyContext`] (cache-maintenance capability plus the data-cache
//! line size), a [`BusTranslate`] implementation, and two uncached page pools
//! at startup. A platform that cannot provide cache maintenance must not
//! construct a mapper at all; there is no uncoherent fallback.
//!
//! # Direct vs bounced
//!
//! The choice is made once per mapping, from the alignment of the host
//! buffer: a buffer not aligned to the cache line cannot be flushed or
//! invalidated without clobbering its neighbors, so the transfer bounces
//! through pool memory instead. Lengths are always trimmed down to whole
//! cache lines; the trailing partial line is outside maintenance control and
//! the trimmed length is reported back so the caller can map the remainder
//! separately.

#![no_std]

pub mod buffer;
pub mod cache;
pub mod map;
pub mod range;
pub mod translate;

pub use buffer::{BufferAllocator, BufferCategory, FreeError, UncachedPages};
pub use cache::{CacheFault, CacheMaintenance, CoherencyContext};
pub use map::{DmaMapper, DmaOperation, Mapping, MAX_MAPPINGS};
pub use range::ByteRange;
pub use translate::{BusTranslate, IdentityTranslator};

/// Mapping and buffer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// A required argument was null, empty, out of range, or did not match
    /// a prior allocation.
    InvalidArgument,
    /// A record slot or buffer allocation could not be satisfied.
    OutOfResources,
    /// The platform cache-maintenance capability reported a failure.
    DeviceError,
    /// Reserved for operation kinds this mapper does not implement.
    UnsupportedOperation,
}

/// Result type for mapping operations.
pub type Result<T> = core::result::Result<T, DmaError>;
