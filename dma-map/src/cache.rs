//! Cache-maintenance capability boundary.
//!
//! The platform discovers a cache-maintenance capability and the data-cache
//! line size once at startup and binds them into a [`CoherencyContext`].
//! Discovery failure is fatal by construction: without the capability no
//! coherency guarantee can be given, so there is nothing to hand to
//! [`CoherencyContext::new`] and no mapper can be built.

use crate::range::ByteRange;
use crate::{DmaError, Result};

/// Failure reported by the platform cache-maintenance capability.
///
/// Raised when the hardware cannot commit the requested range to memory.
/// The mapper surfaces it verbatim as [`DmaError::DeviceError`]; it is
/// never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFault;

/// Data-cache maintenance over byte ranges.
///
/// Implemented by the platform layer (CP15 / `dc` ops on Arm, `clflush`
/// loops on x86). All three operations act on whole cache lines covering
/// the range.
pub trait CacheMaintenance {
    /// Write dirty lines in the range back to memory.
    fn flush(&self, range: ByteRange) -> core::result::Result<(), CacheFault>;

    /// Discard cached lines for the range so the next access re-fetches.
    fn invalidate(&self, range: ByteRange) -> core::result::Result<(), CacheFault>;

    /// Write back and discard in one pass.
    fn flush_invalidate(&self, range: ByteRange) -> core::result::Result<(), CacheFault>;
}

impl<'a, C: CacheMaintenance + ?Sized> CacheMaintenance for &'a C {
    fn flush(&self, range: ByteRange) -> core::result::Result<(), CacheFault> {
        (**self).flush(range)
    }
    fn invalidate(&self, range: ByteRange) -> core::result::Result<(), CacheFault> {
        (**self).invalidate(range)
    }
    fn flush_invalidate(&self, range: ByteRange) -> core::result::Result<(), CacheFault> {
        (**self).flush_invalidate(range)
    }
}

/// Cache capability plus cache-line size, fixed at startup.
///
/// Immutable after construction; safe to share read-only.
pub struct CoherencyContext<C> {
    cache: C,
    line_size: usize,
}

impl<C: CacheMaintenance> CoherencyContext<C> {
    /// Bind the discovered capability to the discovered line size.
    ///
    /// The line size must be a non-zero power of two (it is used as an
    /// alignment mask).
    pub fn new(cache: C, line_size: usize) -> Result<Self> {
        if line_size == 0 || !line_size.is_power_of_two() {
            return Err(DmaError::InvalidArgument);
        }
        log::debug!("coherency context: {} byte cache lines", line_size);
        Ok(Self { cache, line_size })
    }

    /// Cache-line size in bytes.
    #[inline]
    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// The bound capability.
    #[inline]
    pub fn cache(&self) -> &C {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopCache;

    impl CacheMaintenance for NopCache {
        fn flush(&self, _: ByteRange) -> core::result::Result<(), CacheFault> {
            Ok(())
        }
        fn invalidate(&self, _: ByteRange) -> core::result::Result<(), CacheFault> {
            Ok(())
        }
        fn flush_invalidate(&self, _: ByteRange) -> core::result::Result<(), CacheFault> {
            Ok(())
        }
    }

    #[test]
    fn test_line_size_validation() {
        assert!(CoherencyContext::new(NopCache, 64).is_ok());
        assert_eq!(
            CoherencyContext::new(NopCache, 0).err(),
            Some(DmaError::InvalidArgument)
        );
        assert_eq!(
            CoherencyContext::new(NopCache, 48).err(),
            Some(DmaError::InvalidArgument)
        );
    }
}
