//! Map/unmap orchestration for bus-master transfers.
//!
//! ```text
//! map(op, host range)
//!   │
//!   ├─ host base cache-line aligned? ──no──► bounce: uncached pages,
//!   │                                        bus addr = bounce addr
//!   └─ yes ──► direct: bus addr = translate(host),
//!              flush+invalidate before the device touches memory
//!
//! unmap(handle)
//!   ├─ bounced read ──► copy bounce -> host, free bounce
//!   ├─ bounced other ─► free bounce
//!   └─ direct write ──► invalidate (CPU must re-fetch what the device wrote)
//! ```
//!
//! A mapping is live from `map` to `unmap` and owned exclusively by the
//! holder of its [`Mapping`] handle. The handle is move-only and consumed
//! by `unmap`, so a released mapping cannot be named again.

use core::ptr::NonNull;

use uncached_pool::bytes_to_pages;

use crate::buffer::{BufferAllocator, BufferCategory, UncachedPages};
use crate::cache::{CacheMaintenance, CoherencyContext};
use crate::range::{copy_exact, ByteRange};
use crate::translate::BusTranslate;
use crate::{DmaError, Result};

/// Maximum concurrently live mappings.
pub const MAX_MAPPINGS: usize = 128;

/// What the bus master will do with the mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaOperation {
    /// Device fills the range; data is brought home at unmap.
    BusMasterRead,
    /// CPU data is made visible to the device at map time.
    BusMasterWrite,
    /// Bidirectional buffer; the caller manages coherency over its lifetime.
    CommonBuffer,
}

/// Bounce buffer attached to a mapping.
#[derive(Clone, Copy)]
struct Bounce {
    base: NonNull<u8>,
    /// Page count used at allocation; the free must supply the same count.
    pages: usize,
}

/// Per-mapping record, held from map to unmap.
struct MapRecord {
    /// Host range under maintenance control (length already trimmed to
    /// whole cache lines).
    host: ByteRange,
    op: DmaOperation,
    bounce: Option<Bounce>,
}

struct Slot {
    record: Option<MapRecord>,
    generation: u16,
    reserved: bool,
}

const EMPTY_SLOT: Slot = Slot { record: None, generation: 0, reserved: false };

/// Fixed-capacity record slab. Slots are reserved before a map is attempted
/// and only committed once every fallible step has passed, so a failed map
/// never leaves a record behind.
struct MapTable {
    slots: [Slot; MAX_MAPPINGS],
    live: usize,
}

impl MapTable {
    const fn new() -> Self {
        Self { slots: [EMPTY_SLOT; MAX_MAPPINGS], live: 0 }
    }

    fn reserve(&mut self) -> Option<usize> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.record.is_none() && !s.reserved)?;
        self.slots[slot].reserved = true;
        Some(slot)
    }

    fn cancel(&mut self, slot: usize) {
        self.slots[slot].reserved = false;
    }

    fn commit(&mut self, slot: usize, record: MapRecord) -> u16 {
        let s = &mut self.slots[slot];
        s.record = Some(record);
        s.reserved = false;
        self.live += 1;
        s.generation
    }

    /// Remove and return the record if slot and generation match.
    /// Bumps the generation so the slot's next tenant gets fresh handles.
    fn take(&mut self, slot: usize, generation: u16) -> Option<MapRecord> {
        let s = self.slots.get_mut(slot)?;
        if s.generation != generation {
            return None;
        }
        let record = s.record.take()?;
        s.generation = s.generation.wrapping_add(1);
        self.live -= 1;
        Some(record)
    }

    fn live(&self) -> usize {
        self.live
    }
}

/// Owned handle to a live mapping.
///
/// Move-only: `unmap` consumes it, ending the mapping. Dropping the handle
/// without unmapping leaks the record (and any bounce buffer) but is safe.
#[must_use = "a mapping stays live until passed to unmap"]
pub struct Mapping {
    slot: u16,
    generation: u16,
    bus: u64,
    len: usize,
}

impl Mapping {
    /// Address the device uses for the transfer.
    #[inline]
    pub fn bus_addr(&self) -> u64 {
        self.bus
    }

    /// Bytes actually under maintenance control (requested length rounded
    /// down to whole cache lines). The caller may map the remainder
    /// separately.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl core::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mapping")
            .field("bus", &format_args!("{:#x}", self.bus))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

/// The mapper: decides direct vs bounced per transfer, performs the pre- and
/// post-transfer synchronization, and owns the mapping records.
///
/// All platform capabilities are bound at construction; there is no global
/// state. Map and unmap are synchronous and single-threaded (`&mut self`);
/// callers arbitrate concurrent access to overlapping host ranges.
pub struct DmaMapper<C, T, B> {
    ctx: CoherencyContext<C>,
    translator: T,
    buffers: BufferAllocator<B>,
    table: MapTable,
}

impl<C, T, B> DmaMapper<C, T, B>
where
    C: CacheMaintenance,
    T: BusTranslate,
    B: UncachedPages,
{
    /// Build a mapper from the platform capabilities discovered at startup.
    pub fn new(ctx: CoherencyContext<C>, translator: T, buffers: BufferAllocator<B>) -> Self {
        Self { ctx, translator, buffers, table: MapTable::new() }
    }

    /// Map a host range for a bus-master transfer.
    ///
    /// Returns the bus address and the length actually under maintenance
    /// control; see [`Mapping::len`] for the trimming contract. A failed
    /// map leaves no observable state behind.
    ///
    /// # Safety
    ///
    /// - `host` must be valid, writable memory for the whole mapping
    ///   lifetime.
    /// - The range must not be concurrently mapped by another live mapping.
    pub unsafe fn map(&mut self, op: DmaOperation, host: ByteRange) -> Result<Mapping> {
        if host.base() == 0 || host.is_empty() || host.end().is_none() {
            return Err(DmaError::InvalidArgument);
        }

        let line = self.ctx.line_size();
        let mut bus = self.translator.bus_addr(host.base());

        let slot = self.table.reserve().ok_or(DmaError::OutOfResources)?;

        // Misaligned buffers cannot be flushed without clobbering their
        // neighbors' cache lines; relocate the transfer instead.
        let mut bounce = None;
        if !host.is_aligned_to(line) {
            let pages = bytes_to_pages(host.len());
            match self.buffers.allocate(BufferCategory::Transient, pages) {
                Ok(base) => {
                    bus = base.as_ptr() as u64;
                    bounce = Some(Bounce { base, pages });
                    log::trace!(
                        "bounce map: host {:?} -> {:#x} ({} pages)",
                        host,
                        bus,
                        pages
                    );
                }
                Err(err) => {
                    self.table.cancel(slot);
                    return Err(err);
                }
            }
        }

        // Maintenance only covers whole cache lines; the trailing partial
        // line is the caller's to map separately.
        let synced = host.trim_to(line);

        match (&bounce, op) {
            // Device reads from the bounce buffer; stage the data now.
            (Some(b), DmaOperation::BusMasterWrite) => {
                copy_exact(synced, ByteRange::new(b.base.as_ptr() as usize, synced.len()));
            }
            // Read/common bounces carry nothing until unmap.
            (Some(_), _) => {}
            // Dirty lines must reach memory before the device looks at it,
            // and the CPU must not later serve stale lines over what the
            // device wrote.
            (None, DmaOperation::BusMasterWrite | DmaOperation::BusMasterRead) => {
                if !synced.is_empty() {
                    if self.ctx.cache().flush_invalidate(synced).is_err() {
                        self.table.cancel(slot);
                        return Err(DmaError::DeviceError);
                    }
                }
            }
            (None, DmaOperation::CommonBuffer) => {}
        }

        let generation = self.table.commit(slot, MapRecord { host: synced, op, bounce });
        Ok(Mapping { slot: slot as u16, generation, bus, len: synced.len() })
    }

    /// Tear down a mapping, completing the coherency round trip.
    ///
    /// # Safety
    ///
    /// The device transfer targeting this mapping must have completed.
    pub unsafe fn unmap(&mut self, mapping: Mapping) -> Result<()> {
        let record = self
            .table
            .take(mapping.slot as usize, mapping.generation)
            .ok_or(DmaError::InvalidArgument)?;

        match record.bounce {
            Some(b) => {
                // Bring device-written data home before the buffer goes away.
                if record.op == DmaOperation::BusMasterRead {
                    copy_exact(
                        ByteRange::new(b.base.as_ptr() as usize, record.host.len()),
                        record.host,
                    );
                }
                self.buffers.free(b.base, b.pages)?;
            }
            None => {
                // The device may have written underneath the cache; drop any
                // lines shadowing the range so the CPU re-fetches.
                if record.op == DmaOperation::BusMasterWrite && !record.host.is_empty() {
                    self.ctx
                        .cache()
                        .invalidate(record.host)
                        .map_err(|_| DmaError::DeviceError)?;
                }
            }
        }

        Ok(())
    }

    /// Allocate an uncached common buffer the caller drives directly.
    ///
    /// The returned address is also the bus address (the pools are identity
    /// mapped), so the buffer needs no map/unmap round trip.
    pub fn alloc_buffer(&mut self, category: BufferCategory, pages: usize) -> Result<NonNull<u8>> {
        self.buffers.allocate(category, pages)
    }

    /// Free a buffer from [`alloc_buffer`](Self::alloc_buffer) with the
    /// exact page count used at allocation.
    ///
    /// # Safety
    ///
    /// No device transfer may still target the buffer.
    pub unsafe fn free_buffer(&mut self, base: NonNull<u8>, pages: usize) -> Result<()> {
        self.buffers.free(base, pages)
    }

    /// Number of live mappings.
    pub fn live_mappings(&self) -> usize {
        self.table.live()
    }

    /// Cache-line size the mapper aligns and trims against.
    pub fn line_size(&self) -> usize {
        self.ctx.line_size()
    }
}
