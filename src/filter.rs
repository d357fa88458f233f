use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

use embedded_can::{ExtendedId, Id, StandardId};
use heapless::Vec;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::frame::BusHandle;
use crate::gateway::ConfigError;

/// Number of entries the acceptance table can hold across all buses.
pub const FILTER_TABLE_SIZE: usize = 64;

/// Acceptance filter mode, set with
/// [`Gateway::set_filter_mode`](crate::Gateway::set_filter_mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FilterMode {
    /// Match incoming ids against the table entries.
    Filtered = 0,
    /// Filtering off: no frames are delivered on any bus. This mirrors the
    /// acceptance filter hardware, where the off state ignores all reception;
    /// it is also what makes table mutation safe while traffic flows, since a
    /// half-built table must not let frames through.
    #[default]
    Off = 1,
    /// Table bypassed: every frame is delivered.
    Bypass = 2,
}

/// An id or inclusive id range to accept, in either id width. Replaces the
/// classic "single id, with an optional end-of-range argument" call shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterId {
    /// Single 11-bit id.
    Standard(#[cfg_attr(feature = "defmt", defmt(Debug2Format))] StandardId),
    /// Inclusive 11-bit id range. The bounds may be given in either order.
    StandardRange(
        #[cfg_attr(feature = "defmt", defmt(Debug2Format))] StandardId,
        #[cfg_attr(feature = "defmt", defmt(Debug2Format))] StandardId,
    ),
    /// Single 29-bit id.
    Extended(#[cfg_attr(feature = "defmt", defmt(Debug2Format))] ExtendedId),
    /// Inclusive 29-bit id range. The bounds may be given in either order.
    ExtendedRange(
        #[cfg_attr(feature = "defmt", defmt(Debug2Format))] ExtendedId,
        #[cfg_attr(feature = "defmt", defmt(Debug2Format))] ExtendedId,
    ),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum IdWidth {
    Standard,
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FilterEntry {
    width: IdWidth,
    bus: BusHandle,
    low: u32,
    high: u32,
}

impl FilterEntry {
    fn key(&self) -> (IdWidth, BusHandle, u32) {
        (self.width, self.bus, self.low)
    }

    /// True when the ranges overlap or sit directly next to each other, so
    /// one covering entry can replace both.
    fn touches(&self, low: u32, high: u32) -> bool {
        self.low <= high.saturating_add(1) && low <= self.high.saturating_add(1)
    }
}

/// The acceptance filter table shared by all channels: a sorted list of
/// single ids and id ranges per bus and id width.
///
/// Every mutation ([`init`], [`add`]) leaves the table in [`FilterMode::Off`]
/// so reception never observes a half-updated table; an explicit
/// [`set_mode`] call re-enables filtering once the table is final.
///
/// [`init`]: FilterTable::init
/// [`add`]: FilterTable::add
/// [`set_mode`]: FilterTable::set_mode
pub struct FilterTable {
    mode: AtomicU8,
    entries: UnsafeCell<Vec<FilterEntry, FILTER_TABLE_SIZE>>,
}

// SAFETY: `entries` is mutated only from main level, and every mutation first
// forces `mode` to `Off` with a Release store. The interrupt side reads
// `mode` with Acquire and touches `entries` only in `Filtered` mode, so on
// the single-core model (interrupts preempt main, never the reverse) a
// mutation in progress is never observed.
unsafe impl Sync for FilterTable {}

impl FilterTable {
    pub(crate) const fn new() -> Self {
        Self {
            mode: AtomicU8::new(FilterMode::Off as u8),
            entries: UnsafeCell::new(Vec::new()),
        }
    }

    /// Clears all entries. Returns with filtering off.
    pub fn init(&self) {
        self.mode.store(FilterMode::Off.into(), Ordering::Release);
        // SAFETY: reception is off as of the store above; no other context
        // reads the entries until `set_mode` re-enables filtering.
        unsafe { (*self.entries.get()).clear() };
    }

    pub fn mode(&self) -> FilterMode {
        FilterMode::from(self.mode.load(Ordering::Acquire))
    }

    /// Switches the filter mode. Use after [`init`](FilterTable::init) and
    /// any [`add`](FilterTable::add) calls to (re-)enable reception.
    pub fn set_mode(&self, mode: FilterMode) {
        self.mode.store(mode.into(), Ordering::Release);
    }

    /// Adds an id or id range for `bus` to the table, keeping it sorted.
    /// An entry that overlaps or abuts an existing entry of the same bus and
    /// id width is merged with it into one covering range, so re-adding the
    /// same id is not an error and never grows the table.
    ///
    /// Returns with filtering off.
    pub fn add(&self, bus: BusHandle, id: FilterId) -> Result<(), ConfigError> {
        self.mode.store(FilterMode::Off.into(), Ordering::Release);

        let (width, a, b) = match id {
            FilterId::Standard(id) => (IdWidth::Standard, id.as_raw() as u32, id.as_raw() as u32),
            FilterId::StandardRange(lo, hi) => {
                (IdWidth::Standard, lo.as_raw() as u32, hi.as_raw() as u32)
            }
            FilterId::Extended(id) => (IdWidth::Extended, id.as_raw(), id.as_raw()),
            FilterId::ExtendedRange(lo, hi) => (IdWidth::Extended, lo.as_raw(), hi.as_raw()),
        };
        let mut new = FilterEntry {
            width,
            bus,
            low: a.min(b),
            high: a.max(b),
        };

        // SAFETY: reception is off as of the store above.
        let entries = unsafe { &mut *self.entries.get() };

        // Absorb every entry the new one overlaps or abuts, widening the new
        // entry to cover them.
        let mut i = 0;
        while i < entries.len() {
            let entry = entries[i];
            if entry.width == width && entry.bus == bus && entry.touches(new.low, new.high) {
                new.low = new.low.min(entry.low);
                new.high = new.high.max(entry.high);
                entries.remove(i);
            } else {
                i += 1;
            }
        }

        let at = entries.partition_point(|entry| entry.key() <= new.key());
        entries
            .insert(at, new)
            .map_err(|_| ConfigError::TableFull)?;
        Ok(())
    }

    /// Number of entries currently in the table.
    pub fn entry_count(&self) -> usize {
        // SAFETY: main-level read; mutation happens on the same level.
        unsafe { (&(*self.entries.get())).len() }
    }

    /// Whether a frame with this id may be delivered on `bus`. Callable from
    /// the receive interrupt.
    pub fn matches(&self, bus: BusHandle, id: Id) -> bool {
        match self.mode() {
            FilterMode::Bypass => true,
            FilterMode::Off => false,
            FilterMode::Filtered => {
                let (width, raw) = match id {
                    Id::Standard(id) => (IdWidth::Standard, id.as_raw() as u32),
                    Id::Extended(id) => (IdWidth::Extended, id.as_raw()),
                };

                // SAFETY: `Filtered` mode guarantees no mutation is in
                // progress (mutation forces `Off` first).
                let entries = unsafe { &*self.entries.get() };

                // Entries of one (width, bus) group are sorted and disjoint,
                // so the only candidate is the last entry at or below `raw`.
                let i = entries.partition_point(|entry| entry.key() <= (width, bus, raw));
                i > 0 && {
                    let entry = &entries[i - 1];
                    entry.width == width && entry.bus == bus && entry.high >= raw
                }
            }
        }
    }
}
