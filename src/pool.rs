use crate::Precedes;
use std::sync::atomic::{AtomicU64, Ordering};

/// State of one slot in the pool.
///
/// A slot in `Reading` or `Writing` has its I/O lock held exclusively by the
/// task driving the transfer (or abandoned by one that died; see
/// [crate::Cache]'s wait protocol).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageState {
    /// The slot holds no page.
    Empty,
    /// The slot is being filled from disk. Never dirty.
    Reading,
    /// A prior image of the slot's page is being written to disk. The page
    /// may be re-dirtied while the write is in flight.
    Writing,
    /// The slot holds a usable page.
    Valid,
}

/// One page-sized buffer and its metadata.
pub(crate) struct Slot {
    pub state: PageState,
    pub dirty: bool,
    /// The page held. Meaningful only when `state != Empty`.
    pub page: u64,
    /// Tick of the last access. Updated with relaxed ordering, possibly under
    /// a shared pool lock; see [Pool::touch].
    pub used: AtomicU64,
    /// Highest redo-log position recorded for each group of entries in the
    /// page. Empty when write-ahead ordering is disabled.
    pub lsns: Vec<u64>,
    /// The page bytes.
    pub data: Vec<u8>,
}

impl Slot {
    fn new(page_size: usize, lsn_groups: usize) -> Self {
        Self {
            state: PageState::Empty,
            dirty: false,
            page: 0,
            used: AtomicU64::new(0),
            lsns: vec![0; lsn_groups],
            data: vec![0; page_size],
        }
    }

    /// Whether the slot can be repurposed without I/O.
    pub fn freeable(&self) -> bool {
        self.state == PageState::Empty || (self.state == PageState::Valid && !self.dirty)
    }
}

/// Outcome of one victim-selection pass over the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Choice {
    /// The target page is already resident in this slot (any non-empty state).
    Resident(usize),
    /// This slot is empty or clean and can be repurposed immediately.
    Reusable(usize),
    /// The least-recently-used candidate is dirty and must be written first.
    Dirty(usize),
    /// The least-recently-used candidate has I/O in flight; wait for it.
    Busy(usize),
}

/// Fixed pool of page buffers shared by all clones of a cache.
///
/// The pool is guarded by a single reader/writer lock (the control lock).
/// All fields may be mutated only under the exclusive lock, with one
/// exception: the access ticks, which [Pool::touch] advances under either
/// mode. Because of that, tick reads and writes are atomic but deliberately
/// unordered; racing touches can regress `tick` or individual `used` values,
/// and [Pool::select] repairs any regression it observes. The worst outcome
/// of such a race is a non-optimal eviction choice.
pub(crate) struct Pool {
    pub page_size: usize,
    pub lsn_groups: usize,
    /// The logically-active page. Never chosen for eviction. The embedder
    /// must set it before the pool fills (zeroing a page updates it).
    pub latest: u64,
    /// Source of access ticks.
    tick: AtomicU64,
    pub slots: Vec<Slot>,
}

impl Pool {
    pub fn new(slots: usize, page_size: usize, lsn_groups: usize) -> Self {
        Self {
            page_size,
            lsn_groups,
            latest: 0,
            tick: AtomicU64::new(0),
            slots: (0..slots).map(|_| Slot::new(page_size, lsn_groups)).collect(),
        }
    }

    /// Returns the slot holding `page`, if any.
    pub fn find(&self, page: u64) -> Option<usize> {
        // Plain linear search: traffic concentrates on the few newest pages,
        // so a small pool scanned linearly beats maintaining an index.
        self.slots
            .iter()
            .position(|slot| slot.state != PageState::Empty && slot.page == page)
    }

    /// Mark a slot recently used.
    ///
    /// The tick is only advanced when the slot is not already the most recent
    /// holder: consecutive accesses to the same page (overwhelmingly the
    /// newest one) would otherwise age every other page spuriously.
    pub fn touch(&self, slotno: usize) {
        let tick = self.tick.load(Ordering::Relaxed);
        let slot = &self.slots[slotno];
        if slot.used.load(Ordering::Relaxed) != tick {
            self.tick.store(tick + 1, Ordering::Relaxed);
            slot.used.store(tick + 1, Ordering::Relaxed);
        }
    }

    /// One victim-selection pass for `page`.
    ///
    /// Prefers a slot already holding `page`, then any empty slot, then the
    /// least-recently-used slot that is not the latest page. Ties between
    /// equal ticks (possible after racing touches) are broken toward the page
    /// earliest in the caller's ordering.
    ///
    /// Advancing the tick here guarantees it exceeds every `used` value once
    /// the scan's repairs are applied, so the next touch of any slot marks it
    /// newly used even when several slots share the current tick.
    pub fn select<P: Precedes>(&self, page: u64, precedes: &P) -> Choice {
        if let Some(slotno) = self.find(page) {
            return Choice::Resident(slotno);
        }

        let cur = self.tick.fetch_add(1, Ordering::Relaxed);
        let mut best = 0;
        let mut best_delta = -1i64;
        let mut best_page = 0;
        for (slotno, slot) in self.slots.iter().enumerate() {
            if slot.state == PageState::Empty {
                return Choice::Reusable(slotno);
            }
            let mut delta = cur.wrapping_sub(slot.used.load(Ordering::Relaxed)) as i64;
            if delta < 0 {
                // A racing touch advanced this slot past the tick we read.
                // Back the slot off instead of chasing the tick, so one pass
                // is guaranteed to terminate.
                slot.used.store(cur, Ordering::Relaxed);
                delta = 0;
            }
            if slot.page == self.latest {
                continue;
            }
            if delta > best_delta
                || (delta == best_delta && precedes.precedes(slot.page, best_page))
            {
                best = slotno;
                best_delta = delta;
                best_page = slot.page;
            }
        }

        let slot = &self.slots[best];
        match slot.state {
            PageState::Valid if !slot.dirty => Choice::Reusable(best),
            PageState::Valid => Choice::Dirty(best),
            _ => Choice::Busy(best),
        }
    }
}
