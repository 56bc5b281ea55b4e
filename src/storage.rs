use crate::{
    pool::{Choice, PageState, Pool},
    Config, Error, LogFlush, Precedes,
};
use commonware_runtime::{
    Blob, Error as RError, Metrics, RwLock, RwLockReadGuard, RwLockWriteGuard, Storage,
};
use commonware_utils::hex;
use prometheus_client::metrics::counter::Counter;
use std::sync::{atomic::Ordering, Arc};
use tracing::{debug, trace, warn};

/// State shared by every clone of a [Cache].
struct Shared {
    /// The control lock: guards all slot metadata and page bytes.
    pool: RwLock<Pool>,
    /// Per-slot I/O locks. Held exclusively across disk I/O on a slot;
    /// acquired shared (and immediately released) to wait for that I/O.
    ///
    /// A slot lock is only ever acquired by a task that already holds the
    /// pool lock, and released after reacquiring it, so lock order is always
    /// pool before slot.
    io: Vec<RwLock<()>>,
}

/// Segments left open across the writes of one flush, so that many pages
/// hitting the same segment share one sync and close.
struct Batch<B: Blob> {
    limit: usize,
    files: Vec<(u64, B)>,
}

impl<B: Blob> Batch<B> {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            files: Vec::new(),
        }
    }

    /// Close every accumulated segment, ignoring failures.
    async fn abandon(&mut self) {
        for (seg, blob) in self.files.drain(..) {
            if let Err(error) = blob.close().await {
                warn!(segment = %segment_name(seg), error = %error, "could not close segment");
            }
        }
    }
}

/// Cause and location of a physical I/O failure.
///
/// Captured by the physical layer and held while shared state is repaired
/// under the pool lock; converted into an [Error] carrying the triggering
/// page and the caller's tag only once it is safe to surface.
enum IoFail {
    Open(String, RError),
    Missing(String),
    Read(String, RError),
    Write(String, RError),
    Sync(String, RError),
    Close(String, RError),
}

impl IoFail {
    fn report(self, page: u64, tag: Option<u64>) -> Error {
        match self {
            Self::Open(segment, source) => Error::OpenFailed {
                segment,
                page,
                tag,
                source,
            },
            Self::Missing(segment) => Error::MissingSegment { segment, page, tag },
            Self::Read(segment, source) => Error::ReadFailed {
                segment,
                page,
                tag,
                source,
            },
            Self::Write(segment, source) => Error::WriteFailed {
                segment,
                page,
                tag,
                source,
            },
            Self::Sync(segment, source) => Error::SyncFailed {
                segment,
                page,
                tag,
                source,
            },
            Self::Close(segment, source) => Error::CloseFailed {
                segment,
                page,
                tag,
                source,
            },
        }
    }
}

enum Guard<'a> {
    Shared(RwLockReadGuard<'a, Pool>),
    Exclusive(RwLockWriteGuard<'a, Pool>),
}

/// Shared handle to a resident page.
///
/// The handle holds the pool lock (in an unspecified mode) for as long as it
/// is alive: drop it before invoking further operations on the same cache
/// from the same task.
pub struct Page<'a> {
    guard: Guard<'a>,
    slotno: usize,
}

impl Page<'_> {
    fn pool(&self) -> &Pool {
        match &self.guard {
            Guard::Shared(pool) => pool,
            Guard::Exclusive(pool) => pool,
        }
    }

    /// The page this handle refers to.
    pub fn page(&self) -> u64 {
        self.pool().slots[self.slotno].page
    }

    /// The slot holding the page.
    pub fn slot(&self) -> usize {
        self.slotno
    }

    /// The page bytes.
    pub fn data(&self) -> &[u8] {
        &self.pool().slots[self.slotno].data
    }
}

/// Exclusive handle to a resident page.
///
/// The handle holds the pool lock exclusively for as long as it is alive:
/// drop it before invoking further operations on the same cache from the
/// same task. Mutations through [PageMut::data_mut] mark the page dirty;
/// a later [Cache::write] or [Cache::flush] persists it.
pub struct PageMut<'a> {
    pool: RwLockWriteGuard<'a, Pool>,
    slotno: usize,
}

impl PageMut<'_> {
    /// The page this handle refers to.
    pub fn page(&self) -> u64 {
        self.pool.slots[self.slotno].page
    }

    /// The slot holding the page.
    pub fn slot(&self) -> usize {
        self.slotno
    }

    /// The page bytes.
    pub fn data(&self) -> &[u8] {
        &self.pool.slots[self.slotno].data
    }

    /// The page bytes, for modification. Marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let slot = &mut self.pool.slots[self.slotno];
        slot.dirty = true;
        &mut slot.data
    }

    /// Mark the page dirty without touching its bytes.
    pub fn mark_dirty(&mut self) {
        self.pool.slots[self.slotno].dirty = true;
    }

    /// Record a redo-log position for one group of entries in the page,
    /// keeping the highest position seen.
    ///
    /// The recorded maximum is flushed to the redo log before the page is
    /// next written out.
    ///
    /// # Panics
    ///
    /// Panics if `group` is not less than the configured
    /// `lsn_groups_per_page`.
    pub fn record_lsn(&mut self, group: usize, lsn: u64) {
        let entry = &mut self.pool.slots[self.slotno].lsns[group];
        if *entry < lsn {
            *entry = lsn;
        }
    }
}

/// A least-recently-used cache of fixed-size pages over segmented storage.
///
/// A `Cache` buffers pages of a numbered, append-oriented logical log in a
/// small pool of page-sized slots, writing them back to per-segment blobs in
/// a single partition. Clones share the pool (and its locks): clone the
/// cache to hand it to concurrent tasks.
///
/// Management is straight LRU over linear scans of the pool, except that the
/// latest page is never evicted (it is about to be hit again). See the crate
/// docs for the locking protocol.
pub struct Cache<E: Storage + Metrics, P: Precedes, L: LogFlush = ()> {
    context: E,
    cfg: Config<P, L>,
    shared: Arc<Shared>,

    reads: Counter,
    writes: Counter,
    hits: Counter,
    evicted: Counter,
    synced: Counter,
    pruned: Counter,
}

impl<E: Storage + Metrics, P: Precedes, L: LogFlush> Clone for Cache<E, P, L> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            cfg: self.cfg.clone(),
            shared: self.shared.clone(),
            reads: self.reads.clone(),
            writes: self.writes.clone(),
            hits: self.hits.clone(),
            evicted: self.evicted.clone(),
            synced: self.synced.clone(),
            pruned: self.pruned.clone(),
        }
    }
}

impl<E: Storage + Metrics, P: Precedes, L: LogFlush> Cache<E, P, L> {
    /// Initialize a new `Cache` with every slot empty.
    ///
    /// No storage is touched: segments are opened lazily as pages are read
    /// and written. The embedder should call [Cache::set_latest] (or zero a
    /// page) before the pool fills, so eviction can avoid the active page.
    pub async fn init(context: E, cfg: Config<P, L>) -> Result<Self, Error> {
        let slots = cfg.slots.get();
        let pool = Pool::new(slots, cfg.page_size.get(), cfg.lsn_groups_per_page);
        let io = (0..slots).map(|_| RwLock::new(())).collect();

        let reads = Counter::default();
        let writes = Counter::default();
        let hits = Counter::default();
        let evicted = Counter::default();
        let synced = Counter::default();
        let pruned = Counter::default();
        context.register("reads", "Number of physical page reads", reads.clone());
        context.register("writes", "Number of physical page writes", writes.clone());
        context.register("hits", "Number of reads served from the pool", hits.clone());
        context.register("evicted", "Number of pages evicted", evicted.clone());
        context.register("synced", "Number of segment syncs", synced.clone());
        context.register("pruned", "Number of segments removed", pruned.clone());

        Ok(Self {
            context,
            cfg,
            shared: Arc::new(Shared {
                pool: RwLock::new(pool),
                io,
            }),
            reads,
            writes,
            hits,
            evicted,
            synced,
            pruned,
        })
    }

    /// The logically-active page (reserved from eviction).
    pub async fn latest(&self) -> u64 {
        self.shared.pool.read().await.latest
    }

    /// Declare the logically-active page.
    pub async fn set_latest(&self, page: u64) {
        self.shared.pool.write().await.latest = page;
    }

    /// Initialize `page` to zeroes in the pool, marking it dirty and making
    /// it the latest page.
    ///
    /// Nothing is written to storage: the page only exists in the pool until
    /// it is written back.
    ///
    /// # Errors
    ///
    /// Fails only if making room required writing out a dirty victim and
    /// that write failed.
    pub async fn zero(&self, page: u64) -> Result<PageMut<'_>, Error> {
        let mut pool = self.shared.pool.write().await;
        let slotno = loop {
            match pool.select(page, &self.cfg.precedes) {
                Choice::Resident(slotno) | Choice::Reusable(slotno) => break slotno,
                Choice::Dirty(slotno) => {
                    let (p, result) = self.write_slot(pool, slotno, None).await;
                    pool = p;
                    result?;
                }
                Choice::Busy(slotno) => pool = self.wait_io(pool, slotno).await,
            }
        };

        {
            let slot = &pool.slots[slotno];
            assert!(
                slot.freeable() || slot.page == page,
                "selected slot {slotno} is not freeable"
            );
            if slot.state == PageState::Valid && slot.page != page {
                self.evicted.inc();
            }
        }
        {
            let slot = &mut pool.slots[slotno];
            slot.page = page;
            slot.state = PageState::Valid;
            slot.dirty = true;
            slot.data.fill(0);
            slot.lsns.fill(0);
        }
        pool.touch(slotno);
        // The zeroed page becomes the logically-active one.
        pool.latest = page;
        trace!(page, slot = slotno, "zeroed page");
        Ok(PageMut { pool, slotno })
    }

    /// Find `page` in the pool, reading it from storage if necessary.
    ///
    /// The page must have been initialized at some point (see [Cache::zero]):
    /// reading a page in a segment that was never written is an error outside
    /// crash recovery.
    ///
    /// With `write_ok`, a page whose prior image is still being written out
    /// may be returned (and modified) immediately; otherwise the write is
    /// waited out first.
    ///
    /// `tag` is attached to any surfaced error and has no other effect.
    pub async fn read(
        &self,
        page: u64,
        write_ok: bool,
        tag: Option<u64>,
    ) -> Result<PageMut<'_>, Error> {
        let pool = self.shared.pool.write().await;
        let (pool, result) = self.read_frame(pool, page, write_ok, tag).await;
        match result {
            Ok(slotno) => Ok(PageMut { pool, slotno }),
            Err(error) => Err(error),
        }
    }

    /// As [Cache::read], for read-only access.
    ///
    /// A page already resident (and not mid-read) is returned under a shared
    /// pool lock, letting many readers proceed in parallel; only a miss
    /// escalates to the exclusive path.
    pub async fn read_only(&self, page: u64, tag: Option<u64>) -> Result<Page<'_>, Error> {
        {
            let pool = self.shared.pool.read().await;
            if let Some(slotno) = pool.find(page) {
                let state = pool.slots[slotno].state;
                if state == PageState::Valid || state == PageState::Writing {
                    pool.touch(slotno);
                    self.hits.inc();
                    return Ok(Page {
                        guard: Guard::Shared(pool),
                        slotno,
                    });
                }
            }
        }

        let pool = self.shared.pool.write().await;
        let (pool, result) = self.read_frame(pool, page, true, tag).await;
        match result {
            Ok(slotno) => Ok(Page {
                guard: Guard::Exclusive(pool),
                slotno,
            }),
            Err(error) => Err(error),
        }
    }

    /// As [Cache::read], but an I/O failure yields `None` instead of an
    /// error.
    pub async fn try_read(&self, page: u64, tag: Option<u64>) -> Option<PageMut<'_>> {
        match self.read(page, true, tag).await {
            Ok(guard) => Some(guard),
            Err(error) => {
                debug!(page, error = %error, "could not read page");
                None
            }
        }
    }

    /// Write a page back to storage if it is dirty.
    ///
    /// Only one write attempt is made: if another task re-dirties the page
    /// while it is being written, the page remains dirty at return and a
    /// later write picks it up.
    pub async fn write<'a>(&'a self, page: PageMut<'a>) -> Result<(), Error> {
        let PageMut { pool, slotno } = page;
        let (pool, result) = self.write_slot(pool, slotno, None).await;
        drop(pool);
        result
    }

    /// Write every dirty page to storage.
    ///
    /// Segments stay open across the individual page writes (up to
    /// `flush_batch` of them) and are synced and closed at the end. The
    /// first sync or close failure is recorded, the remaining segments are
    /// still closed, and the failure is then surfaced.
    ///
    /// With `checkpoint`, pages re-dirtied mid-flush are expected (another
    /// task may keep updating the log); without it they are merely tolerated.
    pub async fn flush(&self, checkpoint: bool) -> Result<(), Error> {
        let mut batch = Batch::new(self.cfg.flush_batch);
        let mut pool = self.shared.pool.write().await;
        for slotno in 0..pool.slots.len() {
            let (p, result) = self.write_slot(pool, slotno, Some(&mut batch)).await;
            pool = p;
            // On failure the batch has already been closed.
            result?;
        }
        if !checkpoint {
            let redirtied = pool
                .slots
                .iter()
                .filter(|slot| slot.state == PageState::Valid && slot.dirty)
                .count();
            if redirtied > 0 {
                debug!(redirtied, "pages redirtied during flush");
            }
        }
        drop(pool);

        let pps = self.cfg.pages_per_segment.get();
        let mut failure: Option<Error> = None;
        for (seg, blob) in batch.files.drain(..) {
            let segment = segment_name(seg);
            if self.cfg.fsync {
                if let Err(source) = blob.sync().await {
                    warn!(segment = %segment, error = %source, "could not sync segment");
                    if failure.is_none() {
                        failure = Some(Error::SyncFailed {
                            segment: segment.clone(),
                            page: seg * pps,
                            tag: None,
                            source,
                        });
                    }
                } else {
                    self.synced.inc();
                }
            }
            if let Err(source) = blob.close().await {
                warn!(segment = %segment, error = %source, "could not close segment");
                if failure.is_none() {
                    failure = Some(Error::CloseFailed {
                        segment,
                        page: seg * pps,
                        tag: None,
                        source,
                    });
                }
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Remove every segment wholly before the segment containing `cutoff`.
    ///
    /// Resident pages in the removed range are discarded first (dirty ones
    /// are conservatively written out, then discarded on the rescan).
    /// Returns `Ok(false)` without removing anything if the latest page
    /// precedes the cutoff: that indicates an apparent wrap-around, where
    /// proceeding could remove the active segment.
    ///
    /// Failures to remove individual segments are logged and ignored; the
    /// segments remain candidates for the next truncation.
    pub async fn truncate(&self, cutoff: u64) -> Result<bool, Error> {
        let pps = self.cfg.pages_per_segment.get();
        // The cutoff point is the start of the segment containing it.
        let cutoff = cutoff - cutoff % pps;

        {
            let mut pool = self.shared.pool.write().await;
            'restart: loop {
                if self.cfg.precedes.precedes(pool.latest, cutoff) {
                    warn!(
                        partition = %self.cfg.partition,
                        latest = pool.latest,
                        cutoff,
                        "could not truncate: apparent wraparound"
                    );
                    return Ok(false);
                }

                // Discard resident pages in the range so they cannot be
                // written back after their segment is removed.
                for slotno in 0..pool.slots.len() {
                    let (state, dirty, page) = {
                        let slot = &pool.slots[slotno];
                        (slot.state, slot.dirty, slot.page)
                    };
                    if state == PageState::Empty {
                        continue;
                    }
                    if !self.cfg.precedes.precedes(page, cutoff) {
                        continue;
                    }
                    if state == PageState::Valid && !dirty {
                        pool.slots[slotno].state = PageState::Empty;
                        continue;
                    }

                    // The page has (or may have) I/O in flight. Dirty pages
                    // are written out even though they are about to be
                    // discarded; the rescan then finds them clean.
                    if state == PageState::Valid {
                        let (p, result) = self.write_slot(pool, slotno, None).await;
                        pool = p;
                        result?;
                    } else {
                        pool = self.wait_io(pool, slotno).await;
                    }
                    continue 'restart;
                }
                break;
            }
        }

        let names = match self.context.scan(&self.cfg.partition).await {
            Ok(names) => names,
            Err(RError::PartitionMissing(_)) => Vec::new(),
            Err(source) => return Err(Error::Runtime(source)),
        };
        for name in names {
            let Some(seg) = parse_segment(&name) else {
                trace!(name = %hex(&name), "ignoring unrelated blob");
                continue;
            };
            if !self.cfg.precedes.precedes(seg.wrapping_mul(pps), cutoff) {
                continue;
            }
            let segment = segment_name(seg);
            debug!(segment = %segment, "removing segment");
            if let Err(error) = self.context.remove(&self.cfg.partition, Some(&name)).await {
                warn!(segment = %segment, error = %error, "could not remove segment");
            } else {
                self.pruned.inc();
            }
        }
        Ok(true)
    }

    /// Whether `page` can be read.
    ///
    /// Runs the same protocol as [Cache::read] but suppresses failures: a
    /// page whose segment is missing or unreadable simply does not exist.
    pub async fn exists(&self, page: u64) -> bool {
        let pool = self.shared.pool.write().await;
        let (_pool, result) = self.read_frame(pool, page, true, None).await;
        match result {
            Ok(_) => true,
            Err(error) => {
                debug!(page, error = %error, "page probe failed");
                false
            }
        }
    }

    /// Find `page` in the pool or read it into a selected slot, returning
    /// the slot number. The pool lock is exchanged (dropped and reacquired)
    /// around any I/O.
    async fn read_frame<'a>(
        &'a self,
        mut pool: RwLockWriteGuard<'a, Pool>,
        page: u64,
        write_ok: bool,
        tag: Option<u64>,
    ) -> (RwLockWriteGuard<'a, Pool>, Result<usize, Error>) {
        loop {
            match pool.select(page, &self.cfg.precedes) {
                Choice::Resident(slotno) => {
                    // Still being read in (or written, when the caller cannot
                    // tolerate that): wait and recheck from the top.
                    let state = pool.slots[slotno].state;
                    if state == PageState::Reading || (state == PageState::Writing && !write_ok) {
                        pool = self.wait_io(pool, slotno).await;
                        continue;
                    }
                    pool.touch(slotno);
                    self.hits.inc();
                    return (pool, Ok(slotno));
                }
                Choice::Reusable(slotno) => {
                    trace!(page, slot = slotno, "page fault");
                    {
                        let slot = &pool.slots[slotno];
                        assert!(slot.freeable(), "selected slot {slotno} is not freeable");
                        if slot.state == PageState::Valid {
                            self.evicted.inc();
                        }
                    }
                    {
                        let slot = &mut pool.slots[slotno];
                        slot.page = page;
                        slot.state = PageState::Reading;
                        slot.dirty = false;
                    }
                    // Cannot deadlock: no I/O is in flight on this slot, so
                    // the lock is at worst held briefly by a completion probe.
                    let io = self.shared.io[slotno].write().await;
                    // Mark the slot used before releasing the pool so that
                    // concurrent victim selections steer away from it.
                    pool.touch(slotno);
                    drop(pool);

                    let result = self.physical_read(page).await;

                    let mut pool = self.shared.pool.write().await;
                    {
                        let slot = &pool.slots[slotno];
                        assert!(
                            slot.page == page
                                && slot.state == PageState::Reading
                                && !slot.dirty,
                            "slot {slotno} changed during read of page {page}"
                        );
                    }
                    match result {
                        Ok(data) => {
                            let slot = &mut pool.slots[slotno];
                            slot.data.copy_from_slice(&data);
                            // A freshly read page cannot carry interesting
                            // log positions: they were flushed before the
                            // page was last written out.
                            slot.lsns.fill(0);
                            slot.state = PageState::Valid;
                            drop(io);
                            self.reads.inc();
                            pool.touch(slotno);
                            return (pool, Ok(slotno));
                        }
                        Err(fail) => {
                            pool.slots[slotno].state = PageState::Empty;
                            drop(io);
                            return (pool, Err(fail.report(page, tag)));
                        }
                    }
                }
                Choice::Dirty(slotno) => {
                    let (p, result) = self.write_slot(pool, slotno, None).await;
                    pool = p;
                    if let Err(error) = result {
                        return (pool, Err(error));
                    }
                }
                Choice::Busy(slotno) => {
                    pool = self.wait_io(pool, slotno).await;
                }
            }
        }
    }

    /// Write the page in `slotno` back to storage if it is dirty. The pool
    /// lock is exchanged around the I/O.
    async fn write_slot<'a>(
        &'a self,
        mut pool: RwLockWriteGuard<'a, Pool>,
        slotno: usize,
        mut batch: Option<&mut Batch<E::Blob>>,
    ) -> (RwLockWriteGuard<'a, Pool>, Result<(), Error>) {
        let page = pool.slots[slotno].page;

        // A write of this page may already be in flight (checkpoints write
        // every slot); wait it out, then recheck whether anything remains.
        while pool.slots[slotno].state == PageState::Writing && pool.slots[slotno].page == page {
            pool = self.wait_io(pool, slotno).await;
        }

        {
            let slot = &pool.slots[slotno];
            if !slot.dirty || slot.state != PageState::Valid || slot.page != page {
                return (pool, Ok(()));
            }
        }

        // From here on, an update of the page marks it dirty again.
        let (snapshot, max_lsn) = {
            let slot = &mut pool.slots[slotno];
            slot.state = PageState::Writing;
            slot.dirty = false;
            (
                slot.data.clone(),
                slot.lsns.iter().copied().max().unwrap_or(0),
            )
        };

        // Cannot deadlock: no I/O was in flight on this slot, so the lock is
        // at worst held briefly by a completion probe.
        let io = self.shared.io[slotno].write().await;
        drop(pool);

        if max_lsn != 0 {
            // The redo log must be durable through the highest position
            // recorded for the page before the page itself reaches disk.
            // The hook's contract makes failure fatal to the process.
            self.cfg.log.flush(max_lsn).await;
        }

        let result = self
            .physical_write(page, snapshot, batch.as_deref_mut())
            .await;
        if result.is_err() {
            if let Some(batch) = batch {
                batch.abandon().await;
            }
        }

        let mut pool = self.shared.pool.write().await;
        {
            let slot = &mut pool.slots[slotno];
            assert!(
                slot.page == page && slot.state == PageState::Writing,
                "slot {slotno} changed during write of page {page}"
            );
            if result.is_err() {
                slot.dirty = true;
            }
            slot.state = PageState::Valid;
        }
        drop(io);

        match result {
            Ok(()) => {
                self.writes.inc();
                trace!(page, slot = slotno, "wrote page");
                (pool, Ok(()))
            }
            Err(fail) => (pool, Err(fail.report(page, None))),
        }
    }

    /// Wait for any I/O in flight on `slotno` to finish.
    ///
    /// This does not guarantee new I/O has not started by the time it
    /// returns, and the slot may hold a different page entirely: callers
    /// must recheck state.
    async fn wait_io<'a>(
        &'a self,
        pool: RwLockWriteGuard<'a, Pool>,
        slotno: usize,
    ) -> RwLockWriteGuard<'a, Pool> {
        // Release the pool, then queue on the slot's I/O lock: the owner
        // holds it exclusively until the slot's state has been restored.
        drop(pool);
        drop(self.shared.io[slotno].read().await);
        let mut pool = self.shared.pool.write().await;

        // If the slot is still marked in-progress, either new I/O began or
        // the previous owner died before restoring state. The latter is
        // detectable: the I/O lock is free again.
        let state = pool.slots[slotno].state;
        if state == PageState::Reading || state == PageState::Writing {
            if let Some(guard) = self.shared.io[slotno].try_read() {
                warn!(slot = slotno, "repairing slot after abandoned I/O");
                let slot = &mut pool.slots[slotno];
                match slot.state {
                    PageState::Reading => slot.state = PageState::Empty,
                    PageState::Writing => {
                        slot.state = PageState::Valid;
                        slot.dirty = true;
                    }
                    _ => unreachable!(),
                }
                drop(guard);
            }
        }
        pool
    }

    /// Read one page from its segment.
    ///
    /// A segment that was never written reads as zeroes during crash
    /// recovery: redo may reference pages in segments that were truncated
    /// before the crash.
    async fn physical_read(&self, page: u64) -> Result<Vec<u8>, IoFail> {
        let (seg, offset) = self.locate(page);
        let segment = segment_name(seg);
        let page_size = self.cfg.page_size.get();

        let (blob, len) = self
            .context
            .open(&self.cfg.partition, segment.as_bytes())
            .await
            .map_err(|source| IoFail::Open(segment.clone(), source))?;
        if len == 0 {
            let _ = blob.close().await;
            if self.cfg.recovering.load(Ordering::Relaxed) {
                debug!(segment = %segment, page, "segment missing, reading as zeros");
                return Ok(vec![0u8; page_size]);
            }
            return Err(IoFail::Missing(segment));
        }

        let read = match blob.read_at(vec![0u8; page_size], offset).await {
            Ok(read) => read,
            Err(source) => {
                let _ = blob.close().await;
                return Err(IoFail::Read(segment, source));
            }
        };
        if let Err(source) = blob.close().await {
            return Err(IoFail::Close(segment, source));
        }
        Ok(read.into())
    }

    /// Write one page to its segment.
    ///
    /// During a flush the segment may already be open in `batch`; otherwise
    /// it is opened (created if missing: a page need not be the first of its
    /// segment to be written, and multiple tasks may create the same segment
    /// concurrently). Writes outside a batch are synced and closed here;
    /// batched segments are left open for the flush to finish.
    async fn physical_write(
        &self,
        page: u64,
        data: Vec<u8>,
        batch: Option<&mut Batch<E::Blob>>,
    ) -> Result<(), IoFail> {
        let (seg, offset) = self.locate(page);
        let segment = segment_name(seg);

        if let Some(batch) = batch {
            if let Some((_, blob)) = batch.files.iter().find(|(s, _)| *s == seg) {
                return blob
                    .write_at(data, offset)
                    .await
                    .map_err(|source| IoFail::Write(segment, source));
            }
            let (blob, _) = self
                .context
                .open(&self.cfg.partition, segment.as_bytes())
                .await
                .map_err(|source| IoFail::Open(segment.clone(), source))?;
            if batch.files.len() < batch.limit {
                batch.files.push((seg, blob));
                let (_, blob) = batch.files.last().unwrap();
                return blob
                    .write_at(data, offset)
                    .await
                    .map_err(|source| IoFail::Write(segment, source));
            }
            // The batch is full: degrade this page to a standalone write.
            return self.standalone_write(blob, segment, data, offset).await;
        }

        let (blob, _) = self
            .context
            .open(&self.cfg.partition, segment.as_bytes())
            .await
            .map_err(|source| IoFail::Open(segment.clone(), source))?;
        self.standalone_write(blob, segment, data, offset).await
    }

    async fn standalone_write(
        &self,
        blob: E::Blob,
        segment: String,
        data: Vec<u8>,
        offset: u64,
    ) -> Result<(), IoFail> {
        if let Err(source) = blob.write_at(data, offset).await {
            let _ = blob.close().await;
            return Err(IoFail::Write(segment, source));
        }
        if self.cfg.fsync {
            if let Err(source) = blob.sync().await {
                let _ = blob.close().await;
                return Err(IoFail::Sync(segment, source));
            }
            self.synced.inc();
        }
        if let Err(error) = blob.close().await {
            // The page is already durable; log the close failure and move on.
            warn!(segment = %segment, error = %error, "could not close segment");
        }
        Ok(())
    }

    /// Map a page number to its segment and the byte offset within it.
    fn locate(&self, page: u64) -> (u64, u64) {
        let pps = self.cfg.pages_per_segment.get();
        (page / pps, (page % pps) * self.cfg.page_size.get() as u64)
    }
}

#[cfg(test)]
impl<E: Storage + Metrics, P: Precedes, L: LogFlush> Cache<E, P, L> {
    /// Check pool invariants observable between operations.
    pub(crate) async fn audit(&self) {
        let pool = self.shared.pool.read().await;
        for (i, slot) in pool.slots.iter().enumerate() {
            if slot.state == PageState::Empty {
                assert!(!slot.dirty, "empty slot {i} is dirty");
                continue;
            }
            for (j, other) in pool.slots.iter().enumerate().skip(i + 1) {
                assert!(
                    other.state == PageState::Empty || other.page != slot.page,
                    "slots {i} and {j} both hold page {}",
                    slot.page
                );
            }
        }
    }

    /// Whether `page` is resident, without touching access order.
    pub(crate) async fn resident(&self, page: u64) -> bool {
        self.shared.pool.read().await.find(page).is_some()
    }

    /// Whether every slot is empty or clean.
    pub(crate) async fn clean(&self) -> bool {
        self.shared
            .pool
            .read()
            .await
            .slots
            .iter()
            .all(|slot| slot.freeable())
    }
}

/// Segment file name: exactly four uppercase hex digits.
fn segment_name(seg: u64) -> String {
    format!("{seg:04X}")
}

/// Parse a blob name as a segment number, rejecting anything that is not
/// exactly four uppercase hex digits.
fn parse_segment(name: &[u8]) -> Option<u64> {
    if name.len() != 4
        || !name
            .iter()
            .all(|&b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
    {
        return None;
    }
    u64::from_str_radix(std::str::from_utf8(name).ok()?, 16).ok()
}
