//! A simple least-recently-used cache of fixed-size pages over segmented
//! storage.
//!
//! Many embedders keep a numbered, append-oriented logical log (transaction
//! status words, subtransaction parents, and the like) whose write traffic
//! concentrates on the newest page or two while reads span a larger but
//! still modest window. [Cache] buffers such a log in a small pool of
//! page-sized slots shared by every clone of the cache, backed by one blob
//! per segment in a single `commonware-runtime` partition. The pool is
//! searched linearly and managed with straight LRU, except that the latest
//! page is never evicted (it is about to be hit again).
//!
//! # Locking
//!
//! Two layers of reader/writer locks coordinate concurrent tasks:
//!
//! * A single control lock guards all slot metadata and page bytes. Holding
//!   it exclusively confers the right to mutate; holding it shared permits
//!   reading plus one constrained mutation, the recently-used tick, which is
//!   updated with relaxed atomics and repaired during victim selection if
//!   racing updates regressed it.
//! * A per-slot I/O lock is held exclusively for the duration of a disk
//!   transfer on that slot. It is acquired before the control lock is
//!   released and released only after the control lock is reacquired and
//!   the slot's state updated. Waiting for the I/O is acquiring that lock
//!   shared and immediately dropping it.
//!
//! The control lock is never held across disk I/O, locks are always
//! acquired control-first, and I/O is never initiated on a slot that is
//! already transferring, so the two layers cannot deadlock. A task that
//! dies mid-transfer releases its locks; the next waiter finds the slot
//! still marked in-progress with a free I/O lock and repairs it (a failed
//! read empties the slot, a failed write leaves the page dirty).
//!
//! # Format
//!
//! Pages are stored in segments of `pages_per_segment` pages each. A
//! segment is a blob named by exactly four uppercase hex digits of its
//! segment number; other blobs in the partition are ignored:
//!
//! ```text
//! 0000: +--------+--------+-----+---------+
//!       | page 0 | page 1 | ... | page 31 |
//!       +--------+--------+-----+---------+
//! 0001: +---------+---------+-----+---------+
//!       | page 32 | page 33 | ... | page 63 |
//!       +---------+---------+-----+---------+
//!
//! pages_per_segment = 32: page p lives in segment p / 32
//! at byte offset (p % 32) * page_size
//! ```
//!
//! Trailing pages of a segment may be absent (the segment is short). A
//! segment that was never written at all is treated as all-zero only while
//! the embedder signals crash recovery: redo may reference pages whose
//! segments were truncated before the crash. Outside recovery the same read
//! is an error.
//!
//! # Write-ahead ordering
//!
//! An embedder that commits through a redo log can attach log positions to
//! groups of entries within a page ([PageMut::record_lsn]). Before a page
//! is written out, the highest position recorded for it is passed to the
//! configured [LogFlush] hook, ensuring the log is durable before the page
//! image that references it.
//!
//! # Example
//!
//! ```rust
//! use commonware_pagecache::{Cache, Config};
//! use commonware_runtime::{deterministic, Runner};
//! use commonware_utils::{NZUsize, NZU64};
//! use std::sync::{atomic::AtomicBool, Arc};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let cfg = Config {
//!         partition: "status_log".into(),
//!         slots: NZUsize!(8),
//!         page_size: NZUsize!(256),
//!         pages_per_segment: NZU64!(32),
//!         lsn_groups_per_page: 0,
//!         fsync: true,
//!         flush_batch: 16,
//!         precedes: |a: u64, b: u64| a < b,
//!         log: (),
//!         recovering: Arc::new(AtomicBool::new(false)),
//!     };
//!     let cache = Cache::init(context, cfg).await.unwrap();
//!
//!     // Initialize the first page and persist it.
//!     let mut page = cache.zero(0).await.unwrap();
//!     page.data_mut()[0] = 0x01;
//!     drop(page);
//!     cache.flush(false).await.unwrap();
//!
//!     // Read it back.
//!     let page = cache.read(0, false, None).await.unwrap();
//!     assert_eq!(page.data()[0], 0x01);
//! });
//! ```

mod pool;
mod storage;

pub use storage::{Cache, Page, PageMut};

use commonware_runtime::Error as RError;
use std::{
    future::Future,
    num::{NonZeroU64, NonZeroUsize},
    sync::{atomic::AtomicBool, Arc},
};
use thiserror::Error;

/// Errors that can occur when interacting with a [Cache].
///
/// I/O failures carry the page that triggered the operation, the caller's
/// tag (if one was supplied), and the four-hex-digit segment name.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] RError),
    #[error("segment {segment} does not exist (page {page})")]
    MissingSegment {
        segment: String,
        page: u64,
        tag: Option<u64>,
    },
    #[error("could not open segment {segment} (page {page}): {source}")]
    OpenFailed {
        segment: String,
        page: u64,
        tag: Option<u64>,
        source: RError,
    },
    #[error("could not read page {page} of segment {segment}: {source}")]
    ReadFailed {
        segment: String,
        page: u64,
        tag: Option<u64>,
        source: RError,
    },
    #[error("could not write page {page} of segment {segment}: {source}")]
    WriteFailed {
        segment: String,
        page: u64,
        tag: Option<u64>,
        source: RError,
    },
    #[error("could not sync segment {segment} (page {page}): {source}")]
    SyncFailed {
        segment: String,
        page: u64,
        tag: Option<u64>,
        source: RError,
    },
    #[error("could not close segment {segment} (page {page}): {source}")]
    CloseFailed {
        segment: String,
        page: u64,
        tag: Option<u64>,
        source: RError,
    },
}

/// A strict ordering on page numbers that respects the embedder's
/// wrap-around arithmetic.
///
/// The cache only compares pages that are simultaneously live (resident in
/// the pool or present on disk), so the relation need only be irreflexive
/// and antisymmetric over such bounded windows, not a total order over all
/// of `u64`.
pub trait Precedes: Clone + Send + Sync + 'static {
    /// Whether page `a` is strictly earlier than page `b`.
    fn precedes(&self, a: u64, b: u64) -> bool;
}

impl<F: Fn(u64, u64) -> bool + Clone + Send + Sync + 'static> Precedes for F {
    fn precedes(&self, a: u64, b: u64) -> bool {
        self(a, b)
    }
}

/// Makes the embedder's redo log durable through a given position.
///
/// Invoked by the cache before writing out a page that has log positions
/// recorded against it. The hook must not fail: by the time it runs, the
/// page has already been marked clean, so an embedder that cannot flush its
/// log must treat the condition as fatal (panic or abort) rather than
/// return.
pub trait LogFlush: Clone + Send + Sync + 'static {
    /// Make the redo log durable through `lsn`.
    fn flush(&self, lsn: u64) -> impl Future<Output = ()> + Send;
}

/// No-op hook for embedders without a redo log.
impl LogFlush for () {
    async fn flush(&self, _: u64) {}
}

/// Configuration for a [Cache].
#[derive(Clone)]
pub struct Config<P: Precedes, L: LogFlush = ()> {
    /// The `commonware-runtime::Storage` partition holding the cache's
    /// segments.
    pub partition: String,

    /// The number of page buffers in the pool.
    ///
    /// Traffic concentrates on the newest pages, so a small pool (scanned
    /// linearly) is usually sufficient.
    pub slots: NonZeroUsize,

    /// The size of each page in bytes.
    pub page_size: NonZeroUsize,

    /// The number of pages stored per segment. 32 is the conventional
    /// choice; a power of two is recommended. The four-hex-digit segment
    /// namespace bounds how many segments can exist at once.
    pub pages_per_segment: NonZeroU64,

    /// The number of redo-log position groups tracked per page. Zero
    /// disables write-ahead ordering entirely.
    pub lsn_groups_per_page: usize,

    /// Whether segment writes are fsync'd.
    pub fsync: bool,

    /// The maximum number of segments kept open across one [Cache::flush].
    /// Pages overflowing the cap degrade to standalone (individually
    /// synced) writes.
    pub flush_batch: usize,

    /// The strict ordering on live page numbers.
    pub precedes: P,

    /// The redo-log flush hook (see [LogFlush]).
    pub log: L,

    /// Whether the embedder is in crash recovery. Queried, not owned: the
    /// embedder flips it when recovery ends.
    pub recovering: Arc<AtomicBool>,
}

impl<P: Precedes, L: LogFlush> Config<P, L> {
    /// The approximate heap footprint, in bytes, of the pool this
    /// configuration describes.
    pub fn memory_usage(&self) -> usize {
        let per_slot = std::mem::size_of::<pool::Slot>()
            + self.page_size.get()
            + self.lsn_groups_per_page * std::mem::size_of::<u64>();
        std::mem::size_of::<pool::Pool>() + self.slots.get() * per_slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Blob, Metrics, Runner, Spawner, Storage};
    use commonware_utils::{NZUsize, NZU64};
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };

    const PAGE_SIZE: usize = 256;

    fn ordered(a: u64, b: u64) -> bool {
        a < b
    }

    fn config(partition: &str, slots: usize) -> Config<fn(u64, u64) -> bool> {
        Config {
            partition: partition.into(),
            slots: NZUsize!(slots),
            page_size: NZUsize!(PAGE_SIZE),
            pages_per_segment: NZU64!(32),
            lsn_groups_per_page: 0,
            fsync: true,
            flush_batch: 16,
            precedes: ordered,
            log: (),
            recovering: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Write `pages` to storage through a throwaway cache so tests can
    /// exercise cold reads.
    async fn seed<E: Storage + Metrics>(context: E, partition: &str, pages: &[u64]) {
        let cache = Cache::init(context, config(partition, 4)).await.unwrap();
        for &page in pages {
            drop(cache.zero(page).await.unwrap());
        }
        cache.flush(false).await.unwrap();
    }

    #[test_traced]
    fn test_read_miss_then_hit() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            seed(context.with_label("seed"), "status", &[17]).await;

            let cache = Cache::init(context.clone(), config("status", 4))
                .await
                .unwrap();

            // First access faults the page in from storage.
            let page = cache.read(17, false, None).await.unwrap();
            let slotno = page.slot();
            assert_eq!(page.page(), 17);
            assert!(page.data().iter().all(|&b| b == 0));
            drop(page);

            // Second access is served from the pool, same slot.
            let page = cache.read(17, false, None).await.unwrap();
            assert_eq!(page.slot(), slotno);
            drop(page);

            let buffer = context.encode();
            assert!(buffer.contains("reads_total 1"), "{}", buffer);
            assert!(buffer.contains("hits_total 1"), "{}", buffer);
            cache.audit().await;
        });
    }

    #[test_traced]
    fn test_eviction_prefers_oldest() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            seed(context.with_label("seed"), "evict", &[0, 1, 2, 3, 4]).await;

            let cache = Cache::init(context.clone(), config("evict", 3))
                .await
                .unwrap();
            for page in 0..3u64 {
                drop(cache.read(page, false, None).await.unwrap());
            }
            cache.set_latest(2).await;

            // Page 0 is the oldest access and not the latest page: it is the
            // one displaced.
            drop(cache.read(3, false, None).await.unwrap());
            assert!(!cache.resident(0).await);
            for page in 1..4u64 {
                assert!(cache.resident(page).await, "page {page} missing");
            }

            // Even as the stalest access, the latest page is not a victim:
            // page 1 is now the oldest, but declaring it latest shifts the
            // eviction to page 2.
            cache.set_latest(1).await;
            drop(cache.read(4, false, None).await.unwrap());
            assert!(cache.resident(1).await);
            assert!(!cache.resident(2).await);
            cache.audit().await;
        });
    }

    #[test_traced]
    fn test_dirty_writeback_on_eviction() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cache = Cache::init(context.clone(), config("writeback", 2))
                .await
                .unwrap();
            drop(cache.zero(0).await.unwrap());
            drop(cache.zero(1).await.unwrap());

            // Both slots are dirty; installing a third page writes out the
            // oldest one (page 0; page 1 is the latest).
            drop(cache.zero(5).await.unwrap());
            let buffer = context.encode();
            assert!(buffer.contains("writes_total 1"), "{}", buffer);
            assert!(buffer.contains("evicted_total 1"), "{}", buffer);

            // Reading page 0 back displaces page 1 (another writeback) and
            // faults the page in from storage, all zeroes. Page 5 (the
            // latest) survives.
            let page = cache.read(0, false, None).await.unwrap();
            assert!(page.data().iter().all(|&b| b == 0));
            drop(page);
            assert!(cache.resident(5).await);
            let buffer = context.encode();
            assert!(buffer.contains("writes_total 2"), "{}", buffer);
            assert!(buffer.contains("reads_total 1"), "{}", buffer);

            // Pages 0 and 1 landed at their offsets within segment 0000.
            let (blob, len) = context.open("writeback", b"0000").await.unwrap();
            assert_eq!(len, 2 * PAGE_SIZE as u64);
            blob.close().await.unwrap();
            cache.audit().await;
        });
    }

    #[test_traced]
    fn test_segment_layout() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cache = Cache::init(context.clone(), config("layout", 4))
                .await
                .unwrap();
            for page in [0u64, 31, 32, 33] {
                drop(cache.zero(page).await.unwrap());
            }
            cache.flush(false).await.unwrap();

            // Page 31 sits at the end of segment 0000; pages 32 and 33 start
            // segment 0001.
            let (blob, len) = context.open("layout", b"0000").await.unwrap();
            assert_eq!(len, 32 * PAGE_SIZE as u64);
            blob.close().await.unwrap();
            let (blob, len) = context.open("layout", b"0001").await.unwrap();
            assert_eq!(len, 2 * PAGE_SIZE as u64);
            blob.close().await.unwrap();
        });
    }

    #[test_traced]
    fn test_round_trip_persists_mutations() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = config("roundtrip", 2);
            let cache = Cache::init(context.clone(), cfg.clone()).await.unwrap();
            {
                let mut page = cache.zero(7).await.unwrap();
                page.data_mut()[0] = 0xAB;
                page.data_mut()[PAGE_SIZE - 1] = 0xCD;
            }
            cache.flush(false).await.unwrap();
            assert!(cache.clean().await);

            // A fresh pool reads the same bytes back.
            let fresh = Cache::init(context.with_label("fresh"), cfg).await.unwrap();
            let page = fresh.read(7, false, None).await.unwrap();
            assert_eq!(page.data()[0], 0xAB);
            assert_eq!(page.data()[PAGE_SIZE - 1], 0xCD);
            assert!(page.data()[1..PAGE_SIZE - 1].iter().all(|&b| b == 0));
        });
    }

    #[test_traced]
    fn test_write_clean_page_is_noop() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cache = Cache::init(context.clone(), config("idempotent", 2))
                .await
                .unwrap();
            drop(cache.zero(0).await.unwrap());
            cache.flush(false).await.unwrap();
            let buffer = context.encode();
            assert!(buffer.contains("writes_total 1"), "{}", buffer);

            // Writing a clean page performs no I/O.
            let page = cache.read(0, true, None).await.unwrap();
            cache.write(page).await.unwrap();
            let buffer = context.encode();
            assert!(buffer.contains("writes_total 1"), "{}", buffer);
        });
    }

    #[test_traced]
    fn test_redirty_writes_again() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cache = Cache::init(context.clone(), config("redirty", 2))
                .await
                .unwrap();
            drop(cache.zero(0).await.unwrap());
            cache.flush(false).await.unwrap();

            // Dirtying the page again produces another write.
            let mut page = cache.read(0, true, None).await.unwrap();
            page.data_mut()[3] = 7;
            cache.write(page).await.unwrap();
            let buffer = context.encode();
            assert!(buffer.contains("writes_total 2"), "{}", buffer);

            // mark_dirty alone forces a write of unchanged bytes too.
            let mut page = cache.read(0, true, None).await.unwrap();
            page.mark_dirty();
            cache.write(page).await.unwrap();
            let buffer = context.encode();
            assert!(buffer.contains("writes_total 3"), "{}", buffer);
            assert!(cache.clean().await);
        });
    }

    #[test_traced]
    fn test_recovery_reads_missing_as_zeros() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let recovering = Arc::new(AtomicBool::new(true));
            let mut cfg = config("recovery", 4);
            cfg.recovering = recovering.clone();
            let cache = Cache::init(context.clone(), cfg).await.unwrap();

            // Nothing on disk, but recovery upgrades the miss to zeroes.
            let page = cache.read(42, false, None).await.unwrap();
            assert!(page.data().iter().all(|&b| b == 0));
            drop(page);
            assert!(cache.resident(42).await);
            assert!(cache.exists(42).await);

            // Outside recovery the same read is an error.
            recovering.store(false, Ordering::Relaxed);
            assert!(matches!(
                cache.read(100, false, None).await,
                Err(Error::MissingSegment { page: 100, .. })
            ));
            assert!(cache.try_read(100, None).await.is_none());
            assert!(!cache.exists(100).await);
        });
    }

    #[test_traced]
    fn test_truncate_removes_preceding_segments() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cache = Cache::init(context.clone(), config("truncate", 4))
                .await
                .unwrap();
            for page in 0..=70u64 {
                drop(cache.zero(page).await.unwrap());
            }
            cache.flush(false).await.unwrap();

            // Fault some old pages back in, one of them dirtied.
            drop(cache.read(5, false, None).await.unwrap());
            {
                let mut page = cache.read(40, true, None).await.unwrap();
                page.data_mut()[0] = 9;
            }
            assert!(cache.resident(5).await);

            // Remove everything before the segment containing page 64.
            assert!(cache.truncate(64).await.unwrap());
            assert!(!cache.resident(5).await);
            assert!(!cache.resident(40).await);
            assert!(cache.resident(70).await);
            let names = context.scan("truncate").await.unwrap();
            assert_eq!(names, vec![b"0002".to_vec()]);

            // The cutoff page itself survives.
            drop(cache.read(64, false, None).await.unwrap());

            // Removed pages are gone.
            assert!(!cache.exists(5).await);
            cache.audit().await;
        });
    }

    #[test_traced]
    fn test_truncate_refuses_apparent_wraparound() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cache = Cache::init(context.clone(), config("wraparound", 4))
                .await
                .unwrap();
            drop(cache.zero(10).await.unwrap());
            cache.flush(false).await.unwrap();

            // The latest page precedes the cutoff: refuse, remove nothing.
            assert!(!cache.truncate(1_000_000).await.unwrap());
            let names = context.scan("wraparound").await.unwrap();
            assert_eq!(names, vec![b"0000".to_vec()]);
            assert!(cache.resident(10).await);
        });
    }

    #[test_traced]
    fn test_flush_batch_overflow_degrades() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut cfg = config("overflow", 8);
            cfg.flush_batch = 1;
            let cache = Cache::init(context.clone(), cfg).await.unwrap();

            // Dirty pages across three segments with room for one open file.
            for page in [0u64, 40, 70] {
                drop(cache.zero(page).await.unwrap());
            }
            cache.flush(false).await.unwrap();
            assert!(cache.clean().await);
            for page in [0u64, 40, 70] {
                assert!(cache.exists(page).await, "page {page} not persisted");
            }
        });
    }

    #[derive(Clone)]
    struct RecordingLog(Arc<Mutex<Vec<u64>>>);

    impl LogFlush for RecordingLog {
        fn flush(&self, lsn: u64) -> impl std::future::Future<Output = ()> + Send {
            let log = self.0.clone();
            async move {
                log.lock().unwrap().push(lsn);
            }
        }
    }

    #[test_traced]
    fn test_log_flushed_before_write() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let flushed = Arc::new(Mutex::new(Vec::new()));
            let cfg = Config {
                partition: "wal".into(),
                slots: NZUsize!(4),
                page_size: NZUsize!(PAGE_SIZE),
                pages_per_segment: NZU64!(32),
                lsn_groups_per_page: 4,
                fsync: true,
                flush_batch: 16,
                precedes: ordered as fn(u64, u64) -> bool,
                log: RecordingLog(flushed.clone()),
                recovering: Arc::new(AtomicBool::new(false)),
            };
            let cache = Cache::init(context.clone(), cfg.clone()).await.unwrap();

            {
                let mut page = cache.zero(0).await.unwrap();
                page.data_mut()[0] = 1;
                page.record_lsn(0, 33);
                page.record_lsn(2, 99);
                page.record_lsn(2, 50); // keeps the max
            }
            cache.flush(false).await.unwrap();
            assert_eq!(*flushed.lock().unwrap(), vec![99]);

            // A page with no recorded positions skips the hook.
            drop(cache.zero(1).await.unwrap());
            cache.flush(false).await.unwrap();
            assert_eq!(*flushed.lock().unwrap(), vec![99]);

            // Positions are reset when a page is faulted back in from
            // storage: rewriting it there does not flush the log again.
            let fresh = Cache::init(context.with_label("fresh"), cfg).await.unwrap();
            let mut page = fresh.read(0, true, None).await.unwrap();
            page.mark_dirty();
            fresh.write(page).await.unwrap();
            assert_eq!(*flushed.lock().unwrap(), vec![99]);
        });
    }

    #[test_traced]
    fn test_read_only_shares_the_pool_lock() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            seed(context.with_label("seed"), "readonly", &[3]).await;
            let cache = Cache::init(context.clone(), config("readonly", 4))
                .await
                .unwrap();

            // Miss: escalates to the exclusive path and faults the page in.
            drop(cache.read_only(3, None).await.unwrap());
            let buffer = context.encode();
            assert!(buffer.contains("reads_total 1"), "{}", buffer);

            // Hits: two handles can be held at once.
            let a = cache.read_only(3, None).await.unwrap();
            let b = cache.read_only(3, None).await.unwrap();
            assert_eq!(a.slot(), b.slot());
            assert_eq!(a.page(), 3);
            assert!(a.data().iter().all(|&byte| byte == 0));
            drop(a);
            drop(b);
            let buffer = context.encode();
            assert!(buffer.contains("hits_total 2"), "{}", buffer);
        });
    }

    #[test_traced]
    fn test_concurrent_tasks() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            seed(
                context.with_label("seed"),
                "concurrent",
                &[0, 1, 2, 3, 4, 5, 6, 7],
            )
            .await;
            let cache = Cache::init(context.clone(), config("concurrent", 4))
                .await
                .unwrap();
            cache.set_latest(7).await;

            // Four tasks hammer eight pages through a four-slot pool, each
            // setting its own byte in every page.
            let mut handles = Vec::new();
            for task in 0..4u64 {
                let cache = cache.clone();
                handles.push(context.with_label("worker").spawn(move |_| async move {
                    for i in 0..8u64 {
                        let page = (task * 2 + i) % 8;
                        let mut guard = cache.read(page, true, Some(task)).await.unwrap();
                        guard.data_mut()[task as usize] = 1;
                        drop(guard);
                        if i % 3 == 0 {
                            drop(cache.read_only(page, None).await.unwrap());
                        }
                    }
                    cache.flush(true).await.unwrap();
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            cache.audit().await;
            cache.flush(false).await.unwrap();
            assert!(cache.clean().await);

            // Every page carries every task's byte.
            for page in 0..8u64 {
                let guard = cache.read_only(page, None).await.unwrap();
                assert_eq!(&guard.data()[..4], &[1, 1, 1, 1], "page {page}");
            }
        });
    }

    #[test_traced]
    fn test_memory_usage_scales_with_slots() {
        let small = config("m", 2);
        let large = config("m", 64);
        assert!(small.memory_usage() < large.memory_usage());
        assert!(large.memory_usage() >= 64 * PAGE_SIZE);
    }
}
