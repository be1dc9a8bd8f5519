//! Grey object work buffers.
//!
//! Grey objects travel in fixed-size [`WorkBuf`]s. A [`GcWork`] is private to
//! one marker (a background worker, an assisting mutator, a root scan) and
//! holds two buffers so that alternating pushes and pops at a buffer
//! boundary do not ping-pong buffers with the shared [`GreyQueue`]. Full
//! buffers are published to the queue; drained buffers go back to its pool.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::address::Address;

/// Object addresses held by one work buffer.
pub const WORK_BUF_ENTRIES: usize = 253;

/// A fixed-capacity stack of grey objects.
#[derive(Debug)]
pub struct WorkBuf {
    objs: Vec<Address>,
}

impl WorkBuf {
    fn new() -> Box<Self> {
        Box::new(Self {
            objs: Vec::with_capacity(WORK_BUF_ENTRIES),
        })
    }

    /// Number of objects in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objs.len()
    }

    /// Returns `true` if the buffer holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    /// Returns `true` if no more objects fit.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.objs.len() == WORK_BUF_ENTRIES
    }
}

/// The global pool of grey work.
///
/// Publishing a full buffer wakes one parked mark worker.
#[derive(Debug, Default)]
pub struct GreyQueue {
    full: SegQueue<Box<WorkBuf>>,
    empty: SegQueue<Box<WorkBuf>>,
    nfull: AtomicUsize,
    waiters: AtomicUsize,
    epoch: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl GreyQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no published buffer is waiting to be scanned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nfull.load(Ordering::SeqCst) == 0
    }

    /// Number of published buffers.
    #[must_use]
    pub fn full_buffers(&self) -> usize {
        self.nfull.load(Ordering::SeqCst)
    }

    /// Number of pooled empty buffers.
    #[must_use]
    pub fn empty_buffers(&self) -> usize {
        self.empty.len()
    }

    /// Publishes a non-empty buffer.
    pub fn put_full(&self, buf: Box<WorkBuf>) {
        debug_assert!(!buf.is_empty());
        self.full.push(buf);
        self.nfull.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.cond.notify_one();
        }
    }

    /// Takes a published buffer.
    pub fn get_full(&self) -> Option<Box<WorkBuf>> {
        let buf = self.full.pop()?;
        self.nfull.fetch_sub(1, Ordering::SeqCst);
        Some(buf)
    }

    /// Returns a drained buffer to the pool.
    pub fn put_empty(&self, mut buf: Box<WorkBuf>) {
        buf.objs.clear();
        self.empty.push(buf);
    }

    /// Takes a pooled buffer, allocating one if the pool is dry.
    pub fn get_empty(&self) -> Box<WorkBuf> {
        self.empty.pop().unwrap_or_else(WorkBuf::new)
    }

    /// Wake-up epoch; bumped by [`notify_all`](Self::notify_all).
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Wakes every parked worker, for phase changes and shutdown.
    pub fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Parks until a buffer is published, the epoch moves past `seen`, or
    /// `timeout` elapses.
    pub fn wait_for_work(&self, seen: u64, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        if self.is_empty() && self.epoch() == seen {
            let _ = self.cond.wait_for(&mut guard, timeout);
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A marker's private grey buffers plus the statistics it has not yet
/// published.
#[derive(Debug, Default)]
pub struct GcWork {
    primary: Option<Box<WorkBuf>>,
    secondary: Option<Box<WorkBuf>>,
    /// Bytes marked since the last flush.
    pub(crate) bytes_marked: u64,
    /// Bytes scanned since the last flush.
    pub(crate) scan_work: i64,
}

impl GcWork {
    /// Creates a work cache with no buffers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a grey object, publishing a full buffer when both local ones
    /// are full.
    pub fn put(&mut self, queue: &GreyQueue, obj: Address) {
        let primary_full = self.primary.as_ref().map_or(true, |b| b.is_full());
        if primary_full {
            std::mem::swap(&mut self.primary, &mut self.secondary);
            if self.primary.as_ref().map_or(true, |b| b.is_full()) {
                if let Some(full) = self.primary.take() {
                    queue.put_full(full);
                }
                self.primary = Some(queue.get_empty());
            }
        }
        if let Some(buf) = self.primary.as_mut() {
            buf.objs.push(obj);
        }
    }

    /// Pops a grey object, refilling from the queue when both local
    /// buffers are empty.
    pub fn try_get(&mut self, queue: &GreyQueue) -> Option<Address> {
        if let Some(obj) = self.primary.as_mut().and_then(|b| b.objs.pop()) {
            return Some(obj);
        }
        std::mem::swap(&mut self.primary, &mut self.secondary);
        if let Some(obj) = self.primary.as_mut().and_then(|b| b.objs.pop()) {
            return Some(obj);
        }
        let mut full = queue.get_full()?;
        if let Some(old) = self.primary.take() {
            queue.put_empty(old);
        }
        let obj = full.objs.pop();
        self.primary = Some(full);
        obj
    }

    /// Publishes every non-empty local buffer and returns the rest to the
    /// pool. Statistics are left for the caller to flush.
    pub fn dispose(&mut self, queue: &GreyQueue) {
        for buf in [self.primary.take(), self.secondary.take()].into_iter().flatten() {
            if buf.is_empty() {
                queue.put_empty(buf);
            } else {
                queue.put_full(buf);
            }
        }
    }

    /// Returns `true` if no local grey object is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.primary.as_ref().map_or(true, |b| b.is_empty())
            && self.secondary.as_ref().map_or(true, |b| b.is_empty())
    }

    /// Takes the unpublished statistics, leaving zeros behind.
    pub(crate) fn take_stats(&mut self) -> (u64, i64) {
        (
            std::mem::take(&mut self.bytes_marked),
            std::mem::take(&mut self.scan_work),
        )
    }
}
