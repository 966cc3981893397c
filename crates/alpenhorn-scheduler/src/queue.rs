//! A fair multi-FIFO queue.
//!
//! Grounded on `alpenhorn/scheduler/queue.py`'s `FairMultiFIFOQueue`: many
//! named FIFOs share one queue, and `get()` picks the next item from
//! whichever FIFO currently has the *fewest* in-progress items, so that no
//! single busy FIFO starves the others. Items may also be marked
//! `exclusive`, meaning their FIFO is locked (no further items popped from
//! it) for as long as that item is in progress, and puts may be deferred
//! by a delay, implemented with a small time-ordered heap drained each time
//! `get()` would otherwise block.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use alpenhorn_common::metrics::Metric;

/// Requirements on a FIFO key. `alpenhorn`'s Python original only needs
/// the key to be hashable; label metrics additionally need it printable.
pub trait FifoKey: Eq + Hash + Clone + std::fmt::Display + Send + 'static {}
impl<T: Eq + Hash + Clone + std::fmt::Display + Send + 'static> FifoKey for T {}

struct Deferred<K, T> {
    at: Instant,
    seq: u64,
    item: T,
    key: K,
    exclusive: bool,
}

impl<K, T> PartialEq for Deferred<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl<K, T> Eq for Deferred<K, T> {}
impl<K, T> PartialOrd for Deferred<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<K, T> Ord for Deferred<K, T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so `BinaryHeap` (a max-heap) behaves like a min-heap on `at`.
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner<K, T> {
    fifos: HashMap<K, VecDeque<(T, bool)>>,
    inprogress_counts: HashMap<K, usize>,
    keys_by_inprogress: Vec<HashSet<K>>,
    fifo_locks: HashSet<K>,
    total_queued: usize,
    total_inprogress: usize,
}

struct Deferrals<K, T> {
    heap: BinaryHeap<Deferred<K, T>>,
    joining: bool,
}

pub struct FairMultiFifoQueue<K: FifoKey, T: Send + 'static> {
    inner: Mutex<Inner<K, T>>,
    not_empty: Condvar,
    all_tasks_done: Condvar,
    deferrals: Mutex<Deferrals<K, T>>,
    seq: AtomicU64,

    qcount: Metric,
    qcount_any: Metric,
    qcount_all: Metric,
    qlock: Metric,
}

const GET_PERIOD: Duration = Duration::from_secs(10);

impl<K: FifoKey, T: Send + 'static> FairMultiFifoQueue<K, T> {
    pub fn new() -> Self {
        let qcount = Metric::new("queue_count", "Count of queued tasks", false, &["fifo", "status"], &[])
            .expect("static metric registration");
        let qcount_any = Metric::new("queue_count", "Count of queued tasks", false, &["status"], &[("fifo", "_ALL_")])
            .expect("static metric registration");
        let qcount_all = Metric::new("queue_count", "Count of queued tasks", false, &["fifo"], &[("status", "any")])
            .expect("static metric registration");
        let qlock = Metric::new("queue_locked", "The queue fifo is locked", false, &["fifo"], &[])
            .expect("static metric registration");

        Self {
            inner: Mutex::new(Inner {
                fifos: HashMap::new(),
                inprogress_counts: HashMap::new(),
                keys_by_inprogress: vec![HashSet::new()],
                fifo_locks: HashSet::new(),
                total_queued: 0,
                total_inprogress: 0,
            }),
            not_empty: Condvar::new(),
            all_tasks_done: Condvar::new(),
            deferrals: Mutex::new(Deferrals { heap: BinaryHeap::new(), joining: false }),
            seq: AtomicU64::new(0),
            qcount,
            qcount_any,
            qcount_all,
            qlock,
        }
    }

    fn inc_metrics(&self, key: &K, status: &str) {
        let fifo = key.to_string();
        let _ = self.qcount.inc(&[("fifo", &fifo), ("status", status)]);
        let _ = self.qcount_any.inc(&[("fifo", &fifo)]);
        let _ = self.qcount_all.inc(&[("status", status)]);
    }

    fn dec_metrics(&self, key: &K, status: &str) {
        let fifo = key.to_string();
        let _ = self.qcount.dec(&[("fifo", &fifo), ("status", status)]);
        let _ = self.qcount_any.dec(&[("fifo", &fifo)]);
        let _ = self.qcount_all.dec(&[("status", status)]);
    }

    fn put_locked(&self, inner: &mut Inner<K, T>, item: T, key: K, exclusive: bool) {
        if !inner.fifos.contains_key(&key) {
            inner.fifos.insert(key.clone(), VecDeque::new());
            inner.inprogress_counts.insert(key.clone(), 0);
            inner.keys_by_inprogress[0].insert(key.clone());
        }
        inner.fifos.get_mut(&key).unwrap().push_back((item, exclusive));
        inner.total_queued += 1;
        self.inc_metrics(&key, "queued");
    }

    /// Put `item` into the FIFO named `key`, or, if `wait` is `Some`,
    /// delay the put by at least that long. Returns `false` only if a
    /// deferred put is discarded because another thread is `join()`-ing.
    pub fn put(&self, item: T, key: K, exclusive: bool, wait: Option<Duration>) -> bool {
        match wait {
            Some(wait) if !wait.is_zero() => {
                let mut deferrals = self.deferrals.lock();
                if deferrals.joining {
                    return false;
                }
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                deferrals.heap.push(Deferred { at: Instant::now() + wait, seq, item, key: key.clone(), exclusive });
                self.inc_metrics(&key, "deferred");
                true
            }
            _ => {
                let mut inner = self.inner.lock();
                self.put_locked(&mut inner, item, key, exclusive);
                self.not_empty.notify_one();
                true
            }
        }
    }

    /// Report that the in-progress task taken from FIFO `key` is finished.
    pub fn task_done(&self, key: &K) {
        let mut inner = self.inner.lock();
        let count = *inner.inprogress_counts.get(key).unwrap_or(&0);
        assert!(count > 0, "no unfinished tasks for this FIFO");

        inner.keys_by_inprogress[count].remove(key);
        inner.fifo_locks.remove(key);
        let _ = self.qlock.set(0.0, &[("fifo", &key.to_string())]);

        let count = count - 1;
        inner.inprogress_counts.insert(key.clone(), count);
        inner.total_inprogress -= 1;
        self.dec_metrics(key, "in-progress");

        inner.keys_by_inprogress[count].insert(key.clone());

        if inner.total_queued == 0 && inner.total_inprogress == 0 {
            self.all_tasks_done.notify_all();
        }
    }

    /// Block until the queue and all in-progress tasks are drained,
    /// discarding any pending (or subsequently added) deferred puts.
    pub fn join(&self) {
        {
            let mut deferrals = self.deferrals.lock();
            deferrals.joining = true;
            deferrals.heap.clear();
        }

        let mut inner = self.inner.lock();
        while inner.total_inprogress > 0 || inner.total_queued > 0 {
            self.all_tasks_done.wait(&mut inner);
        }
        drop(inner);

        self.deferrals.lock().joining = false;
    }

    pub fn qsize(&self) -> usize {
        self.inner.lock().total_queued
    }

    pub fn inprogress_size(&self) -> usize {
        self.inner.lock().total_inprogress
    }

    pub fn fifo_size(&self, key: &K) -> usize {
        let inner = self.inner.lock();
        match inner.fifos.get(key) {
            Some(fifo) => fifo.len() + inner.inprogress_counts.get(key).copied().unwrap_or(0),
            None => 0,
        }
    }

    pub fn deferred_size(&self) -> usize {
        self.deferrals.lock().heap.len()
    }

    fn drain_expired_deferrals(&self, inner: &mut Inner<K, T>) {
        let mut deferrals = self.deferrals.lock();
        let now = Instant::now();
        while matches!(deferrals.heap.peek(), Some(d) if d.at <= now) {
            let d = deferrals.heap.pop().unwrap();
            self.dec_metrics(&d.key, "deferred");
            self.put_locked(inner, d.item, d.key, d.exclusive);
        }
    }

    fn next_deferral_deadline(&self) -> Option<Instant> {
        self.deferrals.lock().heap.peek().map(|d| d.at)
    }

    /// One iteration of the `get()` loop, waiting at most `budget`.
    fn get_once(&self, budget: Duration) -> Option<(T, K)> {
        let mut timeout_at = Instant::now() + budget;
        if let Some(first_expiry) = self.next_deferral_deadline() {
            if timeout_at > first_expiry {
                timeout_at = first_expiry;
            }
        }

        let mut inner = self.inner.lock();
        let wait = timeout_at.saturating_duration_since(Instant::now());
        if !wait.is_zero() && inner.total_queued == 0 {
            self.not_empty.wait_for(&mut inner, wait);
        }

        self.drain_expired_deferrals(&mut inner);

        if inner.total_queued < 1 {
            return None;
        }

        let mut chosen: Option<K> = None;
        let mut skipped_exclusive = false;

        'outer: for count in 0..inner.keys_by_inprogress.len() {
            if inner.keys_by_inprogress[count].is_empty() {
                continue;
            }
            let candidates: Vec<K> = inner.keys_by_inprogress[count].iter().cloned().collect();
            for candidate in candidates {
                if inner.fifo_locks.contains(&candidate) {
                    skipped_exclusive = true;
                    continue;
                }
                let Some(fifo) = inner.fifos.get(&candidate) else { continue };
                if fifo.is_empty() {
                    continue;
                }
                if count > 0 && fifo.front().map(|(_, excl)| *excl).unwrap_or(false) {
                    skipped_exclusive = true;
                    continue;
                }
                inner.keys_by_inprogress[count].remove(&candidate);
                chosen = Some(candidate);
                break 'outer;
            }
        }

        let Some(key) = chosen else {
            drop(inner);
            if skipped_exclusive {
                let remaining = timeout_at.saturating_duration_since(Instant::now());
                if !remaining.is_zero() {
                    std::thread::sleep(remaining);
                }
            }
            return None;
        };

        let (item, exclusive) = inner.fifos.get_mut(&key).unwrap().pop_front().unwrap();
        inner.total_queued -= 1;
        inner.total_inprogress += 1;
        self.inc_metrics(&key, "in-progress");
        self.dec_metrics(&key, "queued");

        if exclusive {
            inner.fifo_locks.insert(key.clone());
            let _ = self.qlock.set(1.0, &[("fifo", &key.to_string())]);
        }

        let count = inner.inprogress_counts.get(&key).copied().unwrap_or(0) + 1;
        inner.inprogress_counts.insert(key.clone(), count);
        if inner.keys_by_inprogress.len() == count {
            let mut set = HashSet::new();
            set.insert(key.clone());
            inner.keys_by_inprogress.push(set);
        } else {
            inner.keys_by_inprogress[count].insert(key.clone());
        }

        Some((item, key))
    }

    /// Take the next item, waiting up to `timeout` (or forever if `None`).
    /// The returned key must be passed back to [`Self::task_done`] once
    /// the item has been processed.
    pub fn get(&self, timeout: Option<Duration>) -> Option<(T, K)> {
        match timeout {
            None => loop {
                if let Some(item) = self.get_once(GET_PERIOD) {
                    return Some(item);
                }
            },
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    let budget = remaining.min(GET_PERIOD);
                    if let Some(item) = self.get_once(budget) {
                        return Some(item);
                    }
                }
            }
        }
    }
}

impl<K: FifoKey, T: Send + 'static> Default for FairMultiFifoQueue<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fairness_prefers_least_busy_fifo() {
        let q: FairMultiFifoQueue<String, i32> = FairMultiFifoQueue::new();
        q.put(1, "a".into(), false, None);
        q.put(2, "a".into(), false, None);
        q.put(3, "b".into(), false, None);

        let (_, k1) = q.get(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(k1, "a");
        // "a" now has one in-progress; "b" has zero, so "b" goes next.
        let (_, k2) = q.get(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(k2, "b");
    }

    #[test]
    fn exclusive_item_locks_its_fifo_until_done() {
        let q: FairMultiFifoQueue<String, i32> = FairMultiFifoQueue::new();
        q.put(1, "a".into(), true, None);
        q.put(2, "a".into(), false, None);

        let (_, k) = q.get(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(k, "a");
        // second item is blocked behind the exclusive in-progress item
        assert!(q.get(Some(Duration::from_millis(50))).is_none());

        q.task_done(&k);
        let (_, k2) = q.get(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(k2, "a");
    }

    #[test]
    fn deferred_put_is_not_immediately_visible() {
        let q: FairMultiFifoQueue<String, i32> = FairMultiFifoQueue::new();
        q.put(1, "a".into(), false, Some(Duration::from_millis(200)));
        assert!(q.get(Some(Duration::from_millis(50))).is_none());
        assert_eq!(q.deferred_size(), 1);

        let (_, k) = q.get(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(k, "a");
    }

    #[test]
    fn join_discards_pending_deferrals() {
        let q: FairMultiFifoQueue<String, i32> = FairMultiFifoQueue::new();
        q.put(1, "a".into(), false, Some(Duration::from_secs(60)));
        q.join();
        assert_eq!(q.deferred_size(), 0);
    }
}
