//! Bounded worker pool.
//!
//! One worker thread serves one admitted connection. Admission is a single
//! check-and-increment under the pool mutex, so at most `max_threads`
//! connections are ever served at once; anything beyond that is refused
//! immediately instead of queued.
//!
//! The only ways to change pool state are [`WorkerPool::try_admit`],
//! [`WorkerPool::release`] (or dropping the [`SlotGuard`]), and
//! [`WorkerPool::begin_shutdown`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::error::ErrorClass;
use crate::transport::Closer;

pub type SlotId = u64;

/// Capacity of a slot's diagnostic label, in bytes.
pub const LABEL_CAPACITY: usize = 80;

/// Fixed-size peer label kept with each slot.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SlotLabel {
    bytes: [u8; LABEL_CAPACITY],
    len: usize,
}

impl SlotLabel {
    /// Copies `label`, truncating at a character boundary if it is too long.
    pub fn new(label: &str) -> Self {
        let mut len = label.len().min(LABEL_CAPACITY);
        while !label.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0u8; LABEL_CAPACITY];
        bytes[..len].copy_from_slice(&label.as_bytes()[..len]);
        Self { bytes, len }
    }

    pub fn as_str(&self) -> &str {
        // Built from a &str cut at a char boundary.
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }
}

impl fmt::Display for SlotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SlotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotLabel({:?})", self.as_str())
    }
}

/// Lifecycle of one client connection.
///
/// ```text
/// Accepted -> Admitted -> Serving -> Closing -> Closed
///     \            \__________________/
///      -> Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Admitted,
    Serving,
    Closing,
    Closed,
    Rejected,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("connection cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Accepted, Admitted)
                | (Accepted, Rejected)
                | (Admitted, Serving)
                | (Admitted, Closing)
                | (Serving, Closing)
                | (Closing, Closed)
        )
    }

    pub fn advance(self, next: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Rejected)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("all {max} worker slots are busy")]
    PoolFull { max: usize },

    #[error("daemon is shutting down")]
    ShuttingDown,
}

impl AdmitError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Capacity
    }
}

struct SlotEntry {
    label: SlotLabel,
    closer: Box<dyn Closer>,
}

struct PoolState {
    slots: HashMap<SlotId, SlotEntry>,
    active_count: usize,
    shutdown: bool,
    next_slot: SlotId,
}

pub struct WorkerPool {
    max_threads: usize,
    state: Mutex<PoolState>,
    idle: Condvar,
}

impl WorkerPool {
    pub fn new(max_threads: usize) -> Arc<Self> {
        Arc::new(Self {
            max_threads,
            state: Mutex::new(PoolState {
                slots: HashMap::new(),
                active_count: 0,
                shutdown: false,
                next_slot: 1,
            }),
            idle: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_count
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Labels of every live slot, for diagnostics.
    pub fn labels(&self) -> Vec<(SlotId, SlotLabel)> {
        let state = self.lock();
        let mut labels: Vec<_> = state
            .slots
            .iter()
            .map(|(&id, entry)| (id, entry.label))
            .collect();
        labels.sort_by_key(|(id, _)| *id);
        labels
    }

    /// Claims a slot if one is free and the pool is not shutting down.
    ///
    /// The slot is held until the returned guard is released or dropped.
    pub fn try_admit(
        self: &Arc<Self>,
        label: SlotLabel,
        closer: Box<dyn Closer>,
    ) -> Result<SlotGuard, AdmitError> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(AdmitError::ShuttingDown);
        }
        if state.active_count >= self.max_threads {
            return Err(AdmitError::PoolFull {
                max: self.max_threads,
            });
        }

        let id = state.next_slot;
        state.next_slot += 1;
        state.active_count += 1;
        state.slots.insert(id, SlotEntry { label, closer });
        debug!(slot = id, peer = %label, active = state.active_count, "slot admitted");

        Ok(SlotGuard {
            pool: Arc::clone(self),
            id,
            label,
        })
    }

    /// Returns a slot to the pool.
    pub fn release(&self, guard: SlotGuard) {
        drop(guard);
    }

    fn release_slot(&self, id: SlotId) {
        let mut state = self.lock();
        if state.slots.remove(&id).is_some() {
            state.active_count -= 1;
            debug!(slot = id, active = state.active_count, "slot released");
            if state.active_count == 0 {
                self.idle.notify_all();
            }
        }
    }

    /// Stops admissions and forces every live connection closed.
    ///
    /// Returns how many connections were signalled. Calling it again is harmless.
    pub fn begin_shutdown(&self) -> usize {
        let mut state = self.lock();
        state.shutdown = true;
        for entry in state.slots.values() {
            entry.closer.close();
        }
        state.slots.len()
    }

    /// Blocks until every slot has been released.
    pub fn wait_idle(&self) {
        let mut state = self.lock();
        while state.active_count > 0 {
            state = self.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`WorkerPool::wait_idle`], giving up after `timeout`. Returns true once idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.active_count > 0 {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            state = self
                .idle
                .wait_timeout(state, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// A claimed worker slot. Dropping it releases the slot.
pub struct SlotGuard {
    pool: Arc<WorkerPool>,
    id: SlotId,
    label: SlotLabel,
}

impl SlotGuard {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn label(&self) -> SlotLabel {
        self.label
    }
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release_slot(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[derive(Clone, Default)]
    struct FlagCloser(Arc<AtomicBool>);

    impl Closer for FlagCloser {
        fn close(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn admit(pool: &Arc<WorkerPool>) -> Result<SlotGuard, AdmitError> {
        pool.try_admit(SlotLabel::new("test"), Box::new(FlagCloser::default()))
    }

    #[test]
    fn admits_up_to_capacity_then_rejects() {
        let pool = WorkerPool::new(2);
        let first = admit(&pool).expect("first");
        let _second = admit(&pool).expect("second");
        assert_eq!(admit(&pool).unwrap_err(), AdmitError::PoolFull { max: 2 });
        assert_eq!(pool.active_count(), 2);

        pool.release(first);
        assert_eq!(pool.active_count(), 1);
        admit(&pool).expect("slot freed");
    }

    #[test]
    fn concurrent_arrivals_never_exceed_capacity() {
        let pool = WorkerPool::new(3);
        let barrier = Arc::new(Barrier::new(8));
        let admitted = Arc::new(AtomicUsize::new(0));
        let (hold_tx, hold_rx) = std::sync::mpsc::channel::<SlotGuard>();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                let admitted = Arc::clone(&admitted);
                let hold_tx = hold_tx.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if let Ok(guard) = admit(&pool) {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        let _ = hold_tx.send(guard);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker thread");
        }
        drop(hold_tx);

        let held: Vec<SlotGuard> = hold_rx.iter().collect();
        assert_eq!(admitted.load(Ordering::SeqCst), 3);
        assert_eq!(held.len(), 3);
        assert_eq!(pool.active_count(), 3);
        drop(held);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn shutdown_closes_live_slots_and_stops_admission() {
        let pool = WorkerPool::new(4);
        let closer = FlagCloser::default();
        let guard = pool
            .try_admit(SlotLabel::new("peer"), Box::new(closer.clone()))
            .expect("admit");

        assert_eq!(pool.begin_shutdown(), 1);
        assert!(closer.0.load(Ordering::SeqCst));
        assert!(pool.is_shutdown());
        assert_eq!(admit(&pool).unwrap_err(), AdmitError::ShuttingDown);

        assert!(!pool.wait_idle_timeout(Duration::from_millis(20)));
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.wait_idle())
        };
        drop(guard);
        waiter.join().expect("waiter");
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn labels_truncate_on_char_boundaries() {
        let long = "é".repeat(50);
        let label = SlotLabel::new(&long);
        assert_eq!(label.as_str().len(), LABEL_CAPACITY);
        assert_eq!(SlotLabel::new("127.0.0.1:4000").as_str(), "127.0.0.1:4000");

        let odd = format!("x{}", "é".repeat(50));
        assert_eq!(SlotLabel::new(&odd).as_str().len(), LABEL_CAPACITY - 1);
    }

    #[test]
    fn state_machine_only_allows_forward_edges() {
        use ConnectionState::*;
        let serving = Accepted
            .advance(Admitted)
            .and_then(|s| s.advance(Serving))
            .expect("forward path");
        assert_eq!(serving, Serving);
        assert!(Accepted.advance(Serving).is_err());
        assert!(Closed.advance(Serving).is_err());
        assert!(Rejected.is_terminal());
        assert_eq!(
            Serving.advance(Admitted),
            Err(InvalidTransition {
                from: Serving,
                to: Admitted
            })
        );
    }
}
