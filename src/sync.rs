//! Per-key concurrency primitives
//!
//! Sender and session state is serialized per key, never behind one global
//! lock, so unrelated senders stay fully concurrent.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{OwnedMutexGuard, mpsc, oneshot};

/// How long an idle lane worker lingers before exiting
const LANE_IDLE: Duration = Duration::from_secs(30);

/// A set of async mutexes, one per key, created on demand
///
/// Entries are held weakly: a key's mutex lives only while someone holds or
/// waits for it, so the table does not grow with every key ever seen.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Weak<tokio::sync::Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Create an empty lock table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting in FIFO order behind earlier callers
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
                existing
            } else {
                // Drop entries nobody references any more
                locks.retain(|_, weak| weak.strong_count() > 0);
                let fresh = Arc::new(tokio::sync::Mutex::new(()));
                locks.insert(key.clone(), Arc::downgrade(&fresh));
                fresh
            }
        };
        mutex.lock_owned().await
    }

    /// Number of keys currently tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Whether no key is currently locked or awaited
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Job = BoxFuture<'static, ()>;

type LaneMap<K> = Arc<Mutex<HashMap<K, mpsc::UnboundedSender<Job>>>>;

/// Per-key FIFO executors
///
/// Jobs submitted for the same key run one at a time in submission order;
/// jobs for different keys run concurrently. Submission is synchronous, so
/// the order of `submit` calls is the order of execution.
pub struct OrderedLanes<K> {
    lanes: LaneMap<K>,
    idle: Duration,
}

impl<K> Clone for OrderedLanes<K> {
    fn clone(&self) -> Self {
        Self {
            lanes: Arc::clone(&self.lanes),
            idle: self.idle,
        }
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> Default for OrderedLanes<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> OrderedLanes<K> {
    /// Create an empty set of lanes
    #[must_use]
    pub fn new() -> Self {
        Self::with_idle(LANE_IDLE)
    }

    /// Create lanes whose idle workers exit after `idle`
    #[must_use]
    pub fn with_idle(idle: Duration) -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            idle,
        }
    }

    /// Queue `job` on the lane for `key` and return a future for its output
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit<T: Send + 'static>(
        &self,
        key: K,
        job: impl std::future::Future<Output = T> + Send + 'static,
    ) -> BoxFuture<'static, Option<T>> {
        let (tx, rx) = oneshot::channel();
        let wrapped: Job = async move {
            match AssertUnwindSafe(job).catch_unwind().await {
                Ok(output) => {
                    let _ = tx.send(output);
                }
                Err(_) => tracing::error!("lane job panicked"),
            }
        }
        .boxed();

        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let wrapped = match lanes.get(&key) {
            Some(sender) => match sender.send(wrapped) {
                Ok(()) => None,
                Err(mpsc::error::SendError(job)) => Some(job),
            },
            None => Some(wrapped),
        };

        if let Some(job) = wrapped {
            let (sender, receiver) = mpsc::unbounded_channel();
            // A fresh channel always accepts
            let _ = sender.send(job);
            lanes.insert(key.clone(), sender);
            tokio::spawn(run_lane(Arc::clone(&self.lanes), key, receiver, self.idle));
        }
        drop(lanes);

        async move { rx.await.ok() }.boxed()
    }

    /// Number of live lanes
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no lane is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_lane<K: Eq + Hash>(
    lanes: LaneMap<K>,
    key: K,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    idle: Duration,
) {
    loop {
        match tokio::time::timeout(idle, receiver.recv()).await {
            Ok(Some(job)) => job.await,
            Ok(None) => break,
            Err(_) => {
                // Submitters hold the same lock while sending, so an empty
                // queue observed here cannot gain a job before removal
                let mut map = lanes.lock().unwrap_or_else(PoisonError::into_inner);
                if receiver.is_empty() {
                    map.remove(&key);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn keyed_lock_serializes_same_key() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&"same".to_string()).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn keyed_lock_different_keys_do_not_block() {
        let locks = KeyedLocks::<&'static str>::new();
        let _a = locks.lock(&"a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&"b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn lanes_preserve_submission_order() {
        let lanes = OrderedLanes::<&'static str>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut replies = Vec::new();
        for i in 0..20_u64 {
            let seen = Arc::clone(&seen);
            replies.push(lanes.submit("k", async move {
                // Earlier jobs sleep longer; order must still hold
                tokio::time::sleep(Duration::from_millis(20 - i)).await;
                seen.lock().unwrap().push(i);
                i
            }));
        }

        let outputs: Vec<_> = futures::future::join_all(replies).await;
        assert_eq!(outputs, (0..20).map(Some).collect::<Vec<_>>());
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn lanes_run_keys_concurrently() {
        let lanes = OrderedLanes::<&'static str>::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocked = lanes.submit("slow", async move {
            let _ = release_rx.await;
            "slow"
        });
        let fast = lanes.submit("fast", async { "fast" });

        let fast = tokio::time::timeout(Duration::from_secs(1), fast).await;
        assert_eq!(fast.unwrap(), Some("fast"));

        release_tx.send(()).unwrap();
        assert_eq!(blocked.await, Some("slow"));
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_lane() {
        let lanes = OrderedLanes::<u8>::new();
        let failed = lanes.submit(1, async { panic!("boom") });
        let ok = lanes.submit(1, async { 7 });
        assert_eq!(failed.await, None::<()>);
        assert_eq!(ok.await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_lanes_are_reclaimed() {
        let lanes = OrderedLanes::<u8>::with_idle(Duration::from_secs(1));
        assert_eq!(lanes.submit(1, async { 1 }).await, Some(1));
        assert_eq!(lanes.len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(lanes.is_empty());

        assert_eq!(lanes.submit(1, async { 2 }).await, Some(2));
    }
}
