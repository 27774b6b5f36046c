use crate::cancel::CancelToken;
use crate::error::SyncError;
use crate::metrics::EngineMetrics;
use crate::subscription::LiveSubscription;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

type CloseFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + Sync>;

/// Owns one live subscription: the in-flight cancellation token and the
/// teardown callback. Created on interest-set entry, closed on exit; it
/// never outlives its key's membership. Dropping an unclosed handle fires
/// the token so a leaked subscription can at least stop mutating stores.
pub struct SubscriptionHandle {
    token: CancelToken,
    close: Option<CloseFn>,
}

impl SubscriptionHandle {
    pub fn new(token: CancelToken, close: impl FnOnce() -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Self {
        Self {
            token,
            close: Some(Box::new(close)),
        }
    }

    /// Wraps an already-subscribed [`LiveSubscription`].
    pub fn from_subscription<P, R, S>(subscription: LiveSubscription<P, R, S>) -> Self
    where
        P: Clone + Send + Sync + 'static,
        R: Send + 'static,
        S: Clone + Send + Sync + 'static,
    {
        let token = subscription.token().unwrap_or_default();
        Self::new(token, move || {
            Box::pin(async move { subscription.unsubscribe().await })
        })
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    async fn close(mut self) {
        self.token.cancel();
        if let Some(close) = self.close.take() {
            close().await;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.close.is_some() {
            self.token.cancel();
        }
    }
}

/// Opens a subscription for one resource key, returning its handle once the
/// provider has acknowledged it.
pub type OpenFn<K> =
    Arc<dyn Fn(K) -> BoxFuture<'static, Result<SubscriptionHandle, SyncError>> + Send + Sync>;

/// What one reconciliation pass did.
#[derive(Debug)]
pub struct ReconcileOutcome<K> {
    pub subscribed: Vec<K>,
    pub unsubscribed: Vec<K>,
    pub failed: Vec<(K, SyncError)>,
}

impl<K> ReconcileOutcome<K> {
    fn empty() -> Self {
        Self {
            subscribed: Vec::new(),
            unsubscribed: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// True when the pass issued no subscribe or unsubscribe calls.
    pub fn is_noop(&self) -> bool {
        self.subscribed.is_empty() && self.unsubscribed.is_empty() && self.failed.is_empty()
    }
}

/// Converges the set of live subscriptions toward a recomputed interest
/// set, acting only on the delta.
///
/// For every key in the handle map there is exactly one live subscription;
/// keys present in both the interest set and the active set are left
/// untouched, so an unchanged interest set makes a reconciliation pass a
/// no-op. A key whose subscription fails to open is left out of the active
/// set and retried on the next pass.
pub struct SetReconciler<K> {
    handles: DashMap<K, SubscriptionHandle>,
    open: OpenFn<K>,
    metrics: Arc<EngineMetrics>,
}

impl<K> SetReconciler<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(open: OpenFn<K>) -> Self {
        Self {
            handles: DashMap::new(),
            open,
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    /// Shares an engine-wide metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// The current active subscription set.
    pub fn active_keys(&self) -> HashSet<K> {
        self.handles.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.handles.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// One reconciliation pass: unsubscribes `active − interest`, subscribes
    /// `interest − active`, leaves the intersection untouched.
    #[instrument(skip_all, fields(interest = interest.len(), active = self.handles.len()))]
    pub async fn reconcile(&self, interest: &HashSet<K>) -> ReconcileOutcome<K> {
        let mut outcome = ReconcileOutcome::empty();

        let removed: Vec<K> = self
            .handles
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| !interest.contains(key))
            .collect();
        for key in removed {
            if let Some((key, handle)) = self.handles.remove(&key) {
                handle.close().await;
                self.metrics.record_unsubscribe();
                debug!(key = ?key, "unsubscribed");
                outcome.unsubscribed.push(key);
            }
        }

        for key in interest {
            if self.handles.contains_key(key) {
                continue;
            }
            match (self.open)(key.clone()).await {
                Ok(handle) => {
                    self.handles.insert(key.clone(), handle);
                    self.metrics.record_subscribe();
                    debug!(key = ?key, "subscribed");
                    outcome.subscribed.push(key.clone());
                }
                Err(err) => {
                    warn!(key = ?key, error = %err, "subscription failed, retrying on next pass");
                    self.metrics.record_failure();
                    outcome.failed.push((key.clone(), err));
                }
            }
        }

        outcome
    }

    /// Tears every subscription down (the empty-interest terminal state).
    pub async fn shutdown(&self) {
        let keys: Vec<K> = self.handles.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((key, handle)) = self.handles.remove(&key) {
                handle.close().await;
                self.metrics.record_unsubscribe();
                debug!(key = ?key, "unsubscribed on shutdown");
            }
        }
    }
}

/// The change-notification dispatcher: reconciles once per recomputed
/// interest set, then tears everything down when the stream ends or the
/// shutdown signal fires.
pub async fn drive<K, I>(
    reconciler: Arc<SetReconciler<K>>,
    mut interest: I,
    mut shutdown: oneshot::Receiver<()>,
) where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    I: Stream<Item = HashSet<K>> + Unpin,
{
    loop {
        tokio::select! {
            next = interest.next() => match next {
                Some(set) => {
                    reconciler.reconcile(&set).await;
                }
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }
    reconciler.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CallLog {
        opens: Mutex<HashMap<u32, usize>>,
        closes: Mutex<HashMap<u32, usize>>,
        failing: Mutex<HashSet<u32>>,
    }

    fn reconciler(log: &Arc<CallLog>) -> SetReconciler<u32> {
        let log = log.clone();
        SetReconciler::new(Arc::new(move |key: u32| {
            let log = log.clone();
            Box::pin(async move {
                if log.failing.lock().contains(&key) {
                    return Err(SyncError::provider("chain unavailable"));
                }
                *log.opens.lock().entry(key).or_insert(0) += 1;
                let closer = log.clone();
                Ok(SubscriptionHandle::new(CancelToken::new(), move || {
                    Box::pin(async move {
                        *closer.closes.lock().entry(key).or_insert(0) += 1;
                    })
                }))
            })
        }))
    }

    fn set(keys: impl IntoIterator<Item = u32>) -> HashSet<u32> {
        keys.into_iter().collect()
    }

    #[tokio::test]
    async fn converges_to_the_interest_set() {
        let log = Arc::new(CallLog::default());
        let reconciler = reconciler(&log);

        let outcome = reconciler.reconcile(&set([1, 2, 3])).await;
        assert_eq!(outcome.subscribed.len(), 3);
        assert_eq!(reconciler.active_keys(), set([1, 2, 3]));

        let outcome = reconciler.reconcile(&set([2, 3, 4])).await;
        assert_eq!(outcome.subscribed, vec![4]);
        assert_eq!(outcome.unsubscribed, vec![1]);
        assert_eq!(reconciler.active_keys(), set([2, 3, 4]));

        // Untouched keys were opened exactly once.
        assert_eq!(log.opens.lock()[&2], 1);
        assert_eq!(log.opens.lock()[&3], 1);
        assert_eq!(log.closes.lock()[&1], 1);
    }

    #[tokio::test]
    async fn unchanged_interest_is_a_noop() {
        let log = Arc::new(CallLog::default());
        let reconciler = reconciler(&log);

        reconciler.reconcile(&set([1, 2])).await;
        let outcome = reconciler.reconcile(&set([1, 2])).await;

        assert!(outcome.is_noop());
        assert_eq!(log.opens.lock()[&1], 1);
        assert_eq!(log.opens.lock()[&2], 1);
        assert!(log.closes.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_open_is_retried_on_the_next_pass() {
        let log = Arc::new(CallLog::default());
        let reconciler = reconciler(&log);
        log.failing.lock().insert(7);

        let outcome = reconciler.reconcile(&set([7])).await;
        assert_eq!(outcome.failed.len(), 1);
        assert!(!reconciler.is_active(&7));

        log.failing.lock().remove(&7);
        let outcome = reconciler.reconcile(&set([7])).await;
        assert_eq!(outcome.subscribed, vec![7]);
        assert!(reconciler.is_active(&7));
    }

    #[tokio::test]
    async fn empty_interest_reaches_the_terminal_state() {
        let log = Arc::new(CallLog::default());
        let reconciler = reconciler(&log);

        reconciler.reconcile(&set([1, 2])).await;
        reconciler.reconcile(&HashSet::new()).await;

        assert!(reconciler.is_empty());
        assert_eq!(log.closes.lock()[&1], 1);
        assert_eq!(log.closes.lock()[&2], 1);
    }

    #[tokio::test]
    async fn metrics_track_churn() {
        let log = Arc::new(CallLog::default());
        let metrics = Arc::new(EngineMetrics::new());
        let reconciler = reconciler(&log).with_metrics(metrics.clone());

        reconciler.reconcile(&set([1, 2])).await;
        reconciler.reconcile(&set([2])).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.subscribes, 2);
        assert_eq!(snapshot.unsubscribes, 1);
    }

    #[tokio::test]
    async fn drive_reconciles_each_recomputation_then_tears_down() {
        let log = Arc::new(CallLog::default());
        let reconciler = Arc::new(reconciler(&log));
        let (interest_tx, interest_rx) = tokio::sync::mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let driver = tokio::spawn(drive(
            reconciler.clone(),
            tokio_stream::wrappers::UnboundedReceiverStream::new(interest_rx),
            shutdown_rx,
        ));

        interest_tx.send(set([1])).unwrap();
        interest_tx.send(set([1, 2])).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(reconciler.active_keys(), set([1, 2]));

        shutdown_tx.send(()).unwrap();
        driver.await.unwrap();
        assert!(reconciler.is_empty());

        let counted: usize = log.closes.lock().values().sum();
        assert_eq!(counted, 2);
    }

    #[tokio::test]
    async fn dropping_an_unclosed_handle_cancels_its_token() {
        let token = CancelToken::new();
        let probe = token.clone();
        let flag = Arc::new(AtomicUsize::new(0));
        let closes = flag.clone();
        let handle = SubscriptionHandle::new(token, move || {
            closes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        });

        drop(handle);
        assert!(probe.is_cancelled());
        // The teardown callback itself only runs through close().
        assert_eq!(flag.load(Ordering::SeqCst), 0);
    }
}
