use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use crate::error::SyncError;
use crate::metrics::EngineMetrics;
use crate::observable::Observable;
use crate::request::MapFn;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// Delivery callback handed to the provider's subscribe function. Invoked
/// once per incremental result for as long as the subscription lives.
pub type OnResult<R> = Arc<dyn Fn(R) + Send + Sync>;

/// Tears the provider-side subscription down. Returned by the provider once
/// the subscription is established.
pub type Unsubscribe = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Push-subscription function of a remote resource provider.
pub type SubscribeFn<P, R> = Arc<
    dyn Fn(P, OnResult<R>) -> BoxFuture<'static, Result<Unsubscribe, SyncError>> + Send + Sync,
>;

struct ActiveSub {
    token: CancelToken,
    unsubscribe: Option<Unsubscribe>,
}

/// Long-lived push subscription delivering an unbounded sequence of
/// incremental results into a store.
///
/// At most one subscription is live per instance: re-subscribing first
/// cancels the previous one. Callers needing concurrent subscriptions (one
/// per resource key) instantiate one `LiveSubscription` per key, which is
/// exactly what the set reconciler does.
///
/// `pending` flips to false after the first delivery; `fulfilled` becomes
/// permanently true at the same point. A delivery arriving after
/// cancellation is dropped before it can touch the store.
pub struct LiveSubscription<P, R, S> {
    id: Uuid,
    store: Observable<S>,
    pending: Observable<bool>,
    fulfilled: Observable<bool>,
    subscribe_fn: SubscribeFn<P, R>,
    map: MapFn<P, R, S>,
    active: Mutex<Option<ActiveSub>>,
    retry: RetryPolicy,
    metrics: Option<(Arc<EngineMetrics>, String)>,
}

impl<P, R, S> LiveSubscription<P, R, S>
where
    P: Clone + Send + Sync + 'static,
    R: Send + 'static,
    S: Clone + Send + Sync + 'static,
{
    pub fn new(initial: S, subscribe_fn: SubscribeFn<P, R>, map: MapFn<P, R, S>) -> Self {
        Self::with_store(Observable::new(initial), subscribe_fn, map)
    }

    /// Builds a subscription writing into an existing store, shared with
    /// the other per-key subscriptions feeding the same collection.
    pub fn with_store(
        store: Observable<S>,
        subscribe_fn: SubscribeFn<P, R>,
        map: MapFn<P, R, S>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            pending: Observable::new(false),
            fulfilled: Observable::new(false),
            subscribe_fn,
            map,
            active: Mutex::new(None),
            retry: RetryPolicy::disabled(),
            metrics: None,
        }
    }

    /// Sets the establishment retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Records deliveries into `metrics` under `label`.
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>, label: impl Into<String>) -> Self {
        self.metrics = Some((metrics, label.into()));
        self
    }

    pub fn store(&self) -> &Observable<S> {
        &self.store
    }

    pub fn pending(&self) -> &Observable<bool> {
        &self.pending
    }

    pub fn fulfilled(&self) -> &Observable<bool> {
        &self.fulfilled
    }

    /// Clone of the live subscription's cancellation token, if one is active.
    pub fn token(&self) -> Option<CancelToken> {
        self.active.lock().as_ref().map(|sub| sub.token.clone())
    }

    /// Establishes the subscription, cancelling any previous one first.
    ///
    /// Returns once the provider has acknowledged the subscription;
    /// deliveries arrive through the callback afterwards. On establishment
    /// failure the store is unchanged, `pending` is cleared and the error
    /// propagates; the caller decides when to retry (normally the next
    /// reconciliation pass; see [`RetryPolicy`] for the opt-in bounded
    /// in-place retry).
    pub async fn subscribe(&self, params: P) -> Result<(), SyncError> {
        self.unsubscribe().await;

        let token = CancelToken::new();
        self.install(ActiveSub {
            token: token.clone(),
            unsubscribe: None,
        });
        self.pending.set(true);

        let callback = self.delivery_callback(token.clone(), params.clone());
        let max_attempts = self.retry.effective_attempts();
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                // Superseded while establishing or between attempts.
                return Ok(());
            }
            match (self.subscribe_fn)(params.clone(), callback.clone()).await {
                Ok(unsubscribe) => {
                    let stale = {
                        let mut active = self.active.lock();
                        match active.as_mut() {
                            Some(sub) if sub.token.same(&token) => {
                                sub.unsubscribe = Some(unsubscribe);
                                None
                            }
                            _ => Some(unsubscribe),
                        }
                    };
                    if let Some(unsubscribe) = stale {
                        debug!(subscription = %self.id, "superseded during establishment");
                        unsubscribe().await;
                    }
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > max_attempts {
                        self.clear_if_current(&token);
                        let err = if max_attempts > 0 {
                            SyncError::RetriesExhausted {
                                attempts: attempt,
                                last: Box::new(err),
                            }
                        } else {
                            err
                        };
                        return Err(err);
                    }
                    warn!(
                        subscription = %self.id,
                        error = %err,
                        attempt,
                        max_attempts,
                        "establishment failed, retrying"
                    );
                    sleep(self.retry.delay()).await;
                }
            }
        }
    }

    /// Cancels the live subscription and awaits the provider-side teardown.
    /// Idempotent: a no-op when nothing is subscribed. After completion no
    /// further delivery can affect the store.
    pub async fn unsubscribe(&self) {
        let previous = self.active.lock().take();
        if let Some(sub) = previous {
            sub.token.cancel();
            self.pending.set(false);
            if let Some(unsubscribe) = sub.unsubscribe {
                unsubscribe().await;
            }
            debug!(subscription = %self.id, "unsubscribed");
        }
    }

    fn install(&self, next: ActiveSub) {
        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            // A concurrent subscribe slipped in between our unsubscribe and
            // install. Cancel it; its own establishment path tears it down.
            previous.token.cancel();
            if let Some(unsubscribe) = previous.unsubscribe {
                tokio::spawn(unsubscribe());
            }
        }
        *active = Some(next);
    }

    fn clear_if_current(&self, token: &CancelToken) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|sub| sub.token.same(token)) {
            *active = None;
            drop(active);
            self.pending.set(false);
        }
    }

    fn delivery_callback(&self, token: CancelToken, params: P) -> OnResult<R> {
        let store = self.store.clone();
        let pending = self.pending.clone();
        let fulfilled = self.fulfilled.clone();
        let map = self.map.clone();
        let metrics = self.metrics.clone();
        let id = self.id;
        Arc::new(move |result: R| {
            if token.is_cancelled() {
                debug!(subscription = %id, "dropping delivery after cancellation");
                return;
            }
            store.update(|s| map(s, &params, result));
            if pending.get() {
                pending.set(false);
            }
            if !fulfilled.get() {
                fulfilled.set(true);
            }
            if let Some((metrics, label)) = &metrics {
                metrics.record_delivery(label);
            }
        })
    }
}
