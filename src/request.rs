use crate::error::SyncError;
use crate::observable::Observable;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One-shot fetch against a remote resource provider.
pub type FetchFn<P, R> =
    Arc<dyn Fn(P) -> BoxFuture<'static, Result<R, SyncError>> + Send + Sync>;

/// Folds one fetched/delivered result into the store, producing the next
/// store value. Typically built from [`crate::merge::merge`]. Must not fail:
/// a panic here is a programming error, not a recoverable condition.
pub type MapFn<P, R, S> = Arc<dyn Fn(&S, &P, R) -> S + Send + Sync>;

/// Wraps an asynchronous fetch and guarantees its result is folded into the
/// target store exactly once per completed call.
///
/// `pending` is derived from the in-flight call count; `fulfilled` becomes
/// true once the first completed fetch has landed and never reverts.
/// Concurrent calls with identical params are not deduplicated: every call
/// performs a real fetch (always-fresh-read semantics), and overlapping
/// completions merge through `map` rather than overwrite.
pub struct RequestCache<P, R, S> {
    store: Observable<S>,
    pending: Observable<bool>,
    fulfilled: Observable<bool>,
    in_flight: Arc<AtomicUsize>,
    fetch: FetchFn<P, R>,
    map: MapFn<P, R, S>,
}

impl<P, R, S> Clone for RequestCache<P, R, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            pending: self.pending.clone(),
            fulfilled: self.fulfilled.clone(),
            in_flight: self.in_flight.clone(),
            fetch: self.fetch.clone(),
            map: self.map.clone(),
        }
    }
}

impl<P, R, S> RequestCache<P, R, S>
where
    P: Clone + Send + Sync + 'static,
    R: Send + 'static,
    S: Clone + Send + Sync + 'static,
{
    pub fn new(initial: S, fetch: FetchFn<P, R>, map: MapFn<P, R, S>) -> Self {
        Self::with_store(Observable::new(initial), fetch, map)
    }

    /// Builds a cache writing into an existing store, shared with other
    /// pipelines feeding the same collection.
    pub fn with_store(store: Observable<S>, fetch: FetchFn<P, R>, map: MapFn<P, R, S>) -> Self {
        Self {
            store,
            pending: Observable::new(false),
            fulfilled: Observable::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            fetch,
            map,
        }
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

    /// Wholesale replacement of the store value. The only mutation path
    /// outside the merge pipeline.
    pub fn reset(&self, value: S) {
        self.store.set(value);
    }

    /// Performs the fetch and folds the result into the store.
    ///
    /// On failure the store is left unchanged and the error propagates to
    /// the caller; the core does not retry.
    pub async fn request(&self, params: P) -> Result<(), SyncError> {
        self.begin();
        let result = (self.fetch)(params.clone()).await;
        match result {
            Ok(result) => {
                self.store.update(|s| (self.map)(s, &params, result));
                self.finish();
                if !self.fulfilled.get() {
                    self.fulfilled.set(true);
                }
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, "fetch failed, store unchanged");
                self.finish();
                Err(err)
            }
        }
    }

    fn begin(&self) {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            self.pending.set(true);
        }
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.pending.set(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge_replace;
    use parking_lot::Mutex;

    fn counting_fetch(
        results: Vec<Result<Vec<u32>, SyncError>>,
    ) -> (FetchFn<&'static str, Vec<u32>>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(Mutex::new(results));
        let counter = calls.clone();
        let fetch: FetchFn<&'static str, Vec<u32>> = Arc::new(move |_params| {
            counter.fetch_add(1, Ordering::SeqCst);
            let next = queue.lock().remove(0);
            Box::pin(async move { next })
        });
        (fetch, calls)
    }

    fn merging_map() -> MapFn<&'static str, Vec<u32>, Vec<u32>> {
        Arc::new(|store, _params, result| merge_replace(store.clone(), result, |v| *v))
    }

    #[tokio::test]
    async fn success_merges_and_sets_flags() {
        let (fetch, _) = counting_fetch(vec![Ok(vec![1, 2])]);
        let cache = RequestCache::new(Vec::new(), fetch, merging_map());

        assert!(!cache.pending().get());
        cache.request("params").await.unwrap();

        assert_eq!(cache.store().get(), vec![1, 2]);
        assert!(!cache.pending().get());
        assert!(cache.fulfilled().get());
    }

    #[tokio::test]
    async fn failure_leaves_store_untouched_and_fulfilled_unchanged() {
        let (fetch, _) = counting_fetch(vec![
            Ok(vec![1]),
            Err(SyncError::provider("feed unavailable")),
        ]);
        let cache = RequestCache::new(Vec::new(), fetch, merging_map());

        cache.request("a").await.unwrap();
        let err = cache.request("b").await.unwrap_err();
        assert!(matches!(err, SyncError::Provider(_)));

        assert_eq!(cache.store().get(), vec![1]);
        assert!(!cache.pending().get());
        // Monotonic: an error after a success does not clear fulfilled.
        assert!(cache.fulfilled().get());
    }

    #[tokio::test]
    async fn identical_params_are_not_deduplicated() {
        let (fetch, calls) = counting_fetch(vec![Ok(vec![1]), Ok(vec![1, 2])]);
        let cache = RequestCache::new(Vec::new(), fetch, merging_map());

        cache.request("same").await.unwrap();
        cache.request("same").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.store().get(), vec![1, 2]);
    }

    #[tokio::test]
    async fn overlapping_completions_merge_rather_than_overwrite() {
        let store = Observable::new(Vec::new());
        let fetch: FetchFn<Vec<u32>, Vec<u32>> =
            Arc::new(|params| Box::pin(async move { Ok(params) }));
        let map: MapFn<Vec<u32>, Vec<u32>, Vec<u32>> =
            Arc::new(|store, _params, result| merge_replace(store.clone(), result, |v| *v));
        let cache = RequestCache::with_store(store, fetch, map);

        let (a, b) = tokio::join!(cache.request(vec![1, 2]), cache.request(vec![2, 3]));
        a.unwrap();
        b.unwrap();

        let mut merged = cache.store().get();
        merged.sort_unstable();
        assert_eq!(merged, vec![1, 2, 3]);
        assert!(!cache.pending().get());
    }
}
