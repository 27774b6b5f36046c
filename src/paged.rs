use crate::cancel::CancelToken;
use crate::error::SyncError;
use crate::subscription::{OnResult, SubscribeFn, Unsubscribe};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Opaque continuation token of a paged enumeration.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageToken(pub String);

#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}

impl<T> Page<T> {
    /// A terminal page with no continuation.
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

/// Paged enumeration function of a remote resource provider.
pub type PageFetchFn<P, T> = Arc<
    dyn Fn(P, Option<PageToken>) -> BoxFuture<'static, Result<Page<T>, SyncError>> + Send + Sync,
>;

/// Per-params factory for the event stream that triggers a fresh
/// re-enumeration (e.g. relevant chain events).
pub type TriggerFn<P, E> = Arc<dyn Fn(P) -> BoxStream<'static, E> + Send + Sync>;

/// Repeatedly fetches pages until exhaustion, mapping each page and feeding
/// it to `on_page`.
///
/// The token is checked before each request and again when the response
/// arrives: a cancelled pass fetches no further pages and silently discards
/// the page that was in flight.
pub async fn fetch_pages<P, T, U, M, C>(
    fetch_page: &PageFetchFn<P, T>,
    params: &P,
    map_page: &M,
    token: &CancelToken,
    on_page: &C,
) -> Result<(), SyncError>
where
    P: Clone,
    M: Fn(Vec<T>) -> Vec<U> + ?Sized,
    C: Fn(Vec<U>) + ?Sized,
{
    let mut cursor: Option<PageToken> = None;
    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        let page = fetch_page(params.clone(), cursor).await?;
        if token.is_cancelled() {
            debug!("discarding in-flight page after cancellation");
            return Ok(());
        }
        cursor = page.next.clone();
        on_page(map_page(page.items));
        if cursor.is_none() {
            return Ok(());
        }
    }
}

enum PassOutcome {
    Done,
    Restart,
    Stop,
}

/// Builds a push-subscription function out of a paged enumeration and a
/// trigger event stream: a full enumeration runs on subscribe, then again on
/// every trigger event, with cancel-and-restart semantics (a trigger arriving
/// mid-enumeration discards the pages still in flight and starts over).
///
/// The subscription is established immediately; each completed page is one
/// delivery. A trigger stream that ends stops the re-enumeration loop after
/// the current pass; a stream that never yields (`stream::pending`) keeps
/// the initial enumeration as the only pass while the subscription stays
/// open.
pub fn paged_subscription<P, T, U, E>(
    fetch_page: PageFetchFn<P, T>,
    map_page: Arc<dyn Fn(Vec<T>) -> Vec<U> + Send + Sync>,
    triggers: TriggerFn<P, E>,
) -> SubscribeFn<P, Vec<U>>
where
    P: Clone + Send + Sync + 'static,
    T: Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
{
    Arc::new(move |params: P, on_result: OnResult<Vec<U>>| {
        let fetch_page = fetch_page.clone();
        let map_page = map_page.clone();
        let triggers = triggers.clone();
        Box::pin(async move {
            let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
            let mut events = triggers(params.clone());

            let worker = tokio::spawn(async move {
                let mut events_done = false;
                'outer: loop {
                    let pass_token = CancelToken::new();
                    let pass = fetch_pages(
                        &fetch_page,
                        &params,
                        map_page.as_ref(),
                        &pass_token,
                        on_result.as_ref(),
                    );
                    tokio::pin!(pass);

                    let outcome = loop {
                        tokio::select! {
                            result = &mut pass => {
                                if let Err(err) = result {
                                    warn!(error = %err, "page enumeration failed");
                                }
                                break PassOutcome::Done;
                            }
                            event = events.next(), if !events_done => match event {
                                Some(_) => {
                                    pass_token.cancel();
                                    break PassOutcome::Restart;
                                }
                                // Event feed closed: finish the running pass,
                                // then stop re-enumerating.
                                None => events_done = true,
                            },
                            _ = &mut shutdown_rx => {
                                pass_token.cancel();
                                break PassOutcome::Stop;
                            }
                        }
                    };

                    match outcome {
                        PassOutcome::Restart => continue 'outer,
                        PassOutcome::Stop => break 'outer,
                        PassOutcome::Done => {
                            if events_done {
                                break 'outer;
                            }
                            tokio::select! {
                                event = events.next() => match event {
                                    Some(_) => continue 'outer,
                                    None => break 'outer,
                                },
                                _ = &mut shutdown_rx => break 'outer,
                            }
                        }
                    }
                }
                debug!("paged subscription loop stopped");
            });

            let unsubscribe: Unsubscribe = Box::new(move || {
                Box::pin(async move {
                    let _ = shutdown_tx.send(());
                    let _ = worker.await;
                })
            });
            Ok(unsubscribe)
        })
    })
}
