use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::key::{AccountResource, ChainId};
use crate::merge::merge;
use crate::metrics::EngineMetrics;
use crate::observable::Observable;
use crate::paged::{paged_subscription, PageFetchFn, TriggerFn};
use crate::reconciler::{drive, OpenFn, ReconcileOutcome, SetReconciler, SubscriptionHandle};
use crate::request::{FetchFn, MapFn, RequestCache};
use crate::state::{interest_stream, is_connected, ConnectionMap, WalletState};
use crate::subscription::LiveSubscription;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferendumStatus {
    Deciding,
    Confirming,
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub ayes: u128,
    pub nays: u128,
    pub support: u128,
}

/// One referendum on one chain. Deduplicated by index within its chain's
/// collection; a re-enumerated referendum replaces the previous revision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referendum {
    pub chain: ChainId,
    pub index: u32,
    pub track: u16,
    pub status: ReferendumStatus,
    pub proposal_hash: Option<String>,
    pub submitted_in: u64,
    pub tally: Tally,
}

/// Referenda per chain, each collection sorted by index.
pub type ReferendaStore = HashMap<ChainId, Vec<Referendum>>;

/// One account's vote on one referendum.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountVote {
    pub chain: ChainId,
    pub account: crate::key::AccountId,
    pub referendum: u32,
    pub aye: bool,
    pub balance: u128,
    pub conviction: u8,
}

/// Votes per tracked account resource.
pub type VoteStore = HashMap<AccountResource, Vec<AccountVote>>;

pub fn merge_referenda(
    store: &ReferendaStore,
    chain: &ChainId,
    incoming: Vec<Referendum>,
) -> ReferendaStore {
    let mut next = store.clone();
    let existing = next.remove(chain).unwrap_or_default();
    let merged = merge(
        existing,
        incoming,
        |referendum: &Referendum| referendum.index,
        None,
        Some(&|a: &Referendum, b: &Referendum| a.index.cmp(&b.index)),
    );
    next.insert(chain.clone(), merged);
    next
}

pub fn merge_votes(
    store: &VoteStore,
    key: &AccountResource,
    incoming: Vec<AccountVote>,
) -> VoteStore {
    let mut next = store.clone();
    let existing = next.remove(key).unwrap_or_default();
    let merged = merge(
        existing,
        incoming,
        |vote: &AccountVote| vote.referendum,
        None,
        Some(&|a: &AccountVote, b: &AccountVote| a.referendum.cmp(&b.referendum)),
    );
    next.insert(key.clone(), merged);
    next
}

/// Referenda are chain-global: every connected chain is of interest.
pub fn referenda_interest(connections: &ConnectionMap) -> HashSet<ChainId> {
    connections
        .iter()
        .filter(|(chain, _)| is_connected(connections, chain))
        .map(|(chain, _)| chain.clone())
        .collect()
}

/// Governance data sources for one deployment: a paged referendum
/// enumeration, a stream of chain events that invalidate it (each event
/// triggers a full re-enumeration), and a one-shot vote read.
pub struct GovernanceProvider {
    pub referenda_pages: PageFetchFn<ChainId, Referendum>,
    pub referenda_events: TriggerFn<ChainId, ()>,
    pub votes: FetchFn<AccountResource, Vec<AccountVote>>,
}

/// Tracks referenda per connected chain through paged re-enumeration, and
/// account votes through explicit one-shot requests.
pub struct GovernanceTracker {
    referenda: Observable<ReferendaStore>,
    referenda_fulfilled: Observable<bool>,
    votes: RequestCache<AccountResource, Vec<AccountVote>, VoteStore>,
    reconciler: Arc<SetReconciler<ChainId>>,
}

impl GovernanceTracker {
    pub fn new(provider: GovernanceProvider, config: SyncConfig, metrics: Arc<EngineMetrics>) -> Self {
        let referenda: Observable<ReferendaStore> = Observable::new(HashMap::new());
        let referenda_fulfilled = Observable::new(false);
        {
            let fulfilled = referenda_fulfilled.clone();
            referenda.observe(move |_| {
                if !fulfilled.get() {
                    fulfilled.set(true);
                }
            });
        }

        let subscribe_fn = paged_subscription(
            provider.referenda_pages,
            Arc::new(|items: Vec<Referendum>| items),
            provider.referenda_events,
        );
        let map: MapFn<ChainId, Vec<Referendum>, ReferendaStore> =
            Arc::new(|store, chain, incoming| merge_referenda(store, chain, incoming));

        let open: OpenFn<ChainId> = {
            let referenda = referenda.clone();
            let metrics = metrics.clone();
            let retry = config.retry;
            Arc::new(move |chain: ChainId| {
                let referenda = referenda.clone();
                let subscribe_fn = subscribe_fn.clone();
                let map = map.clone();
                let metrics = metrics.clone();
                let retry = retry.clone();
                Box::pin(async move {
                    let subscription =
                        LiveSubscription::with_store(referenda, subscribe_fn, map)
                            .with_retry(retry)
                            .with_metrics(metrics, chain.to_string());
                    subscription.subscribe(chain).await?;
                    Ok(SubscriptionHandle::from_subscription(subscription))
                })
            })
        };

        let votes = RequestCache::with_store(
            Observable::new(HashMap::new()),
            provider.votes,
            Arc::new(|store, key, incoming| merge_votes(store, key, incoming)),
        );

        let reconciler = Arc::new(SetReconciler::new(open).with_metrics(metrics));

        Self {
            referenda,
            referenda_fulfilled,
            votes,
            reconciler,
        }
    }

    pub fn referenda(&self) -> &Observable<ReferendaStore> {
        &self.referenda
    }

    pub fn referenda_fulfilled(&self) -> &Observable<bool> {
        &self.referenda_fulfilled
    }

    pub fn votes(&self) -> &RequestCache<AccountResource, Vec<AccountVote>, VoteStore> {
        &self.votes
    }

    pub fn reconciler(&self) -> &Arc<SetReconciler<ChainId>> {
        &self.reconciler
    }

    /// One-shot read of an account's votes, merged into the vote store.
    pub async fn fetch_votes(&self, key: AccountResource) -> Result<(), SyncError> {
        self.votes.request(key).await
    }

    pub async fn refresh(&self, connections: &ConnectionMap) -> ReconcileOutcome<ChainId> {
        self.reconciler
            .reconcile(&referenda_interest(connections))
            .await
    }

    /// Follows the connection map until shutdown. The wallet input is part
    /// of the shared dispatcher signature but does not narrow chain-global
    /// referenda.
    pub async fn run(
        &self,
        wallet: &Observable<WalletState>,
        connections: &Observable<ConnectionMap>,
        shutdown: oneshot::Receiver<()>,
    ) {
        let interest = interest_stream(wallet, connections, |_, connections| {
            referenda_interest(connections)
        });
        drive(self.reconciler.clone(), interest, shutdown).await;
    }
}
