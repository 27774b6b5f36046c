use crate::config::SyncConfig;
use crate::key::{AccountId, AccountResource, ChainId};
use crate::merge::merge_combined;
use crate::metrics::EngineMetrics;
use crate::observable::Observable;
use crate::reconciler::{drive, OpenFn, ReconcileOutcome, SetReconciler, SubscriptionHandle};
use crate::request::MapFn;
use crate::state::{interest_stream, is_connected, ConnectionMap, WalletState};
use crate::subscription::{LiveSubscription, SubscribeFn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Block height plus extrinsic index: the on-chain coordinate that, together
/// with the call hash, pins down one multisig operation.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timepoint {
    pub height: u64,
    pub index: u32,
}

impl Timepoint {
    pub fn new(height: u64, index: u32) -> Self {
        Self { height, index }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Executed,
    Rejected,
}

/// One signatory's approval of a multisig operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub account: AccountId,
    pub at: Timepoint,
}

/// One multisig operation under revision: the identity is
/// (chain, multisig account, call hash, timepoint), while the event list and
/// status mutate as approvals land.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigOperation {
    pub chain: ChainId,
    pub account: AccountId,
    pub call_hash: String,
    pub timepoint: Timepoint,
    /// Opaque encoded call, once discovered. Decoding is out of scope.
    pub call: Option<Vec<u8>>,
    pub status: OperationStatus,
    /// Approvals in arrival order, unique per signatory.
    pub events: Vec<ApprovalEvent>,
    pub discovered_at: DateTime<Utc>,
}

pub type OperationKey = (ChainId, AccountId, String, Timepoint);

impl MultisigOperation {
    pub fn merge_key(&self) -> OperationKey {
        (
            self.chain.clone(),
            self.account.clone(),
            self.call_hash.clone(),
            self.timepoint,
        )
    }

    /// Folds a re-delivered revision of the same operation into this one:
    /// approval events are unioned in arrival order (unique per signatory),
    /// the incoming status wins, and the call payload is kept from whichever
    /// revision has it.
    pub fn absorb(mut self, incoming: MultisigOperation) -> MultisigOperation {
        for event in incoming.events {
            if !self.events.iter().any(|e| e.account == event.account) {
                self.events.push(event);
            }
        }
        self.status = incoming.status;
        self.call = incoming.call.or(self.call);
        self
    }
}

/// All discovered operations, across every tracked multisig account.
pub type MultisigStore = Vec<MultisigOperation>;

/// Folds one delivery into the store, deduplicating by operation identity.
pub fn merge_operations(
    store: &MultisigStore,
    incoming: Vec<MultisigOperation>,
) -> MultisigStore {
    merge_combined(
        store.clone(),
        incoming,
        MultisigOperation::merge_key,
        &|existing, incoming| existing.absorb(incoming),
    )
}

/// Multisig accounts of the active wallet on their connected chains.
pub fn multisig_interest(
    wallet: &WalletState,
    connections: &ConnectionMap,
) -> HashSet<AccountResource> {
    let mut interest = HashSet::new();
    let Some(active) = &wallet.active else {
        return interest;
    };
    for account in active.accounts.iter().filter(|a| a.multisig) {
        for chain in &account.chains {
            if is_connected(connections, chain) {
                interest.insert(AccountResource::new(chain.clone(), account.id.clone()));
            }
        }
    }
    interest
}

/// Discovers pending multisig operations for every tracked multisig
/// account, one live subscription per account resource.
pub struct MultisigTracker {
    store: Observable<MultisigStore>,
    fulfilled: Observable<bool>,
    reconciler: Arc<SetReconciler<AccountResource>>,
}

impl MultisigTracker {
    pub fn new(
        provider: SubscribeFn<AccountResource, Vec<MultisigOperation>>,
        config: SyncConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let store: Observable<MultisigStore> = Observable::new(Vec::new());
        let fulfilled = Observable::new(false);
        {
            let fulfilled = fulfilled.clone();
            store.observe(move |_| {
                if !fulfilled.get() {
                    fulfilled.set(true);
                }
            });
        }

        let map: MapFn<AccountResource, Vec<MultisigOperation>, MultisigStore> =
            Arc::new(|store, _key, incoming| merge_operations(store, incoming));

        let open: OpenFn<AccountResource> = {
            let store = store.clone();
            let metrics = metrics.clone();
            let retry = config.retry;
            Arc::new(move |key: AccountResource| {
                let store = store.clone();
                let provider = provider.clone();
                let map = map.clone();
                let metrics = metrics.clone();
                let retry = retry.clone();
                Box::pin(async move {
                    let subscription = LiveSubscription::with_store(store, provider, map)
                        .with_retry(retry)
                        .with_metrics(metrics, key.to_string());
                    subscription.subscribe(key).await?;
                    Ok(SubscriptionHandle::from_subscription(subscription))
                })
            })
        };

        let reconciler = Arc::new(SetReconciler::new(open).with_metrics(metrics));

        Self {
            store,
            fulfilled,
            reconciler,
        }
    }

    pub fn store(&self) -> &Observable<MultisigStore> {
        &self.store
    }

    pub fn fulfilled(&self) -> &Observable<bool> {
        &self.fulfilled
    }

    pub fn reconciler(&self) -> &Arc<SetReconciler<AccountResource>> {
        &self.reconciler
    }

    pub async fn refresh(
        &self,
        wallet: &WalletState,
        connections: &ConnectionMap,
    ) -> ReconcileOutcome<AccountResource> {
        self.reconciler
            .reconcile(&multisig_interest(wallet, connections))
            .await
    }

    pub async fn run(
        &self,
        wallet: &Observable<WalletState>,
        connections: &Observable<ConnectionMap>,
        shutdown: oneshot::Receiver<()>,
    ) {
        let interest = interest_stream(wallet, connections, multisig_interest);
        drive(self.reconciler.clone(), interest, shutdown).await;
    }
}
