use crate::config::SyncConfig;
use crate::key::AccountResource;
use crate::merge::merge;
use crate::metrics::EngineMetrics;
use crate::observable::Observable;
use crate::reconciler::{drive, OpenFn, ReconcileOutcome, SetReconciler, SubscriptionHandle};
use crate::request::MapFn;
use crate::state::{interest_stream, is_connected, ConnectionMap, WalletState};
use crate::subscription::{LiveSubscription, SubscribeFn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;

/// One asset's balance for one account on one chain. Deduplicated by asset
/// id within its account's collection; a re-delivered asset updates in
/// place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: u128,
    pub reserved: u128,
    pub frozen: u128,
    pub updated_at: DateTime<Utc>,
}

impl AssetBalance {
    pub fn total(&self) -> u128 {
        self.free.saturating_add(self.reserved)
    }

    pub fn transferable(&self) -> u128 {
        self.free.saturating_sub(self.frozen)
    }
}

/// Asset balances per tracked account resource.
pub type BalanceStore = HashMap<AccountResource, Vec<AssetBalance>>;

/// Folds one balance delivery into the store: merged by asset id, sorted by
/// asset id for a stable presentation order.
pub fn merge_balances(
    store: &BalanceStore,
    key: &AccountResource,
    incoming: Vec<AssetBalance>,
) -> BalanceStore {
    let mut next = store.clone();
    let existing = next.remove(key).unwrap_or_default();
    let merged = merge(
        existing,
        incoming,
        |balance: &AssetBalance| balance.asset.clone(),
        None,
        Some(&|a: &AssetBalance, b: &AssetBalance| a.asset.cmp(&b.asset)),
    );
    next.insert(key.clone(), merged);
    next
}

/// Every account of the active wallet, on every connected chain it lives on.
pub fn balance_interest(
    wallet: &WalletState,
    connections: &ConnectionMap,
) -> HashSet<AccountResource> {
    let mut interest = HashSet::new();
    let Some(active) = &wallet.active else {
        return interest;
    };
    for account in &active.accounts {
        for chain in &account.chains {
            if is_connected(connections, chain) {
                interest.insert(AccountResource::new(chain.clone(), account.id.clone()));
            }
        }
    }
    interest
}

/// Keeps one balance subscription live per account resource in the interest
/// set, all feeding one shared store.
pub struct BalanceTracker {
    store: Observable<BalanceStore>,
    fulfilled: Observable<bool>,
    reconciler: Arc<SetReconciler<AccountResource>>,
}

impl BalanceTracker {
    pub fn new(
        provider: SubscribeFn<AccountResource, Vec<AssetBalance>>,
        config: SyncConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let store: Observable<BalanceStore> = Observable::new(HashMap::new());
        let fulfilled = Observable::new(false);
        {
            let fulfilled = fulfilled.clone();
            store.observe(move |_| {
                if !fulfilled.get() {
                    fulfilled.set(true);
                }
            });
        }

        let map: MapFn<AccountResource, Vec<AssetBalance>, BalanceStore> =
            Arc::new(|store, key, incoming| merge_balances(store, key, incoming));

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

    pub fn store(&self) -> &Observable<BalanceStore> {
        &self.store
    }

    /// True once any account's first balance delivery has landed.
    pub fn fulfilled(&self) -> &Observable<bool> {
        &self.fulfilled
    }

    pub fn reconciler(&self) -> &Arc<SetReconciler<AccountResource>> {
        &self.reconciler
    }

    /// One explicit reconciliation pass against the current inputs.
    pub async fn refresh(
        &self,
        wallet: &WalletState,
        connections: &ConnectionMap,
    ) -> ReconcileOutcome<AccountResource> {
        self.reconciler
            .reconcile(&balance_interest(wallet, connections))
            .await
    }

    /// Follows the reactive inputs until shutdown, reconciling on every
    /// change; tears all subscriptions down on exit.
    pub async fn run(
        &self,
        wallet: &Observable<WalletState>,
        connections: &Observable<ConnectionMap>,
        shutdown: oneshot::Receiver<()>,
    ) {
        let interest = interest_stream(wallet, connections, balance_interest);
        drive(self.reconciler.clone(), interest, shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{AccountId, ChainId, WalletId};
    use crate::state::{Account, ConnectionStatus, Wallet};

    fn balance(asset: &str, free: u128) -> AssetBalance {
        AssetBalance {
            asset: asset.to_string(),
            free,
            reserved: 0,
            frozen: 0,
            updated_at: Utc::now(),
        }
    }

    fn resource(chain: &str, account: &str) -> AccountResource {
        AccountResource::new(ChainId::new(chain), AccountId::new(account))
    }

    #[test]
    fn balances_merge_by_asset_and_sort() {
        let key = resource("polkadot", "alice");
        let store = merge_balances(&HashMap::new(), &key, vec![balance("DOT", 10)]);
        let store = merge_balances(&store, &key, vec![balance("USDT", 5), balance("DOT", 12)]);

        let balances = &store[&key];
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[0].asset, "DOT");
        assert_eq!(balances[0].free, 12);
        assert_eq!(balances[1].asset, "USDT");
    }

    #[test]
    fn interest_covers_accounts_on_connected_chains_only() {
        let wallet = WalletState::active(Wallet {
            id: WalletId(1),
            accounts: vec![
                Account::new(AccountId::new("alice"), vec![ChainId::new("c1")]),
                Account::new(
                    AccountId::new("bob"),
                    vec![ChainId::new("c1"), ChainId::new("c2")],
                ),
            ],
        });
        let mut connections = ConnectionMap::new();
        connections.insert(ChainId::new("c1"), ConnectionStatus::Connected);
        connections.insert(ChainId::new("c2"), ConnectionStatus::Disconnected);

        let interest = balance_interest(&wallet, &connections);
        let expected: HashSet<_> = [resource("c1", "alice"), resource("c1", "bob")].into();
        assert_eq!(interest, expected);
    }

    #[test]
    fn no_active_wallet_means_empty_interest() {
        let interest = balance_interest(&WalletState::none(), &ConnectionMap::new());
        assert!(interest.is_empty());
    }

    #[test]
    fn totals_saturate() {
        let mut b = balance("DOT", u128::MAX);
        b.reserved = 10;
        b.frozen = 1;
        assert_eq!(b.total(), u128::MAX);
        assert_eq!(b.transferable(), u128::MAX - 1);
    }
}
