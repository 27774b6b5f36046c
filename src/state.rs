use crate::key::{AccountId, ChainId, WalletId};
use crate::observable::Observable;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One account of a wallet, with the chains it is usable on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub chains: Vec<ChainId>,
    /// True for multisig accounts; drives pending-operation discovery.
    pub multisig: bool,
}

impl Account {
    pub fn new(id: AccountId, chains: Vec<ChainId>) -> Self {
        Self {
            id,
            chains,
            multisig: false,
        }
    }

    pub fn multisig(mut self) -> Self {
        self.multisig = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub accounts: Vec<Account>,
}

/// The currently selected wallet, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletState {
    pub active: Option<Wallet>,
}

impl WalletState {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn active(wallet: Wallet) -> Self {
        Self {
            active: Some(wallet),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

/// Connection status per chain. Chains absent from the map count as
/// disconnected.
pub type ConnectionMap = HashMap<ChainId, ConnectionStatus>;

pub fn is_connected(connections: &ConnectionMap, chain: &ChainId) -> bool {
    connections.get(chain) == Some(&ConnectionStatus::Connected)
}

/// Recomputes an interest set from the reactive inputs on every change of
/// either input.
///
/// The returned stream yields an initial recomputation immediately (each
/// input's `watch` replays its current value), then one per subsequent
/// publish. Feeding it to [`crate::reconciler::drive`] makes the diff pass
/// run exactly when an input changes.
pub fn interest_stream<K, F>(
    wallet: &Observable<WalletState>,
    connections: &Observable<ConnectionMap>,
    compute: F,
) -> BoxStream<'static, HashSet<K>>
where
    K: Send + 'static,
    F: Fn(&WalletState, &ConnectionMap) -> HashSet<K> + Send + 'static,
{
    let mut changes = futures::stream::select(
        wallet.watch().map(|_| ()),
        connections.watch().map(|_| ()),
    );
    let wallet = wallet.clone();
    let connections = connections.clone();
    Box::pin(async_stream::stream! {
        while let Some(()) = changes.next().await {
            yield wallet.read(|w| connections.read(|c| compute(w, c)));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_chains_count_as_disconnected() {
        let mut connections = ConnectionMap::new();
        connections.insert(ChainId::new("c1"), ConnectionStatus::Connected);
        connections.insert(ChainId::new("c2"), ConnectionStatus::Connecting);

        assert!(is_connected(&connections, &ChainId::new("c1")));
        assert!(!is_connected(&connections, &ChainId::new("c2")));
        assert!(!is_connected(&connections, &ChainId::new("c3")));
    }

    #[tokio::test]
    async fn interest_stream_recomputes_on_either_input() {
        let wallet = Observable::new(WalletState::none());
        let connections = Observable::new(ConnectionMap::new());

        let mut interest = interest_stream(&wallet, &connections, |w, c| {
            let mut set = HashSet::new();
            if let Some(active) = &w.active {
                for account in &active.accounts {
                    for chain in &account.chains {
                        if is_connected(c, chain) {
                            set.insert((chain.clone(), account.id.clone()));
                        }
                    }
                }
            }
            set
        });

        // Two initial recomputations, one per input replaying its current value.
        assert_eq!(interest.next().await, Some(HashSet::new()));
        assert_eq!(interest.next().await, Some(HashSet::new()));

        wallet.set(WalletState::active(Wallet {
            id: WalletId(1),
            accounts: vec![Account::new(
                AccountId::new("alice"),
                vec![ChainId::new("c1")],
            )],
        }));
        // Wallet switched but the chain is not connected yet.
        assert_eq!(interest.next().await, Some(HashSet::new()));

        connections.update(|c| {
            let mut next = c.clone();
            next.insert(ChainId::new("c1"), ConnectionStatus::Connected);
            next
        });
        let expected: HashSet<_> = [(ChainId::new("c1"), AccountId::new("alice"))].into();
        assert_eq!(interest.next().await, Some(expected));
    }
}
