pub mod balances;
pub mod cancel;
pub mod config;
pub mod error;
pub mod governance;
pub mod key;
pub mod merge;
pub mod metrics;
pub mod multisig;
pub mod observable;
pub mod paged;
pub mod reconciler;
pub mod request;
pub mod state;
pub mod subscription;

pub use cancel::CancelToken;
pub use config::{RetryPolicy, SyncConfig};
pub use error::{BoxedError, SyncError};
pub use key::{AccountId, AccountResource, ChainId, WalletId, WalletResource};
pub use merge::{merge, merge_combined, merge_replace};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use observable::{ListenerId, Observable};
pub use paged::{fetch_pages, paged_subscription, Page, PageFetchFn, PageToken, TriggerFn};
pub use reconciler::{drive, OpenFn, ReconcileOutcome, SetReconciler, SubscriptionHandle};
pub use request::{FetchFn, MapFn, RequestCache};
pub use state::{
    interest_stream, is_connected, Account, ConnectionMap, ConnectionStatus, Wallet, WalletState,
};
pub use subscription::{LiveSubscription, OnResult, SubscribeFn, Unsubscribe};
