use crate::domain::ids::{SessionRef, UserId};
use crate::domain::ledger::CreditTransaction;
use crate::domain::ports::LedgerStoreRef;
use crate::error::Result;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::trace;

struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

/// Inserts a fresh entry and drops every entry that has outlived the staleness window,
/// so the cache only holds users read within the last window.
fn remember<T>(cache: &mut HashMap<UserId, Cached<T>>, user_id: &UserId, value: T, staleness: Duration) {
    cache.retain(|_, cached| cached.fetched_at.elapsed() < staleness);
    cache.insert(
        user_id.clone(),
        Cached {
            value,
            fetched_at: Instant::now(),
        },
    );
}

/// Balance and history reads over the ledger store.
///
/// Cached reads are never older than the staleness window. The `fresh_*` and
/// by-reference reads always hit the store; the reconciliation loop relies on that.
pub struct TransactionLedgerClient {
    store: LedgerStoreRef,
    staleness: Duration,
    balances: RwLock<HashMap<UserId, Cached<i64>>>,
    histories: RwLock<HashMap<UserId, Cached<Vec<CreditTransaction>>>>,
}

impl TransactionLedgerClient {
    /// Creates a client over `store`.
    ///
    /// # Arguments
    ///
    /// * `store` - The ledger store port.
    /// * `staleness` - Maximum age of a cached balance or history before it is re-read.
    pub fn new(store: LedgerStoreRef, staleness: Duration) -> Self {
        Self {
            store,
            staleness,
            balances: RwLock::new(HashMap::new()),
            histories: RwLock::new(HashMap::new()),
        }
    }

    /// Current credit balance; users without an account have a balance of zero.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<i64> {
        if let Some(cached) = self.balances.read().await.get(user_id)
            && cached.fetched_at.elapsed() < self.staleness
        {
            trace!(user_id = %user_id, "serving cached balance");
            return Ok(cached.value);
        }
        self.fresh_balance(user_id).await
    }

    /// Reads the balance from the store, bypassing the cache, and refreshes the cache.
    pub async fn fresh_balance(&self, user_id: &UserId) -> Result<i64> {
        let balance = self
            .store
            .account(user_id)
            .await?
            .map(|account| account.balance())
            .unwrap_or_default();
        remember(&mut *self.balances.write().await, user_id, balance, self.staleness);
        Ok(balance)
    }

    /// Transaction history, most recent first.
    pub async fn list_transactions(&self, user_id: &UserId) -> Result<Vec<CreditTransaction>> {
        if let Some(cached) = self.histories.read().await.get(user_id)
            && cached.fetched_at.elapsed() < self.staleness
        {
            trace!(user_id = %user_id, "serving cached transaction history");
            return Ok(cached.value.clone());
        }
        self.fresh_transactions(user_id).await
    }

    /// Reads the history from the store, bypassing the cache, and refreshes the cache.
    pub async fn fresh_transactions(&self, user_id: &UserId) -> Result<Vec<CreditTransaction>> {
        let mut transactions = self.store.transactions(user_id).await?;
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        remember(
            &mut *self.histories.write().await,
            user_id,
            transactions.clone(),
            self.staleness,
        );
        Ok(transactions)
    }

    /// Looks up the transaction recorded for a checkout session. Always read through; never cached.
    pub async fn transaction_by_reference(
        &self,
        reference: &SessionRef,
    ) -> Result<Option<CreditTransaction>> {
        self.store.transaction_by_reference(reference).await
    }

    /// Drops the cached balance and history of `user_id`; the next read hits the store.
    pub async fn invalidate(&self, user_id: &UserId) {
        self.balances.write().await.remove(user_id);
        self.histories.write().await.remove(user_id);
    }
}
