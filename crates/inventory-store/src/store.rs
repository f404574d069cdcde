use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use common::{OrderId, ProductId, UserId};

use crate::record::{
    NewOrder, NewOrderLine, Order, OrderLine, OrderStatus, Product, StockDecrement,
    TransactionState,
};
use crate::{Result, StoreError};

/// How long a transaction waits for a row lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Shortest lock wait a store accepts.
///
/// PostgreSQL treats a `lock_timeout` of zero as no limit at all.
pub const MIN_LOCK_TIMEOUT: Duration = Duration::from_millis(1);

/// Raises `timeout` to [`MIN_LOCK_TIMEOUT`] so every backend keeps a bound.
pub fn bounded_lock_timeout(timeout: Duration) -> Duration {
    timeout.max(MIN_LOCK_TIMEOUT)
}

/// Source of checkout transactions.
///
/// All implementations must be thread-safe (Send + Sync) so many workers can
/// run transactions against the same tables at once.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Transaction handle produced by [`InventoryStore::begin`].
    type Transaction: InventoryTransaction + 'static;

    /// Opens a new transaction.
    ///
    /// Fails with `Unavailable` when no transaction can be opened.
    async fn begin(&self) -> Result<Self::Transaction>;
}

/// A transaction against the product and order tables.
///
/// The handle moves `Open -> Committed` or `Open -> RolledBack`, and both
/// end states are terminal. Every operation except [`rollback`] fails with
/// `InvalidState` once the transaction has ended. Dropping an open handle
/// rolls it back and releases every row lock it holds.
///
/// After any operation returns an error the caller must roll back; the
/// transaction may hold partial writes.
///
/// [`rollback`]: InventoryTransaction::rollback
#[async_trait]
pub trait InventoryTransaction: Send {
    /// Current lifecycle state.
    fn state(&self) -> TransactionState;

    /// Reads and exclusively locks the given product rows.
    ///
    /// Locks are taken in ascending id order and held until the transaction
    /// ends. Ids with no matching row are simply absent from the result.
    /// Waiting longer than the lock timeout fails with `LockTimeout`.
    async fn lock_products_for_update(
        &mut self,
        ids: &BTreeSet<ProductId>,
    ) -> Result<HashMap<ProductId, Product>>;

    /// Decrements stock for every line in one batched write.
    ///
    /// Lines for the same product are summed. Fails with `NegativeStock`
    /// rather than clamping when any product would go below zero.
    async fn decrement_stock(&mut self, lines: &[StockDecrement]) -> Result<()>;

    /// Inserts an order and returns its generated id.
    async fn insert_order(&mut self, order: &NewOrder) -> Result<OrderId>;

    /// Inserts all lines of an order in one batched write.
    async fn insert_order_lines(&mut self, order_id: OrderId, lines: &[NewOrderLine])
    -> Result<()>;

    /// Makes every write of this transaction durable and releases its locks.
    async fn commit(&mut self) -> Result<()>;

    /// Discards every write of this transaction and releases its locks.
    ///
    /// Idempotent: returns `Ok` in every state, including after commit.
    async fn rollback(&mut self) -> Result<()>;
}

/// Read and status operations on persisted orders.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Loads an order by id.
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>>;

    /// Loads the lines of an order, ordered by line id.
    async fn get_order_lines(&self, order_id: OrderId) -> Result<Vec<OrderLine>>;

    /// Lists a buyer's orders, newest first.
    async fn orders_for_buyer(&self, buyer: UserId) -> Result<Vec<Order>>;

    /// Sets the status unconditionally. Returns false if the order is absent.
    async fn set_order_status(&self, order_id: OrderId, status: OrderStatus) -> Result<bool>;

    /// Moves the status from `from` to `to` atomically.
    ///
    /// Returns false if the order is absent or not currently in `from`.
    async fn transition_order_status(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool>;
}

/// Points at which the in-memory store can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Begin,
    LockProducts,
    DecrementStock,
    InsertOrder,
    InsertOrderLines,
    Commit,
}

/// Fails with `InvalidState` unless the transaction is still open.
pub fn ensure_open(state: TransactionState, operation: &'static str) -> Result<()> {
    if state.is_terminal() {
        return Err(StoreError::InvalidState { operation, state });
    }
    Ok(())
}

/// Sums decrement quantities per product, in ascending product order.
pub fn merge_decrements(lines: &[StockDecrement]) -> BTreeMap<ProductId, u64> {
    let mut merged = BTreeMap::new();
    for line in lines {
        *merged.entry(line.product_id).or_insert(0u64) += u64::from(line.quantity);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_repeated_products() {
        let merged = merge_decrements(&[
            StockDecrement::new(ProductId::new(2), 1),
            StockDecrement::new(ProductId::new(1), 4),
            StockDecrement::new(ProductId::new(2), 3),
        ]);

        let entries: Vec<_> = merged.into_iter().collect();
        assert_eq!(entries, vec![(ProductId::new(1), 4), (ProductId::new(2), 4)]);
    }

    #[test]
    fn merge_does_not_overflow_u32() {
        let merged = merge_decrements(&[
            StockDecrement::new(ProductId::new(1), u32::MAX),
            StockDecrement::new(ProductId::new(1), u32::MAX),
        ]);
        assert_eq!(merged[&ProductId::new(1)], 2 * u64::from(u32::MAX));
    }

    #[test]
    fn ensure_open_rejects_terminal_states() {
        assert!(ensure_open(TransactionState::Open, "commit").is_ok());
        assert!(matches!(
            ensure_open(TransactionState::Committed, "commit"),
            Err(StoreError::InvalidState {
                operation: "commit",
                state: TransactionState::Committed
            })
        ));
        assert!(ensure_open(TransactionState::RolledBack, "insert an order in").is_err());
    }

    #[test]
    fn zero_lock_timeout_is_raised_to_the_minimum() {
        assert_eq!(bounded_lock_timeout(Duration::ZERO), MIN_LOCK_TIMEOUT);
        assert_eq!(bounded_lock_timeout(Duration::from_micros(400)), MIN_LOCK_TIMEOUT);
        assert_eq!(
            bounded_lock_timeout(Duration::from_millis(250)),
            Duration::from_millis(250)
        );
    }
}
