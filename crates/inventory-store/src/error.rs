use std::time::Duration;

use common::{OrderId, ProductId};
use thiserror::Error;

use crate::record::TransactionState;
use crate::store::FailurePoint;

/// Errors that can occur when interacting with the inventory store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not hand out a transaction.
    #[error("Storage unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    /// A row lock could not be acquired within the configured lock timeout.
    #[error("Lock wait exceeded {timeout:?}")]
    LockTimeout { timeout: Duration },

    /// A decrement would have driven stock below zero.
    #[error("Stock for product {product_id} would become negative")]
    NegativeStock { product_id: ProductId },

    /// A write referenced a product row that does not exist.
    #[error("Product {0} does not exist")]
    ProductMissing(ProductId),

    /// Order lines referenced an order that does not exist.
    #[error("Order {0} does not exist")]
    OrderMissing(OrderId),

    /// A product row was written without being locked by the transaction.
    #[error("Product {0} was not locked by this transaction")]
    NotLocked(ProductId),

    /// An operation was attempted on a finished transaction.
    #[error("Cannot {operation} a transaction that is {state}")]
    InvalidState {
        operation: &'static str,
        state: TransactionState,
    },

    /// A failure armed through the in-memory store's failure injection.
    #[error("Injected failure at {0:?}")]
    Injected(FailurePoint),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Result type for inventory store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
