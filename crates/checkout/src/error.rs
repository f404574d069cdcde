//! Checkout error types.

use std::time::Duration;

use common::{OrderId, ProductId};
use inventory_store::{OrderStatus, StoreError};
use thiserror::Error;

/// Errors that can occur during checkout.
///
/// Every variant is returned only after the transaction has been rolled back.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// The cart is malformed or empty.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The cart references a product that does not exist.
    #[error("Product not found: {product_id}")]
    ProductNotFound { product_id: ProductId },

    /// A product does not have enough units for its cart line.
    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    /// A transaction could not be opened or committed.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),

    /// A store operation failed mid-transaction.
    #[error("Transaction failed: {0}")]
    TransactionFailed(#[source] StoreError),

    /// The checkout did not reach its commit within its deadline.
    #[error("Checkout did not reach commit within {deadline:?}")]
    DeadlineExceeded { deadline: Duration },

    /// The transaction was used after it ended.
    #[error("Invalid transaction state: {0}")]
    InvalidState(#[source] StoreError),
}

/// Coarse classification of a [`CheckoutError`] for callers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    ProductNotFound,
    InsufficientStock,
    StorageUnavailable,
    TransactionFailed,
    DeadlineExceeded,
    InvalidState,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ProductNotFound => "product_not_found",
            ErrorKind::InsufficientStock => "insufficient_stock",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::TransactionFailed => "transaction_failed",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::InvalidState => "invalid_state",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CheckoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckoutError::InvalidInput(_) => ErrorKind::InvalidInput,
            CheckoutError::ProductNotFound { .. } => ErrorKind::ProductNotFound,
            CheckoutError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            CheckoutError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            CheckoutError::TransactionFailed(_) => ErrorKind::TransactionFailed,
            CheckoutError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            CheckoutError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Whether resubmitting the same cart may succeed.
    ///
    /// Business rejections are final for the attempt; storage trouble is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StorageUnavailable
                | ErrorKind::TransactionFailed
                | ErrorKind::DeadlineExceeded
        )
    }
}

impl From<StoreError> for CheckoutError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidState { .. } => CheckoutError::InvalidState(err),
            other => CheckoutError::TransactionFailed(other),
        }
    }
}

/// Convenience type alias for checkout results.
pub type Result<T> = std::result::Result<T, CheckoutError>;

/// Errors returned by [`crate::OrderService`].
#[derive(Debug, Error)]
pub enum OrderServiceError {
    /// The order does not exist or is not visible to the caller.
    #[error("Order not found: {0}")]
    NotFound(OrderId),

    /// The order's current status does not allow the change.
    #[error("Order {order_id} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
