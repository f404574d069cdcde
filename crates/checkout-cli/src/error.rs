//! CLI error type.

use checkout::{CheckoutError, OrderServiceError};
use common::OrderId;
use inventory_store::StoreError;
use thiserror::Error;

/// Anything that makes a command exit non-zero.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Could not read cart: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database connection failed: {0}")]
    Connect(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Checkout failed: {0}")]
    Checkout(#[from] CheckoutError),

    #[error(transparent)]
    Orders(#[from] OrderServiceError),

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),
}

pub type Result<T> = std::result::Result<T, CliError>;
