//! Checkout orchestrator.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use common::{Money, OrderId, ProductId};
use inventory_store::{InventoryStore, InventoryTransaction, NewOrder, OrderStatus, StoreError};
use serde::Serialize;

use crate::cart::Cart;
use crate::error::{CheckoutError, Result};
use crate::pricing::{PricedOrder, price_locked_lines};

/// Upper bound on a checkout up to its commit, lock waits included.
pub const DEFAULT_CHECKOUT_DEADLINE: Duration = Duration::from_secs(10);

/// Tuning for [`CheckoutService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutOptions {
    /// Bounds every step before commit. When exceeded, the transaction is
    /// rolled back. The commit itself is not interrupted.
    pub deadline: Duration,
}

impl Default for CheckoutOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_CHECKOUT_DEADLINE,
        }
    }
}

/// Result of a committed checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckoutReceipt {
    pub order_id: OrderId,
    pub total_price: Money,
}

/// Turns carts into committed orders.
///
/// Each call runs one store transaction: lock the cart's product rows, check
/// stock and price against the locked rows, decrement stock, insert the order
/// and its lines, commit. Any failure rolls the whole transaction back.
/// Conflicting checkouts are serialized only by the store's row locks.
pub struct CheckoutService<S: InventoryStore> {
    store: S,
    options: CheckoutOptions,
}

impl<S: InventoryStore> CheckoutService<S> {
    /// Creates a checkout service with default options.
    pub fn new(store: S) -> Self {
        Self::with_options(store, CheckoutOptions::default())
    }

    pub fn with_options(store: S, options: CheckoutOptions) -> Self {
        Self { store, options }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Checks out a cart.
    ///
    /// Returns only after the order has been committed. On any error nothing
    /// has been written: no order, no lines, no stock change.
    #[tracing::instrument(
        skip(self, cart),
        fields(
            buyer = %cart.buyer,
            lines = cart.lines.len(),
            attempt_id = %uuid::Uuid::new_v4(),
        )
    )]
    pub async fn checkout(&self, cart: Cart) -> Result<CheckoutReceipt> {
        metrics::counter!("checkout_attempts_total").increment(1);
        let started = Instant::now();

        let result = self.run(cart).await;

        metrics::histogram!("checkout_duration_seconds").record(started.elapsed().as_secs_f64());
        match &result {
            Ok(receipt) => {
                metrics::counter!("checkout_completed_total").increment(1);
                tracing::info!(
                    order_id = %receipt.order_id,
                    total_price = %receipt.total_price,
                    "checkout committed"
                );
            }
            Err(err) => {
                metrics::counter!("checkout_failed_total", "kind" => err.kind().as_str())
                    .increment(1);
                if err.is_retryable() {
                    tracing::error!(error = %err, kind = %err.kind(), "checkout failed");
                } else {
                    tracing::warn!(error = %err, kind = %err.kind(), "checkout rejected");
                }
            }
        }
        result
    }

    async fn run(&self, cart: Cart) -> Result<CheckoutReceipt> {
        let deadline = tokio::time::Instant::now() + self.options.deadline;
        let deadline_exceeded = || CheckoutError::DeadlineExceeded {
            deadline: self.options.deadline,
        };

        let lines = cart.normalized_lines()?;
        let product_ids: BTreeSet<ProductId> = lines.iter().map(|line| line.product_id).collect();

        let mut tx = tokio::time::timeout_at(deadline, self.store.begin())
            .await
            .map_err(|_| deadline_exceeded())?
            .map_err(CheckoutError::StorageUnavailable)?;

        let placed = tokio::time::timeout_at(
            deadline,
            self.place_order(&mut tx, &cart, &lines, &product_ids),
        )
        .await
        .unwrap_or_else(|_| Err(deadline_exceeded()));

        // Commit runs outside the deadline
        let outcome = match placed {
            Ok(receipt) => tx.commit().await.map(|()| receipt).map_err(|err| match err {
                StoreError::InvalidState { .. } => CheckoutError::InvalidState(err),
                err => CheckoutError::StorageUnavailable(err),
            }),
            Err(err) => Err(err),
        };

        if outcome.is_err()
            && let Err(rollback_err) = tx.rollback().await
        {
            tracing::warn!(error = %rollback_err, "rollback after failed checkout did not complete");
        }
        outcome
    }

    async fn place_order(
        &self,
        tx: &mut S::Transaction,
        cart: &Cart,
        lines: &[crate::CartLine],
        product_ids: &BTreeSet<ProductId>,
    ) -> Result<CheckoutReceipt> {
        let products = tx.lock_products_for_update(product_ids).await?;
        tracing::debug!(locked = products.len(), "product rows locked");

        let priced: PricedOrder = price_locked_lines(lines, &products)?;

        tx.decrement_stock(&priced.stock_decrements()).await?;

        let order_id = tx
            .insert_order(&NewOrder {
                buyer: cart.buyer,
                total_price: priced.total,
                status: OrderStatus::Pending,
                shipping_address: cart.shipping_address.clone(),
            })
            .await?;

        tx.insert_order_lines(order_id, &priced.order_lines())
            .await?;

        Ok(CheckoutReceipt {
            order_id,
            total_price: priced.total,
        })
    }
}
