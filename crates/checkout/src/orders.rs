//! Order reads and status changes.

use common::{OrderId, UserId};
use inventory_store::{Order, OrderLine, OrderStatus, OrderStore};
use serde::Serialize;

use crate::error::OrderServiceError;

/// An order with its lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub lines: Vec<OrderLine>,
}

/// Read and lifecycle operations over committed orders.
pub struct OrderService<S: OrderStore> {
    store: S,
}

impl<S: OrderStore> OrderService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_order(
        &self,
        order_id: OrderId,
    ) -> Result<Option<OrderDetails>, OrderServiceError> {
        let Some(order) = self.store.get_order(order_id).await? else {
            return Ok(None);
        };
        let lines = self.store.get_order_lines(order_id).await?;
        Ok(Some(OrderDetails { order, lines }))
    }

    /// Orders placed by a buyer, newest first.
    #[tracing::instrument(skip(self))]
    pub async fn orders_for_buyer(&self, buyer: UserId) -> Result<Vec<Order>, OrderServiceError> {
        Ok(self.store.orders_for_buyer(buyer).await?)
    }

    /// Cancels a buyer's pending order.
    ///
    /// Orders of other buyers are reported as not found. Stock is not
    /// returned to inventory.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        buyer: UserId,
        order_id: OrderId,
    ) -> Result<Order, OrderServiceError> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .filter(|order| order.buyer == buyer)
            .ok_or(OrderServiceError::NotFound(order_id))?;

        let moved = self
            .store
            .transition_order_status(order_id, OrderStatus::Pending, OrderStatus::Cancelled)
            .await?;
        if !moved {
            // Re-read so the error names the status that blocked the change
            let current = self
                .store
                .get_order(order_id)
                .await?
                .map_or(order.status, |order| order.status);
            return Err(OrderServiceError::InvalidStatusTransition {
                order_id,
                from: current,
                to: OrderStatus::Cancelled,
            });
        }

        tracing::info!(%order_id, "order cancelled");
        Ok(Order {
            status: OrderStatus::Cancelled,
            ..order
        })
    }

    /// Sets an order's status unconditionally.
    #[tracing::instrument(skip(self))]
    pub async fn set_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<(), OrderServiceError> {
        if !self.store.set_order_status(order_id, status).await? {
            return Err(OrderServiceError::NotFound(order_id));
        }
        tracing::info!(%order_id, %status, "order status updated");
        Ok(())
    }
}
