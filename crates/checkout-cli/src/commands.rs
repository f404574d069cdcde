//! Subcommand implementations.
//!
//! Each command returns the JSON document it wants printed on stdout.

use std::io::Read;
use std::path::Path;

use checkout::{Cart, CheckoutOptions, CheckoutPayload, CheckoutService, OrderService};
use common::{OrderId, UserId};
use inventory_store::{OrderStatus, PostgresInventoryStore};
use serde_json::{Value, json};

use crate::error::{CliError, Result};

/// Parses a cart document and attaches the buyer.
pub fn parse_cart(json: &str, buyer: UserId) -> Result<Cart> {
    let payload: CheckoutPayload = serde_json::from_str(json)?;
    Ok(payload.into_cart(buyer))
}

/// Reads a cart document from a file, or from stdin when `source` is `-`.
pub fn read_cart(source: &Path, buyer: UserId) -> Result<Cart> {
    let json = if source == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(source)?
    };
    parse_cart(&json, buyer)
}

pub async fn migrate(store: &PostgresInventoryStore) -> Result<Value> {
    store.run_migrations().await?;
    tracing::info!("migrations applied");
    Ok(json!({ "migrated": true }))
}

pub async fn checkout(
    store: PostgresInventoryStore,
    options: CheckoutOptions,
    cart: Cart,
) -> Result<Value> {
    let service = CheckoutService::with_options(store, options);
    let receipt = service.checkout(cart).await?;
    Ok(serde_json::to_value(receipt)?)
}

pub async fn order(store: PostgresInventoryStore, order_id: OrderId) -> Result<Value> {
    let details = OrderService::new(store)
        .get_order(order_id)
        .await?
        .ok_or(CliError::OrderNotFound(order_id))?;
    Ok(serde_json::to_value(details)?)
}

pub async fn orders(store: PostgresInventoryStore, buyer: UserId) -> Result<Value> {
    let orders = OrderService::new(store).orders_for_buyer(buyer).await?;
    Ok(serde_json::to_value(orders)?)
}

pub async fn cancel(
    store: PostgresInventoryStore,
    buyer: UserId,
    order_id: OrderId,
) -> Result<Value> {
    let order = OrderService::new(store)
        .cancel_order(buyer, order_id)
        .await?;
    Ok(serde_json::to_value(order)?)
}

pub async fn set_status(
    store: PostgresInventoryStore,
    order_id: OrderId,
    status: OrderStatus,
) -> Result<Value> {
    OrderService::new(store).set_status(order_id, status).await?;
    Ok(json!({ "order_id": order_id, "status": status }))
}
