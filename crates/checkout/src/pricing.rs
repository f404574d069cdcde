//! Stock validation and pricing against locked product rows.

use std::collections::HashMap;

use common::{Money, ProductId};
use inventory_store::{NewOrderLine, Product, StockDecrement};

use crate::cart::CartLine;
use crate::error::{CheckoutError, Result};

/// A cart line priced at the locked unit price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricedLine {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
}

/// The validated, priced contents of a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedOrder {
    pub lines: Vec<PricedLine>,
    pub total: Money,
}

impl PricedOrder {
    pub fn stock_decrements(&self) -> Vec<StockDecrement> {
        self.lines
            .iter()
            .map(|line| StockDecrement::new(line.product_id, line.quantity))
            .collect()
    }

    pub fn order_lines(&self) -> Vec<NewOrderLine> {
        self.lines
            .iter()
            .map(|line| NewOrderLine {
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price: line.unit_price,
            })
            .collect()
    }
}

/// Validates cart lines against locked products and prices them.
///
/// Must only be called with rows read under lock in the current transaction.
/// Checks run in order: every product exists (smallest missing id is
/// reported), every line has enough stock (first short line in cart order is
/// reported), then the total is summed in exact cents.
pub fn price_locked_lines(
    lines: &[CartLine],
    products: &HashMap<ProductId, Product>,
) -> Result<PricedOrder> {
    if let Some(product_id) = lines
        .iter()
        .map(|line| line.product_id)
        .filter(|id| !products.contains_key(id))
        .min()
    {
        return Err(CheckoutError::ProductNotFound { product_id });
    }

    let mut priced = Vec::with_capacity(lines.len());
    for line in lines {
        let product = products
            .get(&line.product_id)
            .ok_or(CheckoutError::ProductNotFound {
                product_id: line.product_id,
            })?;
        if product.stock_quantity < line.quantity {
            return Err(CheckoutError::InsufficientStock {
                product_id: line.product_id,
                requested: line.quantity,
                available: product.stock_quantity,
            });
        }
        priced.push(PricedLine {
            product_id: line.product_id,
            quantity: line.quantity,
            unit_price: product.unit_price,
        });
    }

    let mut total = Money::zero();
    for line in &priced {
        total = line
            .unit_price
            .checked_mul(line.quantity)
            .and_then(|subtotal| total.checked_add(subtotal))
            .ok_or_else(|| CheckoutError::InvalidInput("order total is too large".to_string()))?;
    }

    Ok(PricedOrder {
        lines: priced,
        total,
    })
}
