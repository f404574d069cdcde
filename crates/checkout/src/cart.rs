//! Cart input accepted by checkout.

use std::collections::HashMap;

use common::{ProductId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::{CheckoutError, Result};

/// One requested product and quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    #[serde(rename = "productID")]
    pub product_id: ProductId,
    pub quantity: u32,
}

impl CartLine {
    pub fn new(product_id: i64, quantity: u32) -> Self {
        Self {
            product_id: ProductId::new(product_id),
            quantity,
        }
    }
}

/// A cart submitted for checkout by an authenticated buyer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cart {
    pub buyer: UserId,
    pub shipping_address: String,
    pub lines: Vec<CartLine>,
}

impl Cart {
    pub fn new(buyer: UserId, shipping_address: impl Into<String>, lines: Vec<CartLine>) -> Self {
        Self {
            buyer,
            shipping_address: shipping_address.into(),
            lines,
        }
    }

    /// Validates the cart and merges lines that name the same product.
    ///
    /// Merged lines keep the position of their first occurrence.
    pub(crate) fn normalized_lines(&self) -> Result<Vec<CartLine>> {
        if self.lines.is_empty() {
            return Err(CheckoutError::InvalidInput("cart has no items".to_string()));
        }
        if self.shipping_address.trim().is_empty() {
            return Err(CheckoutError::InvalidInput(
                "shipping address is required".to_string(),
            ));
        }

        let mut merged: Vec<CartLine> = Vec::with_capacity(self.lines.len());
        let mut positions: HashMap<ProductId, usize> = HashMap::new();
        for line in &self.lines {
            if line.product_id.get() < 1 {
                return Err(CheckoutError::InvalidInput(format!(
                    "invalid product id {}",
                    line.product_id
                )));
            }
            if line.quantity == 0 {
                return Err(CheckoutError::InvalidInput(format!(
                    "quantity for product {} must be at least 1",
                    line.product_id
                )));
            }

            match positions.get(&line.product_id) {
                Some(&index) => {
                    let existing = &mut merged[index];
                    existing.quantity =
                        existing.quantity.checked_add(line.quantity).ok_or_else(|| {
                            CheckoutError::InvalidInput(format!(
                                "quantity for product {} is too large",
                                line.product_id
                            ))
                        })?;
                }
                None => {
                    positions.insert(line.product_id, merged.len());
                    merged.push(*line);
                }
            }
        }
        Ok(merged)
    }
}

/// Wire shape of a checkout request body.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutPayload {
    pub items: Vec<CartLine>,
    pub address: String,
}

impl CheckoutPayload {
    /// Attaches the authenticated buyer.
    pub fn into_cart(self, buyer: UserId) -> Cart {
        Cart::new(buyer, self.address, self.items)
    }
}
