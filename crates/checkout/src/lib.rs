//! Checkout engine.
//!
//! Converts a buyer's cart into a committed order in one transaction:
//! product rows are locked in ascending id order, stock and prices are read
//! under those locks, stock is decremented and the order with its lines is
//! inserted before a single commit. Concurrent checkouts never oversell.

pub mod cart;
pub mod error;
pub mod orders;
pub mod pricing;
pub mod service;

pub use cart::{Cart, CartLine, CheckoutPayload};
pub use error::{CheckoutError, ErrorKind, OrderServiceError, Result};
pub use orders::{OrderDetails, OrderService};
pub use pricing::{PricedLine, PricedOrder, price_locked_lines};
pub use service::{
    CheckoutOptions, CheckoutReceipt, CheckoutService, DEFAULT_CHECKOUT_DEADLINE,
};
