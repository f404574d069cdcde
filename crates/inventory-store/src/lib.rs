//! Transactional inventory store for the checkout engine.
//!
//! Exposes row-locking reads and batched writes against the product, order
//! and order-line tables behind the [`InventoryStore`] and
//! [`InventoryTransaction`] traits, with PostgreSQL and in-memory backends.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use common::{Money, OrderId, OrderLineId, ProductId, UserId};
pub use error::{Result, StoreError};
pub use memory::{InMemoryInventoryStore, InMemoryTransaction};
pub use postgres::{PostgresInventoryStore, PostgresTransaction};
pub use record::{
    NewOrder, NewOrderLine, NewProduct, Order, OrderLine, OrderStatus, Product, StockDecrement,
    TransactionState, UnknownOrderStatus,
};
pub use store::{
    DEFAULT_LOCK_TIMEOUT, FailurePoint, InventoryStore, InventoryTransaction, MIN_LOCK_TIMEOUT,
    OrderStore, bounded_lock_timeout,
};
