use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{Money, OrderId, OrderLineId, ProductId, UserId};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::{
    NewOrder, NewOrderLine, NewProduct, Order, OrderLine, OrderStatus, Product, Result,
    StockDecrement, StoreError, TransactionState,
    store::{
        DEFAULT_LOCK_TIMEOUT, FailurePoint, InventoryStore, InventoryTransaction, OrderStore,
        bounded_lock_timeout, ensure_open, merge_decrements,
    },
};

#[derive(Default)]
struct Tables {
    products: BTreeMap<ProductId, Product>,
    orders: BTreeMap<OrderId, Order>,
    order_lines: Vec<OrderLine>,
}

struct Shared {
    tables: RwLock<Tables>,
    row_locks: Mutex<HashMap<ProductId, Arc<Mutex<()>>>>,
    armed_failures: Mutex<HashSet<FailurePoint>>,
    commit_delay: Mutex<Option<Duration>>,
    next_product_id: AtomicI64,
    next_order_id: AtomicI64,
    next_line_id: AtomicI64,
}

impl Shared {
    async fn row_lock(&self, product_id: ProductId) -> Arc<Mutex<()>> {
        self.row_locks
            .lock()
            .await
            .entry(product_id)
            .or_default()
            .clone()
    }

    async fn take_failure(&self, point: FailurePoint) -> Result<()> {
        if self.armed_failures.lock().await.remove(&point) {
            return Err(StoreError::Injected(point));
        }
        Ok(())
    }
}

/// In-memory inventory store for tests.
///
/// Provides the same locking semantics as the PostgreSQL implementation:
/// every product row has its own exclusive lock, held by a transaction from
/// `lock_products_for_update` until commit or rollback. Writes are staged in
/// the transaction and only become visible on commit.
#[derive(Clone)]
pub struct InMemoryInventoryStore {
    shared: Arc<Shared>,
    lock_timeout: Duration,
}

impl InMemoryInventoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                armed_failures: Mutex::new(HashSet::new()),
                commit_delay: Mutex::new(None),
                next_product_id: AtomicI64::new(1),
                next_order_id: AtomicI64::new(1),
                next_line_id: AtomicI64::new(1),
            }),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets how long transactions from this handle wait for a row lock.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = bounded_lock_timeout(lock_timeout);
        self
    }

    /// Seeds a product row and returns it.
    pub async fn insert_product(&self, product: NewProduct) -> Product {
        let id = ProductId::new(self.shared.next_product_id.fetch_add(1, Ordering::SeqCst));
        let product = Product {
            id,
            name: product.name,
            description: product.description,
            image: product.image,
            unit_price: product.unit_price,
            stock_quantity: product.stock_quantity,
            created_at: Utc::now(),
        };
        self.shared
            .tables
            .write()
            .await
            .products
            .insert(id, product.clone());
        product
    }

    /// Returns the committed state of a product.
    pub async fn product(&self, product_id: ProductId) -> Option<Product> {
        self.shared
            .tables
            .read()
            .await
            .products
            .get(&product_id)
            .cloned()
    }

    /// Administrative price change. Waits for the row lock like any writer.
    pub async fn set_unit_price(&self, product_id: ProductId, unit_price: Money) -> bool {
        let row_lock = self.shared.row_lock(product_id).await;
        let _guard = row_lock.lock().await;
        match self.shared.tables.write().await.products.get_mut(&product_id) {
            Some(product) => {
                product.unit_price = unit_price;
                true
            }
            None => false,
        }
    }

    /// Returns the number of committed orders.
    pub async fn order_count(&self) -> usize {
        self.shared.tables.read().await.orders.len()
    }

    /// Returns the number of committed order lines.
    pub async fn order_line_count(&self) -> usize {
        self.shared.tables.read().await.order_lines.len()
    }

    /// Makes the next call reaching `point` fail with `StoreError::Injected`.
    pub async fn fail_next(&self, point: FailurePoint) {
        self.shared.armed_failures.lock().await.insert(point);
    }

    /// Makes the next commit take at least `delay` before applying its writes.
    pub async fn slow_next_commit(&self, delay: Duration) {
        *self.shared.commit_delay.lock().await = Some(delay);
    }
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        self.shared.take_failure(FailurePoint::Begin).await?;
        Ok(InMemoryTransaction {
            shared: self.shared.clone(),
            lock_timeout: self.lock_timeout,
            state: TransactionState::Open,
            held: BTreeMap::new(),
            pending: PendingWrites::default(),
        })
    }
}

#[derive(Default)]
struct PendingWrites {
    decrements: BTreeMap<ProductId, u64>,
    orders: Vec<Order>,
    lines: Vec<OrderLine>,
}

/// Transaction handle of [`InMemoryInventoryStore`].
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    lock_timeout: Duration,
    state: TransactionState,
    held: BTreeMap<ProductId, OwnedMutexGuard<()>>,
    pending: PendingWrites,
}

impl InMemoryTransaction {
    /// Stock as seen from inside this transaction.
    fn visible_stock(&self, product: &Product) -> u64 {
        let staged = self
            .pending
            .decrements
            .get(&product.id)
            .copied()
            .unwrap_or(0);
        u64::from(product.stock_quantity).saturating_sub(staged)
    }

    fn discard(&mut self) {
        self.pending = PendingWrites::default();
        self.held.clear();
        self.state = TransactionState::RolledBack;
    }
}

#[async_trait]
impl InventoryTransaction for InMemoryTransaction {
    fn state(&self) -> TransactionState {
        self.state
    }

    async fn lock_products_for_update(
        &mut self,
        ids: &BTreeSet<ProductId>,
    ) -> Result<HashMap<ProductId, Product>> {
        ensure_open(self.state, "lock products in")?;
        self.shared.take_failure(FailurePoint::LockProducts).await?;

        let existing: Vec<ProductId> = {
            let tables = self.shared.tables.read().await;
            ids.iter()
                .copied()
                .filter(|id| tables.products.contains_key(id))
                .collect()
        };

        // BTreeSet iteration gives ascending id order
        for product_id in existing {
            if self.held.contains_key(&product_id) {
                continue;
            }
            let row_lock = self.shared.row_lock(product_id).await;
            let guard = tokio::time::timeout(self.lock_timeout, row_lock.lock_owned())
                .await
                .map_err(|_| StoreError::LockTimeout {
                    timeout: self.lock_timeout,
                })?;
            self.held.insert(product_id, guard);
        }

        // Rows created after the existence check were never locked
        let tables = self.shared.tables.read().await;
        let products = ids
            .iter()
            .filter(|id| self.held.contains_key(id))
            .filter_map(|id| tables.products.get(id))
            .map(|product| {
                let mut product = product.clone();
                // never exceeds the committed u32 stock
                product.stock_quantity = self.visible_stock(&product) as u32;
                (product.id, product)
            })
            .collect();
        Ok(products)
    }

    async fn decrement_stock(&mut self, lines: &[StockDecrement]) -> Result<()> {
        ensure_open(self.state, "decrement stock in")?;
        self.shared.take_failure(FailurePoint::DecrementStock).await?;

        let merged = merge_decrements(lines);
        {
            let tables = self.shared.tables.read().await;
            for (&product_id, &quantity) in &merged {
                let product = tables
                    .products
                    .get(&product_id)
                    .ok_or(StoreError::ProductMissing(product_id))?;
                if !self.held.contains_key(&product_id) {
                    return Err(StoreError::NotLocked(product_id));
                }
                if quantity > self.visible_stock(product) {
                    return Err(StoreError::NegativeStock { product_id });
                }
            }
        }

        for (product_id, quantity) in merged {
            *self.pending.decrements.entry(product_id).or_insert(0) += quantity;
        }
        Ok(())
    }

    async fn insert_order(&mut self, order: &NewOrder) -> Result<OrderId> {
        ensure_open(self.state, "insert an order in")?;
        self.shared.take_failure(FailurePoint::InsertOrder).await?;

        let id = OrderId::new(self.shared.next_order_id.fetch_add(1, Ordering::SeqCst));
        self.pending.orders.push(Order {
            id,
            buyer: order.buyer,
            total_price: order.total_price,
            status: order.status,
            shipping_address: order.shipping_address.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn insert_order_lines(
        &mut self,
        order_id: OrderId,
        lines: &[NewOrderLine],
    ) -> Result<()> {
        ensure_open(self.state, "insert order lines in")?;
        self.shared
            .take_failure(FailurePoint::InsertOrderLines)
            .await?;

        if lines.is_empty() {
            return Ok(());
        }

        {
            let tables = self.shared.tables.read().await;
            let order_known = self.pending.orders.iter().any(|o| o.id == order_id)
                || tables.orders.contains_key(&order_id);
            if !order_known {
                return Err(StoreError::OrderMissing(order_id));
            }
            if let Some(line) = lines
                .iter()
                .find(|line| !tables.products.contains_key(&line.product_id))
            {
                return Err(StoreError::ProductMissing(line.product_id));
            }
        }

        let created_at = Utc::now();
        for line in lines {
            self.pending.lines.push(OrderLine {
                id: OrderLineId::new(
                    self.shared.next_line_id.fetch_add(1, Ordering::SeqCst),
                ),
                order_id,
                product_id: line.product_id,
                quantity: line.quantity,
                unit_price: line.unit_price,
                created_at,
            });
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        ensure_open(self.state, "commit")?;
        if let Err(err) = self.shared.take_failure(FailurePoint::Commit).await {
            self.discard();
            return Err(err);
        }
        let delay = self.shared.commit_delay.lock().await.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let pending = std::mem::take(&mut self.pending);
        let shared = self.shared.clone();
        {
            let mut tables = shared.tables.write().await;

            let conflict = pending.decrements.iter().find_map(|(&product_id, &quantity)| {
                match tables.products.get(&product_id) {
                    None => Some(StoreError::ProductMissing(product_id)),
                    Some(product) if quantity > u64::from(product.stock_quantity) => {
                        Some(StoreError::NegativeStock { product_id })
                    }
                    Some(_) => None,
                }
            });
            if let Some(err) = conflict {
                self.discard();
                return Err(err);
            }

            for (product_id, quantity) in pending.decrements {
                if let Some(product) = tables.products.get_mut(&product_id) {
                    product.stock_quantity -= quantity as u32;
                }
            }
            for order in pending.orders {
                tables.orders.insert(order.id, order);
            }
            tables.order_lines.extend(pending.lines);
        }

        self.state = TransactionState::Committed;
        self.held.clear();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.state == TransactionState::Open {
            self.discard();
        }
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Open {
            tracing::debug!(
                locks_held = self.held.len(),
                "open transaction dropped, rolling back"
            );
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryInventoryStore {
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self
            .shared
            .tables
            .read()
            .await
            .orders
            .get(&order_id)
            .cloned())
    }

    async fn get_order_lines(&self, order_id: OrderId) -> Result<Vec<OrderLine>> {
        let tables = self.shared.tables.read().await;
        let mut lines: Vec<_> = tables
            .order_lines
            .iter()
            .filter(|line| line.order_id == order_id)
            .cloned()
            .collect();
        lines.sort_by_key(|line| line.id);
        Ok(lines)
    }

    async fn orders_for_buyer(&self, buyer: UserId) -> Result<Vec<Order>> {
        let tables = self.shared.tables.read().await;
        let mut orders: Vec<_> = tables
            .orders
            .values()
            .filter(|order| order.buyer == buyer)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(orders)
    }

    async fn set_order_status(&self, order_id: OrderId, status: OrderStatus) -> Result<bool> {
        let mut tables = self.shared.tables.write().await;
        match tables.orders.get_mut(&order_id) {
            Some(order) => {
                order.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn transition_order_status(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool> {
        let mut tables = self.shared.tables.write().await;
        match tables.orders.get_mut(&order_id) {
            Some(order) if order.status == from => {
                order.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
