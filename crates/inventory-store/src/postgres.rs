use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use common::{Money, OrderId, OrderLineId, ProductId, UserId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::{
    NewOrder, NewOrderLine, Order, OrderLine, OrderStatus, Product, Result, StockDecrement,
    StoreError, TransactionState,
    store::{
        DEFAULT_LOCK_TIMEOUT, InventoryStore, InventoryTransaction, OrderStore,
        bounded_lock_timeout, ensure_open, merge_decrements,
    },
};

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// PostgreSQL-backed inventory store implementation.
#[derive(Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresInventoryStore {
    /// Creates a new PostgreSQL inventory store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets the per-transaction `lock_timeout`, never below [`MIN_LOCK_TIMEOUT`].
    ///
    /// [`MIN_LOCK_TIMEOUT`]: crate::MIN_LOCK_TIMEOUT
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = bounded_lock_timeout(lock_timeout);
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn row_to_product(row: PgRow) -> Result<Product> {
    let stock: i32 = row.try_get("stock_quantity")?;
    Ok(Product {
        id: ProductId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        image: row.try_get("image")?,
        unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
        stock_quantity: u32::try_from(stock).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_order(row: PgRow) -> Result<Order> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: OrderId::new(row.try_get("id")?),
        buyer: UserId::new(row.try_get("buyer_user_id")?),
        total_price: Money::from_cents(row.try_get("total_price_cents")?),
        status: status
            .parse()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        shipping_address: row.try_get("shipping_address")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_order_line(row: PgRow) -> Result<OrderLine> {
    let quantity: i32 = row.try_get("quantity")?;
    Ok(OrderLine {
        id: OrderLineId::new(row.try_get("id")?),
        order_id: OrderId::new(row.try_get("order_id")?),
        product_id: ProductId::new(row.try_get("product_id")?),
        quantity: u32::try_from(quantity).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
        created_at: row.try_get("created_at")?,
    })
}

/// Maps lock-timeout failures to `LockTimeout`, everything else to `Database`.
fn classify(err: sqlx::Error, lock_timeout: Duration) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE)
    {
        return StoreError::LockTimeout {
            timeout: lock_timeout,
        };
    }
    StoreError::Database(err)
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Unavailable)?;

        // Scoped to this transaction only (is_local = true)
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Unavailable)?;

        Ok(PostgresTransaction {
            tx: Some(tx),
            state: TransactionState::Open,
            lock_timeout: self.lock_timeout,
        })
    }
}

/// Transaction handle of [`PostgresInventoryStore`].
///
/// Wraps a sqlx transaction, which issues `ROLLBACK` when dropped unfinished.
pub struct PostgresTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    state: TransactionState,
    lock_timeout: Duration,
}

impl PostgresTransaction {
    fn conn(&mut self, operation: &'static str) -> Result<&mut Transaction<'static, Postgres>> {
        ensure_open(self.state, operation)?;
        self.tx.as_mut().ok_or(StoreError::InvalidState {
            operation,
            state: self.state,
        })
    }
}

#[async_trait]
impl InventoryTransaction for PostgresTransaction {
    fn state(&self) -> TransactionState {
        self.state
    }

    async fn lock_products_for_update(
        &mut self,
        ids: &BTreeSet<ProductId>,
    ) -> Result<HashMap<ProductId, Product>> {
        let lock_timeout = self.lock_timeout;
        let conn = self.conn("lock products in")?;
        let ids: Vec<i64> = ids.iter().map(ProductId::get).collect();

        // ORDER BY sits below the row-locking step, so locks are taken in id order
        let rows = sqlx::query(
            r#"
            SELECT id, name, description, image, unit_price_cents, stock_quantity, created_at
            FROM products
            WHERE id = ANY($1)
            ORDER BY id ASC
            FOR UPDATE
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut **conn)
        .await
        .map_err(|e| classify(e, lock_timeout))?;

        rows.into_iter()
            .map(|row| row_to_product(row).map(|product| (product.id, product)))
            .collect()
    }

    async fn decrement_stock(&mut self, lines: &[StockDecrement]) -> Result<()> {
        let lock_timeout = self.lock_timeout;
        let conn = self.conn("decrement stock in")?;

        let merged = merge_decrements(lines);
        if merged.is_empty() {
            return Ok(());
        }
        let product_ids: Vec<i64> = merged.keys().map(ProductId::get).collect();
        let quantities: Vec<i64> = merged.values().map(|&q| q as i64).collect();

        let updated: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE products AS p
            SET stock_quantity = p.stock_quantity - d.quantity
            FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS d(product_id, quantity)
            WHERE p.id = d.product_id AND p.stock_quantity >= d.quantity
            RETURNING p.id
            "#,
        )
        .bind(&product_ids)
        .bind(&quantities)
        .fetch_all(&mut **conn)
        .await
        .map_err(|e| classify(e, lock_timeout))?;

        if updated.len() == product_ids.len() {
            return Ok(());
        }

        // Some rows were skipped: work out whether they are missing or short
        let updated: HashSet<i64> = updated.into_iter().collect();
        let existing: HashSet<i64> =
            sqlx::query_scalar::<_, i64>("SELECT id FROM products WHERE id = ANY($1)")
                .bind(&product_ids)
                .fetch_all(&mut **conn)
                .await
                .map_err(|e| classify(e, lock_timeout))?
                .into_iter()
                .collect();

        for id in product_ids {
            if updated.contains(&id) {
                continue;
            }
            let product_id = ProductId::new(id);
            if !existing.contains(&id) {
                return Err(StoreError::ProductMissing(product_id));
            }
            return Err(StoreError::NegativeStock { product_id });
        }
        Ok(())
    }

    async fn insert_order(&mut self, order: &NewOrder) -> Result<OrderId> {
        let lock_timeout = self.lock_timeout;
        let conn = self.conn("insert an order in")?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO orders (buyer_user_id, total_price_cents, status, shipping_address)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(order.buyer.get())
        .bind(order.total_price.cents())
        .bind(order.status.as_str())
        .bind(&order.shipping_address)
        .fetch_one(&mut **conn)
        .await
        .map_err(|e| classify(e, lock_timeout))?;

        Ok(OrderId::new(id))
    }

    async fn insert_order_lines(
        &mut self,
        order_id: OrderId,
        lines: &[NewOrderLine],
    ) -> Result<()> {
        let lock_timeout = self.lock_timeout;
        let conn = self.conn("insert order lines in")?;
        if lines.is_empty() {
            return Ok(());
        }

        let product_ids: Vec<i64> = lines.iter().map(|l| l.product_id.get()).collect();
        let quantities: Vec<i64> = lines.iter().map(|l| i64::from(l.quantity)).collect();
        let prices: Vec<i64> = lines.iter().map(|l| l.unit_price.cents()).collect();

        sqlx::query(
            r#"
            INSERT INTO order_lines (order_id, product_id, quantity, unit_price_cents)
            SELECT $1, line.product_id, line.quantity, line.unit_price_cents
            FROM UNNEST($2::BIGINT[], $3::BIGINT[], $4::BIGINT[])
                AS line(product_id, quantity, unit_price_cents)
            "#,
        )
        .bind(order_id.get())
        .bind(&product_ids)
        .bind(&quantities)
        .bind(&prices)
        .execute(&mut **conn)
        .await
        .map_err(|e| classify(e, lock_timeout))?;

        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn("commit")?;
        let Some(tx) = self.tx.take() else {
            return Err(StoreError::InvalidState {
                operation: "commit",
                state: self.state,
            });
        };

        match tx.commit().await {
            Ok(()) => {
                self.state = TransactionState::Committed;
                Ok(())
            }
            Err(err) => {
                // the server has discarded the transaction
                self.state = TransactionState::RolledBack;
                Err(StoreError::Database(err))
            }
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.state != TransactionState::Open {
            return Ok(());
        }
        self.state = TransactionState::RolledBack;
        if let Some(tx) = self.tx.take()
            && let Err(err) = tx.rollback().await
        {
            // the connection drops the transaction either way
            tracing::warn!(error = %err, "rollback failed");
        }
        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Open {
            tracing::debug!("open transaction dropped, rolling back");
        }
    }
}

#[async_trait]
impl OrderStore for PostgresInventoryStore {
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT id, buyer_user_id, total_price_cents, status, shipping_address, created_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id.get())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_order).transpose()
    }

    async fn get_order_lines(&self, order_id: OrderId) -> Result<Vec<OrderLine>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, product_id, quantity, unit_price_cents, created_at
            FROM order_lines
            WHERE order_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(order_id.get())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_order_line).collect()
    }

    async fn orders_for_buyer(&self, buyer: UserId) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT id, buyer_user_id, total_price_cents, status, shipping_address, created_at
            FROM orders
            WHERE buyer_user_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(buyer.get())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_order).collect()
    }

    async fn set_order_status(&self, order_id: OrderId, status: OrderStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE orders SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(order_id.get())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn transition_order_status(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE orders SET status = $1 WHERE id = $2 AND status = $3")
            .bind(to.as_str())
            .bind(order_id.get())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}
