//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p inventory-store --test postgres_integration -- --test-threads=1
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use inventory_store::{
    InventoryStore, InventoryTransaction, Money, NewOrder, NewOrderLine, OrderStatus, OrderStore,
    PostgresInventoryStore, ProductId, StockDecrement, StoreError, TransactionState, UserId,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_checkout_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresInventoryStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE order_lines, orders, products RESTART IDENTITY CASCADE")
        .execute(&pool)
        .await
        .unwrap();

    PostgresInventoryStore::new(pool)
}

async fn seed_product(store: &PostgresInventoryStore, price_cents: i64, stock: i32) -> ProductId {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO products (name, unit_price_cents, stock_quantity) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind("Widget")
    .bind(price_cents)
    .bind(stock)
    .fetch_one(store.pool())
    .await
    .unwrap();
    ProductId::new(id)
}

async fn stock_of(store: &PostgresInventoryStore, id: ProductId) -> i32 {
    sqlx::query_scalar("SELECT stock_quantity FROM products WHERE id = $1")
        .bind(id.get())
        .fetch_one(store.pool())
        .await
        .unwrap()
}

fn ids(ids: &[ProductId]) -> BTreeSet<ProductId> {
    ids.iter().copied().collect()
}

fn pending_order(total_cents: i64) -> NewOrder {
    NewOrder {
        buyer: UserId::new(7),
        total_price: Money::from_cents(total_cents),
        status: OrderStatus::Pending,
        shipping_address: "221B Baker Street".to_string(),
    }
}

#[tokio::test]
#[serial]
async fn lock_decrement_and_insert_commit_together() {
    let store = get_test_store().await;
    let product = seed_product(&store, 1250, 5).await;

    let mut tx = store.begin().await.unwrap();
    let locked = tx
        .lock_products_for_update(&ids(&[product, ProductId::new(999)]))
        .await
        .unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(locked[&product].stock_quantity, 5);
    assert_eq!(locked[&product].unit_price, Money::from_cents(1250));

    tx.decrement_stock(&[StockDecrement::new(product, 3)])
        .await
        .unwrap();
    let order_id = tx.insert_order(&pending_order(3750)).await.unwrap();
    tx.insert_order_lines(
        order_id,
        &[NewOrderLine {
            product_id: product,
            quantity: 3,
            unit_price: Money::from_cents(1250),
        }],
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);

    assert_eq!(stock_of(&store, product).await, 2);
    let order = store.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.total_price, Money::from_cents(3750));
    let lines = store.get_order_lines(order_id).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].quantity, 3);
    assert_eq!(lines[0].unit_price, Money::from_cents(1250));
}

#[tokio::test]
#[serial]
async fn batched_order_lines_are_inserted_in_one_call() {
    let store = get_test_store().await;
    let a = seed_product(&store, 100, 10).await;
    let b = seed_product(&store, 250, 10).await;
    let c = seed_product(&store, 999, 10).await;

    let mut tx = store.begin().await.unwrap();
    let order_id = tx.insert_order(&pending_order(0)).await.unwrap();
    tx.insert_order_lines(
        order_id,
        &[
            NewOrderLine {
                product_id: a,
                quantity: 1,
                unit_price: Money::from_cents(100),
            },
            NewOrderLine {
                product_id: b,
                quantity: 2,
                unit_price: Money::from_cents(250),
            },
            NewOrderLine {
                product_id: c,
                quantity: 3,
                unit_price: Money::from_cents(999),
            },
        ],
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let lines = store.get_order_lines(order_id).await.unwrap();
    let products: Vec<_> = lines.iter().map(|l| l.product_id).collect();
    assert_eq!(products, vec![a, b, c]);
}

#[tokio::test]
#[serial]
async fn decrement_fails_loudly_instead_of_clamping() {
    let store = get_test_store().await;
    let product = seed_product(&store, 500, 2).await;

    let mut tx = store.begin().await.unwrap();
    tx.lock_products_for_update(&ids(&[product]))
        .await
        .unwrap();
    let result = tx
        .decrement_stock(&[StockDecrement::new(product, 3)])
        .await;
    assert!(matches!(
        result,
        Err(StoreError::NegativeStock { product_id }) if product_id == product
    ));
    tx.rollback().await.unwrap();

    assert_eq!(stock_of(&store, product).await, 2);
}

#[tokio::test]
#[serial]
async fn decrement_of_missing_product_is_reported() {
    let store = get_test_store().await;

    let mut tx = store.begin().await.unwrap();
    let result = tx
        .decrement_stock(&[StockDecrement::new(ProductId::new(4242), 1)])
        .await;
    assert!(matches!(result, Err(StoreError::ProductMissing(id)) if id.get() == 4242));
}

#[tokio::test]
#[serial]
async fn rollback_is_idempotent_and_undoes_writes() {
    let store = get_test_store().await;
    let product = seed_product(&store, 500, 5).await;

    let mut tx = store.begin().await.unwrap();
    tx.lock_products_for_update(&ids(&[product]))
        .await
        .unwrap();
    tx.decrement_stock(&[StockDecrement::new(product, 5)])
        .await
        .unwrap();
    tx.insert_order(&pending_order(2500)).await.unwrap();

    tx.rollback().await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);

    assert_eq!(stock_of(&store, product).await, 5);
    assert!(
        store
            .orders_for_buyer(UserId::new(7))
            .await
            .unwrap()
            .is_empty()
    );

    let after = tx.insert_order(&pending_order(1)).await;
    assert!(matches!(after, Err(StoreError::InvalidState { .. })));
}

#[tokio::test]
#[serial]
async fn concurrent_lock_waits_for_holder_to_commit() {
    let store = get_test_store().await;
    let product = seed_product(&store, 500, 5).await;

    let mut holder = store.begin().await.unwrap();
    holder
        .lock_products_for_update(&ids(&[product]))
        .await
        .unwrap();

    let waiter_store = store.clone();
    let waiter = tokio::spawn(async move {
        let mut tx = waiter_store.begin().await.unwrap();
        let locked = tx
            .lock_products_for_update(&ids(&[product]))
            .await
            .unwrap();
        let stock = locked[&product].stock_quantity;
        tx.rollback().await.unwrap();
        stock
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished());

    holder
        .decrement_stock(&[StockDecrement::new(product, 3)])
        .await
        .unwrap();
    holder.commit().await.unwrap();

    assert_eq!(waiter.await.unwrap(), 2);
}

#[tokio::test]
#[serial]
async fn lock_wait_is_bounded_by_lock_timeout() {
    let store = get_test_store()
        .await
        .with_lock_timeout(Duration::from_millis(100));
    let product = seed_product(&store, 500, 5).await;

    let mut holder = store.begin().await.unwrap();
    holder
        .lock_products_for_update(&ids(&[product]))
        .await
        .unwrap();

    let mut waiter = store.begin().await.unwrap();
    let result = waiter.lock_products_for_update(&ids(&[product])).await;
    assert!(matches!(result, Err(StoreError::LockTimeout { .. })));

    waiter.rollback().await.unwrap();
    holder.rollback().await.unwrap();
}

#[tokio::test]
#[serial]
async fn zero_lock_timeout_does_not_wait_forever() {
    let store = get_test_store().await.with_lock_timeout(Duration::ZERO);
    let product = seed_product(&store, 500, 5).await;

    let mut holder = store.begin().await.unwrap();
    holder
        .lock_products_for_update(&ids(&[product]))
        .await
        .unwrap();

    let mut waiter = store.begin().await.unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        waiter.lock_products_for_update(&ids(&[product])),
    )
    .await
    .expect("lock wait was unbounded");
    assert!(matches!(result, Err(StoreError::LockTimeout { .. })));

    waiter.rollback().await.unwrap();
    holder.rollback().await.unwrap();
}

#[tokio::test]
#[serial]
async fn dropped_transaction_releases_its_locks() {
    let store = get_test_store()
        .await
        .with_lock_timeout(Duration::from_secs(2));
    let product = seed_product(&store, 500, 5).await;

    {
        let mut tx = store.begin().await.unwrap();
        tx.lock_products_for_update(&ids(&[product]))
            .await
            .unwrap();
        tx.decrement_stock(&[StockDecrement::new(product, 5)])
            .await
            .unwrap();
    }

    let mut tx = store.begin().await.unwrap();
    let locked = tx
        .lock_products_for_update(&ids(&[product]))
        .await
        .unwrap();
    assert_eq!(locked[&product].stock_quantity, 5);
    tx.rollback().await.unwrap();
}

#[tokio::test]
#[serial]
async fn order_status_updates() {
    let store = get_test_store().await;

    let mut tx = store.begin().await.unwrap();
    let order_id = tx.insert_order(&pending_order(100)).await.unwrap();
    tx.commit().await.unwrap();

    let moved = store
        .transition_order_status(order_id, OrderStatus::Shipped, OrderStatus::Cancelled)
        .await
        .unwrap();
    assert!(!moved);

    assert!(
        store
            .set_order_status(order_id, OrderStatus::Shipped)
            .await
            .unwrap()
    );
    let order = store.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Shipped);

    assert!(
        !store
            .set_order_status(inventory_store::OrderId::new(9999), OrderStatus::Shipped)
            .await
            .unwrap()
    );
}
