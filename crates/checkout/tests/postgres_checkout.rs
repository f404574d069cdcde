//! Checkout against a real PostgreSQL
//!
//! Run with:
//!
//! ```bash
//! cargo test -p checkout --test postgres_checkout -- --test-threads=1
//! ```

use std::sync::Arc;

use checkout::{Cart, CartLine, CheckoutError, CheckoutService};
use common::{Money, ProductId, UserId};
use futures_util::future::join_all;
use inventory_store::{OrderStore, PostgresInventoryStore};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

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

async fn get_test_store() -> PostgresInventoryStore {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
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

fn cart(buyer: i64, product_id: ProductId, quantity: u32) -> Cart {
    Cart::new(
        UserId::new(buyer),
        "10 Downing Street",
        vec![CartLine {
            product_id,
            quantity,
        }],
    )
}

#[tokio::test]
#[serial]
async fn checkout_commits_order_and_stock() {
    let store = get_test_store().await;
    let product = seed_product(&store, 1999, 5).await;
    let service = CheckoutService::new(store.clone());

    let receipt = service.checkout(cart(1, product, 3)).await.unwrap();

    assert_eq!(receipt.total_price, Money::from_cents(5997));
    assert_eq!(stock_of(&store, product).await, 2);
    let lines = store.get_order_lines(receipt.order_id).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].unit_price, Money::from_cents(1999));
}

#[tokio::test]
#[serial]
async fn rejected_checkout_leaves_no_order() {
    let store = get_test_store().await;
    let product = seed_product(&store, 500, 2).await;
    let service = CheckoutService::new(store.clone());

    let err = service.checkout(cart(1, product, 3)).await.unwrap_err();
    assert!(matches!(err, CheckoutError::InsufficientStock { .. }));

    let err = service
        .checkout(cart(1, ProductId::new(999), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::ProductNotFound { .. }));

    assert_eq!(stock_of(&store, product).await, 2);
    assert!(
        store
            .orders_for_buyer(UserId::new(1))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn concurrent_checkouts_never_oversell() {
    let store = get_test_store().await;
    let product = seed_product(&store, 100, 5).await;
    let service = Arc::new(CheckoutService::new(store.clone()));

    let attempts = (0..12).map(|buyer| {
        let service = service.clone();
        tokio::spawn(async move { service.checkout(cart(buyer, product, 1)).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
    assert_eq!(stock_of(&store, product).await, 0);

    let orders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(orders, 5);
}
