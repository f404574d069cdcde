//! Checkout CLI entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use checkout::CheckoutOptions;
use checkout_cli::config::Config;
use checkout_cli::error::{CliError, Result};
use checkout_cli::{LogFormat, commands, init_tracing};
use clap::{Parser, Subcommand};
use common::{OrderId, UserId};
use inventory_store::{OrderStatus, PostgresInventoryStore};

#[derive(Parser)]
#[command(name = "checkout-cli", version, about = "Checkout engine operator tool")]
struct Cli {
    /// Log line format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Check out a cart for a buyer
    Checkout {
        /// Buyer user id
        #[arg(long)]
        buyer: i64,
        /// Cart JSON file, or `-` for stdin
        #[arg(long)]
        cart: PathBuf,
    },
    /// Show an order with its lines
    Order {
        order_id: i64,
    },
    /// List a buyer's orders, newest first
    Orders {
        #[arg(long)]
        buyer: i64,
    },
    /// Cancel a buyer's pending order
    Cancel {
        #[arg(long)]
        buyer: i64,
        order_id: i64,
    },
    /// Set an order's status (pending, processing, shipped, delivered, cancelled)
    SetStatus {
        order_id: i64,
        status: OrderStatus,
    },
}

async fn connect(config: &Config) -> Result<PostgresInventoryStore> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    Ok(PostgresInventoryStore::new(pool).with_lock_timeout(config.lock_timeout))
}

async fn run(command: Commands, config: &Config) -> Result<serde_json::Value> {
    match command {
        Commands::Migrate => commands::migrate(&connect(config).await?).await,
        Commands::Checkout { buyer, cart } => {
            // Parse input before touching the database
            let cart = commands::read_cart(&cart, UserId::new(buyer))?;
            let options = CheckoutOptions {
                deadline: config.checkout_deadline,
            };
            commands::checkout(connect(config).await?, options, cart).await
        }
        Commands::Order { order_id } => {
            commands::order(connect(config).await?, OrderId::new(order_id)).await
        }
        Commands::Orders { buyer } => {
            commands::orders(connect(config).await?, UserId::new(buyer)).await
        }
        Commands::Cancel { buyer, order_id } => {
            let store = connect(config).await?;
            commands::cancel(store, UserId::new(buyer), OrderId::new(order_id)).await
        }
        Commands::SetStatus { order_id, status } => {
            commands::set_status(connect(config).await?, OrderId::new(order_id), status).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::from_env();

    // 2. Initialize tracing
    init_tracing(cli.log_format, &config.log_level);

    // 3. Run the command
    match run(cli.command, &config).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            if let CliError::Checkout(checkout_err) = &err {
                tracing::debug!(
                    kind = %checkout_err.kind(),
                    retryable = checkout_err.is_retryable(),
                    "checkout error"
                );
            }
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
