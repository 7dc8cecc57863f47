//! Portflow CLI
//!
//! Boots a coordinator with a demonstration order model and drives it:
//! run orders through the worker pool, inspect pool status, reload workers.

use anyhow::Result;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use portflow::{
    Coordinator, Event, InMemoryModelStorage, Model, ModelSpec, ModelStorage, PortCall,
    PortJobRequest, PortSpec, PortStatus, Runtime, RuntimeConfig, SubscribeOptions,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ORDER: &str = "ORDER";

#[derive(Parser)]
#[command(name = "portflow")]
#[command(about = "Portflow CLI - run and inspect the port runtime")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, global = true, env = "PORTFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run demo orders through reserveInventory -> chargePayment -> shipOrder
    Run {
        /// Number of orders to place
        #[arg(long, default_value_t = 3)]
        orders: usize,

        /// Make this port fail so the order is compensated
        #[arg(long)]
        fail_at: Option<String>,
    },

    /// Print pool and circuit status as JSON
    Status,

    /// Reload the order pool and print status before and after
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let config = RuntimeConfig::load_from(cli.config.as_deref())?;
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let storage = Arc::new(InMemoryModelStorage::new());

    match cli.command {
        Commands::Run { orders, fail_at } => run_orders(config, storage, orders, fail_at).await,
        Commands::Status => {
            let coordinator = boot(config, storage).await?;
            print_status(&coordinator)?;
            coordinator.shutdown().await;
            Ok(())
        }
        Commands::Reload => {
            let coordinator = boot(config, storage).await?;
            println!("Before reload:");
            print_status(&coordinator)?;
            coordinator.pools().reload(ORDER, None).await?;
            println!("After reload:");
            print_status(&coordinator)?;
            coordinator.shutdown().await;
            Ok(())
        }
    }
}

/// Start a coordinator with preloaded workers for the order model.
async fn boot(mut config: RuntimeConfig, storage: Arc<InMemoryModelStorage>) -> Result<Coordinator> {
    config.pool.preload = true;
    let coordinator = Runtime::run_as_coordinator(config, storage)?;
    coordinator.register_model(order_spec(None))?;
    coordinator.pools().get_thread_pool(ORDER, None).await?;
    Ok(coordinator)
}

fn print_status(coordinator: &Coordinator) -> Result<()> {
    let status = json!({
        "models": coordinator.models(),
        "pools": coordinator.pools().status(),
        "circuits": coordinator.runtime().circuits().status(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_orders(
    config: RuntimeConfig,
    storage: Arc<InMemoryModelStorage>,
    orders: usize,
    fail_at: Option<String>,
) -> Result<()> {
    info!("🚀 Starting Portflow demo with {} orders", orders);
    let coordinator = Runtime::run_as_coordinator(config, storage.clone())?;
    coordinator.register_model(order_spec(fail_at.clone()))?;

    coordinator.broker().subscribe(
        regex::Regex::new("^(undoWorked|undoFailed|portRetryFailed)_")?,
        |event: Event| async move {
            info!("📣 {} {}", event.name, event.payload);
            anyhow::Ok(())
        },
        SubscribeOptions::default(),
    );

    for number in 1..=orders {
        let request = PortJobRequest::create(json!({
            "orderNo": number,
            "sku": format!("SKU-{:03}", number),
            "qty": number,
        }));
        let result = coordinator
            .invoke_port(ORDER, "reserveInventory", request)
            .await?;
        match &result.status {
            PortStatus::Completed => info!("✅ Order {} placed: {:?}", number, result.model.port_flow()),
            other => warn!("⚠️  Order {} did not complete: {:?}", number, other),
        }
    }

    if fail_at.is_some() {
        wait_for_compensation(storage.as_ref(), Duration::from_secs(60)).await?;
    }

    println!("{:<38} {:<60} COMPENSATION", "ORDER", "PORT FLOW");
    for model in storage.list(Some(ORDER)).await? {
        let result = model
            .compensate_result
            .map(|status| status.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<38} {:<60} {}", model.id, model.port_flow().join(" -> "), result);
    }

    coordinator.shutdown().await;
    Ok(())
}

/// Poll storage until every order has a compensation result or time runs out.
async fn wait_for_compensation(storage: &dyn ModelStorage, deadline: Duration) -> Result<()> {
    let started = tokio::time::Instant::now();
    loop {
        let models = storage.list(Some(ORDER)).await?;
        if models.iter().all(|model| model.compensate_result.is_some()) {
            return Ok(());
        }
        if started.elapsed() > deadline {
            warn!("Gave up waiting for compensation after {:?}", deadline);
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// The demo order model. `fail_at` names a port whose adapter always fails.
fn order_spec(fail_at: Option<String>) -> ModelSpec {
    let steps = [
        ("reserveInventory", None, Some("inventoryReserved"), "reserved"),
        ("chargePayment", Some("inventoryReserved"), Some("paymentCharged"), "charged"),
        ("shipOrder", Some("paymentCharged"), None, "shipped"),
    ];

    let mut spec = ModelSpec::new(ORDER);
    for (name, consumes, produces, flag) in steps {
        let mut port = PortSpec::new(name)
            .timeout(Duration::from_millis(500))
            .max_retry(2)
            .undo(move |model: Model| async move {
                info!("↩️  Undoing {} for order {}", name, model.id);
                anyhow::Ok(())
            });
        if let Some(event) = consumes {
            port = port.consumes(event);
        }
        if let Some(event) = produces {
            port = port.produces(event);
        }

        let fails = fail_at.as_deref() == Some(name);
        spec = spec.port(port).adapter(name, move |call: PortCall| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if fails {
                anyhow::bail!("{} is unavailable", name);
            }
            let mut model = call.model;
            model.merge_data(json!({ (flag): true }));
            anyhow::Ok(model)
        });
    }
    spec
}
