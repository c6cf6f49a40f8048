use matcher::orderbook::OrderBook;
use matcher::simulator::MarketSimulator;
use std::sync::{Arc, Mutex};

mod telemetry;
mod ws;

use telemetry::TelemetryPublisher;
use ws::WebSocketServer;

const SYMBOL: &str = "BTCUSDT";
const BASE_PRICE: f64 = 92_000.0;
const TARGET_ORDERS_PER_SECOND: u64 = 1_000_000;
const TELEMETRY_PORT: u16 = 9001;
const BROADCAST_INTERVAL_MS: u64 = 50;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("========================================");
    println!("  MARKET SIMULATION ENGINE ONLINE");
    println!("  {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();

    // initialize tracing
    tracing_subscriber::fmt::init();

    let book = Arc::new(Mutex::new(OrderBook::new(SYMBOL)));

    let mut simulator = MarketSimulator::new(Arc::clone(&book), BASE_PRICE);
    let stats = simulator.stats();
    simulator.start(TARGET_ORDERS_PER_SECOND);
    tracing::info!(
        "simulating {} around {:.2} at {} orders/s",
        SYMBOL,
        BASE_PRICE,
        TARGET_ORDERS_PER_SECOND
    );

    let server = Arc::new(WebSocketServer::new(TELEMETRY_PORT));
    server.start()?;
    if let Some(addr) = server.local_addr() {
        tracing::info!("telemetry websocket server listening on {}", addr);
    }

    let mut publisher = TelemetryPublisher::new(
        Arc::clone(&book),
        stats,
        Arc::clone(&server),
        BROADCAST_INTERVAL_MS,
    );
    publisher.start();
    tracing::info!("broadcasting telemetry every {}ms", BROADCAST_INTERVAL_MS);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    publisher.stop();
    simulator.stop();
    server.stop();

    Ok(())
}
