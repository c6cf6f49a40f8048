use crate::ws::WebSocketServer;
use matcher::orderbook::OrderBook;
use matcher::simulator::SimulationStats;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Depth levels included per side of each record
const DEPTH_LEVELS: usize = 10;

/// One aggregated price level in the depth arrays
#[derive(Debug, Serialize)]
pub struct DepthEntry {
    #[serde(serialize_with = "two_decimals")]
    pub price: f64,
    #[serde(serialize_with = "four_decimals")]
    pub size: f64,
}

/// One market-state snapshot, serialised as a single JSON text frame.
///
/// Field names and formatting are the external contract: price-like numbers
/// carry two fractional digits, depth sizes four, and `ordersPerSecond` is a
/// whole number. The record is a best-effort snapshot, not a linearisation
/// point; fields may reflect slightly different instants.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    #[serde(rename = "type")]
    pub record_type: &'static str,
    /// Wall-clock milliseconds
    pub timestamp: u64,
    pub symbol: String,
    #[serde(serialize_with = "two_decimals")]
    pub price: f64,
    #[serde(serialize_with = "two_decimals")]
    pub high: f64,
    #[serde(serialize_with = "two_decimals")]
    pub low: f64,
    #[serde(serialize_with = "two_decimals")]
    pub best_bid: f64,
    #[serde(serialize_with = "two_decimals")]
    pub best_ask: f64,
    #[serde(serialize_with = "two_decimals")]
    pub spread: f64,
    #[serde(serialize_with = "two_decimals")]
    pub mid_price: f64,
    #[serde(serialize_with = "whole_number")]
    pub orders_per_second: f64,
    pub total_orders: u64,
    pub total_trades: u64,
    pub bids: Vec<DepthEntry>,
    pub asks: Vec<DepthEntry>,
}

impl TelemetryRecord {
    /// Sample the book and the generator stats into one record
    pub fn sample(book: &Mutex<OrderBook>, stats: &SimulationStats) -> Self {
        let (symbol, best_bid, best_ask, spread, mid_price, bids, asks) = {
            let book = book.lock().unwrap();
            (
                book.symbol().to_string(),
                book.best_bid(),
                book.best_ask(),
                book.spread(),
                book.mid_price(),
                book.top_bids(DEPTH_LEVELS),
                book.top_asks(DEPTH_LEVELS),
            )
        };

        TelemetryRecord {
            record_type: "telemetry",
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_millis() as u64),
            symbol,
            price: stats.current_price(),
            high: stats.high_price(),
            low: stats.low_price(),
            best_bid,
            best_ask,
            spread,
            mid_price,
            orders_per_second: stats.orders_per_second(),
            total_orders: stats.orders_generated.load(Ordering::Relaxed),
            total_trades: stats.trades_executed.load(Ordering::Relaxed),
            bids: depth_entries(bids),
            asks: depth_entries(asks),
        }
    }
}

fn depth_entries(levels: Vec<(f64, f64)>) -> Vec<DepthEntry> {
    levels
        .into_iter()
        .map(|(price, size)| DepthEntry { price, size })
        .collect()
}

fn two_decimals<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((v * 100.0).round() / 100.0)
}

fn four_decimals<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((v * 10_000.0).round() / 10_000.0)
}

fn whole_number<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(v.round().max(0.0) as u64)
}

/// Periodic sampler that broadcasts one record per interval.
///
/// Owns a worker thread that wakes every `broadcast_interval_ms`, skips the
/// work entirely while no client is connected, and subtracts the work time
/// from the next sleep.
pub struct TelemetryPublisher {
    book: Arc<Mutex<OrderBook>>,
    stats: Arc<SimulationStats>,
    server: Arc<WebSocketServer>,
    interval: Duration,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl TelemetryPublisher {
    pub fn new(
        book: Arc<Mutex<OrderBook>>,
        stats: Arc<SimulationStats>,
        server: Arc<WebSocketServer>,
        broadcast_interval_ms: u64,
    ) -> Self {
        TelemetryPublisher {
            book,
            stats,
            server,
            interval: Duration::from_millis(broadcast_interval_ms.max(1)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Spawn the sampling worker. A second call while running is a no-op.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let book = Arc::clone(&self.book);
        let stats = Arc::clone(&self.stats);
        let server = Arc::clone(&self.server);
        let interval = self.interval;
        let running = Arc::clone(&self.running);

        self.worker = Some(std::thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                let tick_start = Instant::now();

                if server.client_count() > 0 {
                    let record = TelemetryRecord::sample(&book, &stats);
                    match serde_json::to_string(&record) {
                        Ok(json) => server.broadcast(&json),
                        Err(e) => tracing::error!("failed to serialise telemetry: {}", e),
                    }
                }

                let elapsed = tick_start.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
        }));
    }

    /// Stop the worker and wait for it to exit. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TelemetryPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}
