use crate::orderbook::OrderBook;
use crate::types::Side;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Orders generated per tight inner loop before the pacing check
const BATCH_SIZE: u64 = 10_000;

/// Shared simulation statistics.
///
/// Every field is individually atomic; readers get tear-free scalars but no
/// cross-field snapshot. f64 gauges are stored as IEEE-754 bit patterns.
#[derive(Debug, Default)]
pub struct SimulationStats {
    pub orders_generated: AtomicU64,
    pub trades_executed: AtomicU64,
    current_price_bits: AtomicU64,
    high_price_bits: AtomicU64,
    low_price_bits: AtomicU64,
    orders_per_second_bits: AtomicU64,
    pub running: AtomicBool,
}

impl SimulationStats {
    pub fn current_price(&self) -> f64 {
        f64::from_bits(self.current_price_bits.load(Ordering::Relaxed))
    }

    pub fn high_price(&self) -> f64 {
        f64::from_bits(self.high_price_bits.load(Ordering::Relaxed))
    }

    pub fn low_price(&self) -> f64 {
        f64::from_bits(self.low_price_bits.load(Ordering::Relaxed))
    }

    /// Session-average order rate (cumulative orders / cumulative elapsed)
    pub fn orders_per_second(&self) -> f64 {
        f64::from_bits(self.orders_per_second_bits.load(Ordering::Relaxed))
    }

    pub fn set_current_price(&self, v: f64) {
        self.current_price_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn set_high_price(&self, v: f64) {
        self.high_price_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn set_low_price(&self, v: f64) {
        self.low_price_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn set_orders_per_second(&self, v: f64) {
        self.orders_per_second_bits.store(v.to_bits(), Ordering::Relaxed);
    }
}

/// Callback invoked on the worker thread every `callback_interval` orders
pub type PriceCallback = Box<dyn FnMut(f64, u64) + Send>;

/// Stochastic order-flow generator.
///
/// Drives the book from one owned worker thread with a mean-reverting
/// random-walk mid price and two-sided limit order flow, throttled toward a
/// target rate. The worker is the book's only mutator in normal operation.
pub struct MarketSimulator {
    book: Arc<Mutex<OrderBook>>,
    base_price: f64,
    stats: Arc<SimulationStats>,
    worker: Option<JoinHandle<()>>,
    price_callback: Option<PriceCallback>,
    callback_interval: u64,
}

impl MarketSimulator {
    pub fn new(book: Arc<Mutex<OrderBook>>, base_price: f64) -> Self {
        let stats = Arc::new(SimulationStats::default());
        stats.set_current_price(base_price);
        stats.set_high_price(base_price);
        stats.set_low_price(base_price);

        MarketSimulator {
            book,
            base_price,
            stats,
            worker: None,
            price_callback: None,
            callback_interval: 1_000,
        }
    }

    pub fn stats(&self) -> Arc<SimulationStats> {
        Arc::clone(&self.stats)
    }

    /// Install a periodic price callback. Takes effect on the next `start`.
    pub fn set_price_callback(
        &mut self,
        cb: impl FnMut(f64, u64) + Send + 'static,
        interval: u64,
    ) {
        self.price_callback = Some(Box::new(cb));
        self.callback_interval = interval.max(1);
    }

    /// Spawn the worker at the given target rate. A second call while the
    /// worker is running is a no-op.
    pub fn start(&mut self, target_ops: u64) {
        if self.stats.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let book = Arc::clone(&self.book);
        let stats = Arc::clone(&self.stats);
        let base_price = self.base_price;
        let target_ops = target_ops.max(1);
        let callback_interval = self.callback_interval;
        let mut price_callback = self.price_callback.take();

        self.worker = Some(std::thread::spawn(move || {
            let mut rng = StdRng::from_entropy();
            let mut mid = stats.current_price();
            let start = Instant::now();
            let mut order_count: u64 = 0;
            let mut last_callback: u64 = 0;

            while stats.running.load(Ordering::Acquire) {
                for _ in 0..BATCH_SIZE {
                    if !stats.running.load(Ordering::Relaxed) {
                        break;
                    }

                    // Random walk with mean reversion toward the base price
                    mid *= 1.0 + rng.gen_range(-0.01..=0.01);
                    mid += (base_price - mid) * 0.0001;

                    stats.set_current_price(mid);
                    if mid > stats.high_price() {
                        stats.set_high_price(mid);
                    }
                    if mid < stats.low_price() {
                        stats.set_low_price(mid);
                    }

                    let side = if rng.gen_bool(0.5) { Side::Bid } else { Side::Ask };
                    let offset = rng.gen_range(0.5..5.0);
                    let size = rng.gen_range(0.001..2.0);
                    let price = match side {
                        Side::Bid => mid - offset,
                        Side::Ask => mid + offset,
                    };

                    // Coarse lock per call; the publisher samples between adds
                    let _ = book.lock().unwrap().add(side, price, size);

                    order_count += 1;
                    stats.orders_generated.fetch_add(1, Ordering::Relaxed);

                    if let Some(cb) = price_callback.as_mut() {
                        if order_count - last_callback >= callback_interval {
                            cb(mid, order_count);
                            last_callback = order_count;
                        }
                    }
                }

                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    stats.set_orders_per_second(order_count as f64 / elapsed);
                }

                // Sleep off any lead over the target rate; overshoot is
                // absorbed by the next sleep, undershoot is not made up
                let expected = order_count as f64 / target_ops as f64;
                if elapsed < expected {
                    std::thread::sleep(Duration::from_secs_f64(expected - elapsed));
                }

                stats
                    .trades_executed
                    .store(book.lock().unwrap().trade_count(), Ordering::Relaxed);
            }
        }));
    }

    /// Stop the worker and wait for it to exit. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.stats.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for MarketSimulator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_book() -> Arc<Mutex<OrderBook>> {
        Arc::new(Mutex::new(OrderBook::new("BTCUSDT")))
    }

    #[test]
    fn test_stats_initialised_to_base_price() {
        let sim = MarketSimulator::new(shared_book(), 92_000.0);
        let stats = sim.stats();
        assert_eq!(stats.current_price(), 92_000.0);
        assert_eq!(stats.high_price(), 92_000.0);
        assert_eq!(stats.low_price(), 92_000.0);
        assert_eq!(stats.orders_generated.load(Ordering::Relaxed), 0);
        assert!(!stats.running.load(Ordering::Relaxed));
    }

    #[test]
    fn test_generator_feeds_book() {
        let book = shared_book();
        let mut sim = MarketSimulator::new(Arc::clone(&book), 92_000.0);
        sim.start(50_000);
        std::thread::sleep(Duration::from_millis(300));
        sim.stop();

        let stats = sim.stats();
        let generated = stats.orders_generated.load(Ordering::Relaxed);
        assert!(generated > 0);
        assert_eq!(book.lock().unwrap().order_count(), generated);

        // Session extremes bracket the current mid
        assert!(stats.low_price() <= stats.current_price());
        assert!(stats.current_price() <= stats.high_price());
        assert!(stats.orders_per_second() > 0.0);
    }

    #[test]
    fn test_double_start_is_noop() {
        let mut sim = MarketSimulator::new(shared_book(), 92_000.0);
        sim.start(50_000);
        assert!(sim.stats().running.load(Ordering::Relaxed));
        // Second start must not replace the running worker
        sim.start(50_000);
        sim.stop();
        assert!(!sim.stats().running.load(Ordering::Relaxed));
    }

    #[test]
    fn test_price_callback_fires_on_interval() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls);

        let mut sim = MarketSimulator::new(shared_book(), 92_000.0);
        sim.set_price_callback(
            move |price, _orders| {
                assert!(price > 0.0);
                seen.fetch_add(1, Ordering::Relaxed);
            },
            100,
        );
        sim.start(50_000);
        std::thread::sleep(Duration::from_millis(300));
        sim.stop();

        assert!(calls.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_stop_on_drop() {
        let stats = {
            let book = shared_book();
            let mut sim = MarketSimulator::new(book, 92_000.0);
            sim.start(50_000);
            sim.stats()
        };
        // Dropping the simulator joined the worker and cleared the flag
        assert!(!stats.running.load(Ordering::Relaxed));
    }
}
