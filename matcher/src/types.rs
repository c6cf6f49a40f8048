use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Order {
    pub id: u64,
    pub side: Side,
    /// Limit price
    pub price: f64,
    /// Remaining quantity, decremented during matching
    pub quantity: f64,
    /// Nanosecond timestamp captured at entry. Diagnostics only; time
    /// priority is encoded by queue position.
    pub timestamp: u64,
}

impl Order {
    pub fn is_filled(&self) -> bool {
        self.quantity <= 0.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Trade {
    pub bid_order_id: u64,
    pub ask_order_id: u64,
    /// Maker's price
    pub price: f64,
    pub quantity: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderBookError {
    #[error("order price must be positive and finite, got {0}")]
    InvalidPrice(f64),
    #[error("order quantity must be positive and finite, got {0}")]
    InvalidQuantity(f64),
}

/// Nanoseconds on a process-local monotonic clock.
pub fn monotonic_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
