use super::types::{monotonic_nanos, Order, OrderBookError, Side, Trade};
use ordered_float::OrderedFloat;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Price key for the ladder maps. `OrderedFloat` gives a total order over
/// the finite f64 prices the book accepts.
type PriceKey = OrderedFloat<f64>;

/// Callback invoked synchronously for every trade produced by matching,
/// on the thread that called `add`.
pub type TradeCallback = Box<dyn FnMut(&Trade) + Send>;

/// One queue slot. A cancelled entry stays in place as a tombstone so the
/// positions of the entries behind it never shift; it is reclaimed when it
/// reaches the front.
#[derive(Debug, Clone)]
struct LevelEntry {
    order: Order,
    cancelled: bool,
}

/// All orders resting at one price, in arrival order (FIFO)
#[derive(Debug, Clone, Default)]
pub struct PriceLevel {
    orders: VecDeque<LevelEntry>,
    /// Sequence number of the entry currently at the front. Physical pops
    /// happen only at the front, so the entry with sequence `s` always sits
    /// at queue index `s - head_seq`.
    head_seq: u64,
    /// Entries in the queue that are not tombstones
    live: usize,
}

impl PriceLevel {
    /// Sum of remaining quantities across the queue, tombstones excluded
    pub fn total_quantity(&self) -> f64 {
        self.orders
            .iter()
            .filter(|e| !e.cancelled)
            .map(|e| e.order.quantity)
            .sum()
    }

    pub fn order_count(&self) -> usize {
        self.live
    }
}

/// Location of a resting order: ladder side, level price, and the order's
/// stable queue position within the level
#[derive(Debug, Clone, Copy)]
struct OrderLocation {
    side: Side,
    price: PriceKey,
    seq: u64,
}

pub struct OrderBook {
    symbol: String,

    /// Bid ladder; the best bid is the last (highest) key
    bids: BTreeMap<PriceKey, PriceLevel>,
    /// Ask ladder; the best ask is the first (lowest) key
    asks: BTreeMap<PriceKey, PriceLevel>,

    /// Fast lookup from order id to its queue slot, for O(1) removal
    order_index: HashMap<u64, OrderLocation>,

    next_order_id: u64,
    trade_count: u64,
    last_price: f64,
    trade_callback: Option<TradeCallback>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        OrderBook {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            order_index: HashMap::new(),
            next_order_id: 1,
            trade_count: 0,
            last_price: 0.0,
            trade_callback: None,
        }
    }

    /// Add an order and attempt matching against the opposite ladder.
    ///
    /// Returns the id of the resting order, or `0` when the order was fully
    /// filled during matching and never rested. Trades are delivered through
    /// the trade callback, in execution order, before this call returns.
    pub fn add(&mut self, side: Side, price: f64, quantity: f64) -> Result<u64, OrderBookError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(OrderBookError::InvalidPrice(price));
        }
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(OrderBookError::InvalidQuantity(quantity));
        }

        let id = self.next_order_id;
        self.next_order_id += 1;

        let mut order = Order {
            id,
            side,
            price,
            quantity,
            timestamp: monotonic_nanos(),
        };

        match side {
            Side::Bid => self.match_bid(&mut order),
            Side::Ask => self.match_ask(&mut order),
        }

        if order.is_filled() {
            return Ok(0);
        }

        // Residual quantity rests at the tail of its level
        let ladder = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        let key = OrderedFloat(price);
        let level = ladder.entry(key).or_default();
        let seq = level.head_seq + level.orders.len() as u64;
        level.orders.push_back(LevelEntry {
            order,
            cancelled: false,
        });
        level.live += 1;
        self.order_index.insert(id, OrderLocation { side, price: key, seq });

        Ok(id)
    }

    /// Cancel a resting order by id in O(1). Returns false when the id is
    /// unknown (never rested, already filled, or already cancelled).
    ///
    /// The stored sequence number gives the entry's queue index directly.
    /// The front entry is popped; any other entry is tombstoned in place and
    /// reclaimed once it reaches the front.
    pub fn cancel(&mut self, order_id: u64) -> bool {
        let Some(loc) = self.order_index.remove(&order_id) else {
            return false;
        };

        let ladder = match loc.side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        if let Some(level) = ladder.get_mut(&loc.price) {
            let idx = (loc.seq - level.head_seq) as usize;
            debug_assert_eq!(level.orders[idx].order.id, order_id);

            if idx == 0 {
                level.orders.pop_front();
                level.head_seq += 1;
                // Reclaim tombstones now exposed at the front
                while level.orders.front().map_or(false, |e| e.cancelled) {
                    level.orders.pop_front();
                    level.head_seq += 1;
                }
            } else {
                level.orders[idx].cancelled = true;
            }

            level.live -= 1;
            if level.live == 0 {
                ladder.remove(&loc.price);
            }
        }

        true
    }

    fn match_bid(&mut self, bid: &mut Order) {
        // Sweep asks from the lowest level upward
        while !bid.is_filled() {
            let Some((&ask_price, level)) = self.asks.iter_mut().next() else {
                break;
            };
            if bid.price < ask_price.0 {
                break;
            }

            while !bid.is_filled() {
                let Some(entry) = level.orders.front_mut() else {
                    break;
                };
                if entry.cancelled {
                    level.orders.pop_front();
                    level.head_seq += 1;
                    continue;
                }

                let ask = &mut entry.order;
                let fill_qty = bid.quantity.min(ask.quantity);
                let trade = Trade {
                    bid_order_id: bid.id,
                    ask_order_id: ask.id,
                    price: ask.price, // maker's price
                    quantity: fill_qty,
                    timestamp: monotonic_nanos(),
                };

                bid.quantity -= fill_qty;
                ask.quantity -= fill_qty;
                if ask.is_filled() {
                    self.order_index.remove(&trade.ask_order_id);
                    level.orders.pop_front();
                    level.head_seq += 1;
                    level.live -= 1;
                }

                self.last_price = trade.price;
                if let Some(cb) = self.trade_callback.as_mut() {
                    cb(&trade);
                }
                self.trade_count += 1;
            }

            if level.live == 0 {
                self.asks.remove(&ask_price);
            }
        }
    }

    fn match_ask(&mut self, ask: &mut Order) {
        // Sweep bids from the highest level downward
        while !ask.is_filled() {
            let Some((&bid_price, level)) = self.bids.iter_mut().next_back() else {
                break;
            };
            if ask.price > bid_price.0 {
                break;
            }

            while !ask.is_filled() {
                let Some(entry) = level.orders.front_mut() else {
                    break;
                };
                if entry.cancelled {
                    level.orders.pop_front();
                    level.head_seq += 1;
                    continue;
                }

                let bid = &mut entry.order;
                let fill_qty = ask.quantity.min(bid.quantity);
                let trade = Trade {
                    bid_order_id: bid.id,
                    ask_order_id: ask.id,
                    price: bid.price, // maker's price
                    quantity: fill_qty,
                    timestamp: monotonic_nanos(),
                };

                ask.quantity -= fill_qty;
                bid.quantity -= fill_qty;
                if bid.is_filled() {
                    self.order_index.remove(&trade.bid_order_id);
                    level.orders.pop_front();
                    level.head_seq += 1;
                    level.live -= 1;
                }

                self.last_price = trade.price;
                if let Some(cb) = self.trade_callback.as_mut() {
                    cb(&trade);
                }
                self.trade_count += 1;
            }

            if level.live == 0 {
                self.bids.remove(&bid_price);
            }
        }
    }

    /// Highest bid price, or 0.0 when the bid ladder is empty
    pub fn best_bid(&self) -> f64 {
        self.bids.last_key_value().map_or(0.0, |(p, _)| p.0)
    }

    /// Lowest ask price, or 0.0 when the ask ladder is empty
    pub fn best_ask(&self) -> f64 {
        self.asks.first_key_value().map_or(0.0, |(p, _)| p.0)
    }

    pub fn spread(&self) -> f64 {
        let bid = self.best_bid();
        let ask = self.best_ask();
        if bid > 0.0 && ask > 0.0 {
            ask - bid
        } else {
            0.0
        }
    }

    /// Midpoint of the touch when both sides are populated, otherwise the
    /// last traded price (0.0 before any trade)
    pub fn mid_price(&self) -> f64 {
        let bid = self.best_bid();
        let ask = self.best_ask();
        if bid > 0.0 && ask > 0.0 {
            (bid + ask) / 2.0
        } else {
            self.last_price
        }
    }

    pub fn last_price(&self) -> f64 {
        self.last_price
    }

    /// Up to `n` bid levels as (price, aggregated quantity), best first
    pub fn top_bids(&self, n: usize) -> Vec<(f64, f64)> {
        self.bids
            .iter()
            .rev()
            .take(n)
            .map(|(p, level)| (p.0, level.total_quantity()))
            .collect()
    }

    /// Up to `n` ask levels as (price, aggregated quantity), best first
    pub fn top_asks(&self, n: usize) -> Vec<(f64, f64)> {
        self.asks
            .iter()
            .take(n)
            .map(|(p, level)| (p.0, level.total_quantity()))
            .collect()
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }

    /// Number of orders accepted by `add` since construction
    pub fn order_count(&self) -> u64 {
        self.next_order_id - 1
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn set_trade_callback(&mut self, cb: impl FnMut(&Trade) + Send + 'static) {
        self.trade_callback = Some(Box::new(cb));
    }

    /// Drop both ladders, the id index, and the trade counter. The id
    /// allocator keeps counting.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.order_index.clear();
        self.trade_count = 0;
    }
}
