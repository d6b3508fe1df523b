//! Quote engine.
//!
//! Pure function of book top, inventory, open orders, and market
//! parameters to the desired resting quotes for one token. The engine
//! decides per side whether an existing order is close enough to keep;
//! combining the two sides into the token-wide cancel the exchange
//! actually supports is the reconciler's job.
//!
//! Bids join the best bid rounded down to the tick grid. Offers always
//! quote the take-profit price derived from the average entry, never the
//! volatile best ask.

use rust_decimal::Decimal;

use quoter_market::{BookTop, Market, StrategyParameters, TradeConfig};

use crate::position::{Position, TokenOrders};

/// Share sizes are quoted to two decimal places.
const SIZE_DP: u32 = 2;

/// Cancel-and-replace tolerances per side.
#[derive(Debug, Clone)]
pub struct QuoteThresholds {
    pub buy_price_tolerance: Decimal,
    pub buy_size_tolerance: Decimal,
    pub sell_price_tolerance: Decimal,
    pub sell_size_tolerance: Decimal,
}

impl Default for QuoteThresholds {
    fn default() -> Self {
        Self {
            buy_price_tolerance: Decimal::new(15, 3),
            buy_size_tolerance: Decimal::new(25, 2),
            sell_price_tolerance: Decimal::new(5, 2),
            sell_size_tolerance: Decimal::new(30, 2),
        }
    }
}

/// Everything the engine reads for one token.
#[derive(Debug, Clone)]
pub struct QuoteInputs<'a> {
    pub top: BookTop,
    pub position: &'a Position,
    /// Position size held in the complementary token.
    pub reverse_position: Decimal,
    pub orders: &'a TokenOrders,
    pub market: &'a Market,
    pub params: &'a StrategyParameters,
    pub trade: &'a TradeConfig,
    /// Scalar from the external volatility collector.
    pub volatility: Decimal,
    /// Available stablecoin balance.
    pub balance: Decimal,
    /// Market currently paused by the risk-off registry.
    pub risk_off: bool,
    /// Absolute per-token inventory cap, in shares.
    pub hard_cap_shares: Decimal,
    /// Buy prices below this get the per-market size multiplier.
    pub low_price_cutoff: Decimal,
    pub thresholds: &'a QuoteThresholds,
}

/// One desired resting order. Size in shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub price: Decimal,
    pub size: Decimal,
}

/// The engine's verdict for one token.
///
/// `buy`/`sell` are the orders that should be resting after this cycle
/// (whether already resting or still to place). `cancel_*` marks a live
/// order that no longer matches its desired quote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotePlan {
    pub buy: Option<Quote>,
    pub sell: Option<Quote>,
    pub cancel_buy: bool,
    pub cancel_sell: bool,
}

impl QuotePlan {
    /// True when the plan requires no exchange calls at all.
    pub fn is_noop(&self, orders: &TokenOrders) -> bool {
        !self.cancel_buy
            && !self.cancel_sell
            && !(self.buy.is_some() && orders.buy.is_none())
            && !(self.sell.is_some() && orders.sell.is_none())
    }
}

/// Round down onto the tick grid (buys).
pub fn round_down_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).floor() * tick
}

/// Round up onto the tick grid (sells).
pub fn round_up_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).ceil() * tick
}

/// Compute the desired quotes for one token.
pub fn compute_quotes(inputs: &QuoteInputs<'_>) -> QuotePlan {
    let desired_buy = desired_buy(inputs);
    let desired_sell = desired_sell(inputs);

    let cancel_buy = needs_replace(
        inputs.orders.buy.as_ref().map(|o| (o.price, o.size)),
        desired_buy,
        inputs.thresholds.buy_price_tolerance,
        inputs.thresholds.buy_size_tolerance,
    );
    let cancel_sell = needs_replace(
        inputs.orders.sell.as_ref().map(|o| (o.price, o.size)),
        desired_sell,
        inputs.thresholds.sell_price_tolerance,
        inputs.thresholds.sell_size_tolerance,
    );

    QuotePlan {
        buy: desired_buy,
        sell: desired_sell,
        cancel_buy,
        cancel_sell,
    }
}

fn desired_buy(inputs: &QuoteInputs<'_>) -> Option<Quote> {
    let market = inputs.market;
    let trade = inputs.trade;

    if !trade.enabled || inputs.risk_off {
        return None;
    }

    let position_notional = inputs.position.notional();
    if position_notional >= trade.max_size {
        return None;
    }
    if inputs.position.size >= inputs.hard_cap_shares {
        return None;
    }
    // No self-hedging: stay off the bid while the complementary token
    // carries more than dust.
    if inputs.reverse_position > market.min_size {
        return None;
    }
    if inputs.top.spread() > market.max_spread {
        return None;
    }
    if inputs.volatility > inputs.params.volatility_threshold {
        return None;
    }

    let buy_price = round_down_to_tick(inputs.top.best_bid, market.tick_size);
    if buy_price <= Decimal::ZERO {
        return None;
    }

    let headroom = trade.max_size - position_notional;
    let notional = trade.trade_size.min(headroom);
    if notional <= Decimal::ZERO || notional > inputs.balance {
        return None;
    }

    let mut size = notional / buy_price;
    if buy_price < inputs.low_price_cutoff {
        size *= trade.low_price_multiplier;
    }
    let size = size.round_dp_with_strategy(SIZE_DP, rust_decimal::RoundingStrategy::ToZero);
    if size < market.min_size {
        return None;
    }

    Some(Quote {
        price: buy_price,
        size,
    })
}

fn desired_sell(inputs: &QuoteInputs<'_>) -> Option<Quote> {
    let market = inputs.market;
    let avg = inputs.position.avg_price?;
    if inputs.position.size < market.min_size {
        return None;
    }

    let markup = Decimal::ONE + inputs.params.take_profit_threshold / Decimal::ONE_HUNDRED;
    let tp_price = round_up_to_tick(avg * markup, market.tick_size);
    // Outcome prices live in (0, 1); cap a runaway take-profit at the top tick.
    let tp_price = tp_price.min(Decimal::ONE - market.tick_size);
    if tp_price <= Decimal::ZERO {
        return None;
    }

    Some(Quote {
        price: tp_price,
        size: inputs.position.size,
    })
}

/// Whether an existing order is far enough from the desired quote that it
/// must be cancelled. Absent orders never need a cancel; an order with no
/// desired counterpart always does.
fn needs_replace(
    existing: Option<(Decimal, Decimal)>,
    desired: Option<Quote>,
    price_tolerance: Decimal,
    size_tolerance: Decimal,
) -> bool {
    match (existing, desired) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some((price, size)), Some(quote)) => {
            let price_drift = (quote.price - price).abs();
            if price_drift > price_tolerance {
                return true;
            }
            if size > Decimal::ZERO {
                let size_drift = (quote.size - size).abs() / size;
                if size_drift > size_tolerance {
                    return true;
                }
            }
            false
        }
    }
}
