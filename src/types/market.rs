use serde::{Deserialize, Serialize};

/// A single timestamped price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub quote: f64,
    pub epoch: i64,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub bid: Option<f64>,
}

/// OHLC candle from the broker's history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub epoch: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Latest price state for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolQuote {
    pub symbol: String,
    pub last_price: f64,
    pub previous_price: Option<f64>,
    /// Percent change from the previous tick.
    pub change_pct: f64,
    pub epoch: i64,
}

impl SymbolQuote {
    pub fn first(tick: &Tick) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            last_price: tick.quote,
            previous_price: None,
            change_pct: 0.0,
            epoch: tick.epoch,
        }
    }

    pub fn advance(&mut self, tick: &Tick) {
        let previous = self.last_price;
        self.previous_price = Some(previous);
        self.last_price = tick.quote;
        self.change_pct = if previous != 0.0 {
            (tick.quote - previous) / previous * 100.0
        } else {
            0.0
        };
        self.epoch = tick.epoch;
    }
}

/// Comparison used by a price alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    Above,
    Below,
    CrossesAbove,
    CrossesBelow,
}

/// A user-defined price trigger on one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceAlert {
    pub id: String,
    pub symbol: String,
    pub condition: AlertCondition,
    pub target: f64,
    pub active: bool,
    pub triggered_at: Option<i64>,
    pub triggered_price: Option<f64>,
}

impl PriceAlert {
    pub fn new(symbol: &str, condition: AlertCondition, target: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            condition,
            target,
            active: true,
            triggered_at: None,
            triggered_price: None,
        }
    }

    /// Test the alert against a new price. Fires at most once.
    pub fn evaluate(&mut self, previous: Option<f64>, price: f64, epoch: i64) -> bool {
        if !self.active {
            return false;
        }

        let fired = match self.condition {
            AlertCondition::Above => price > self.target,
            AlertCondition::Below => price < self.target,
            AlertCondition::CrossesAbove => {
                matches!(previous, Some(prev) if prev < self.target && price >= self.target)
            }
            AlertCondition::CrossesBelow => {
                matches!(previous, Some(prev) if prev > self.target && price <= self.target)
            }
        };

        if fired {
            self.active = false;
            self.triggered_at = Some(epoch);
            self.triggered_price = Some(price);
        }
        fired
    }
}

/// Trend classification from moving-average structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Bullish,
    Bearish,
    Sideways,
}

/// Latest MACD reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Price levels found by the local-extremum scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupportResistance {
    pub support: Vec<f64>,
    pub resistance: Vec<f64>,
}

/// Composite technical read of one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketAnalysis {
    pub symbol: String,
    pub price: f64,
    pub trend: Trend,
    pub sma20: Option<f64>,
    pub sma50: Option<f64>,
    pub rsi: f64,
    pub macd: Option<MacdValue>,
    /// 10-bar rate of change, percent.
    pub momentum: f64,
    /// Standard deviation of 1-bar returns, percent.
    pub volatility: f64,
    pub levels: SupportResistance,
    pub timestamp: i64,
}
