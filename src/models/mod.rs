pub mod candle;
pub mod direction;
pub mod order;
pub mod timeframe;
pub mod zone;

pub use candle::{Candle, CandleSeries};
pub use direction::*;
pub use order::{ActiveOrder, ExitTarget, PartialExit};
pub use timeframe::Timeframe;
pub use zone::{TakeProfitLine, Zone, PRICE_EPSILON};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A normalized trade print from a market-data provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradeEvent {
    pub price: f64,
    pub ts: DateTime<Utc>,
}
