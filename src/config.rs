use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::Timeframe;

pub type SharedConfig = Arc<RwLock<Config>>;

/// Stop-loss rule parsed from `STOP_LOSS_PERCENTAGE`. Accepts a bare
/// number (`-25`), `"EMA 13"`, or the pair form `["EMA 13", -40]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopLossRule {
    Percent(f64),
    EmaBreak(u32),
    Both(u32, f64),
}

impl StopLossRule {
    pub fn parse(raw: &str) -> Option<StopLossRule> {
        let raw = raw.trim();
        if let Ok(p) = raw.parse::<f64>() {
            return Some(StopLossRule::Percent(p));
        }
        if let Some(period) = parse_ema_spec(raw) {
            return Some(StopLossRule::EmaBreak(period));
        }
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(raw) {
            if items.len() == 2 {
                let period = items[0].as_str().and_then(parse_ema_spec)?;
                let pct = items[1].as_f64()?;
                return Some(StopLossRule::Both(period, pct));
            }
        }
        None
    }
}

fn parse_ema_spec(s: &str) -> Option<u32> {
    let rest = s.trim().trim_matches('"').strip_prefix("EMA ")?;
    rest.trim().parse().ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagpoleCriteria {
    pub min_num_candles: usize,
    pub max_num_candles: usize,
    pub min_angle: f64,
    pub max_angle: f64,
}

/// Ask price bands tried in order (narrow to wide) during strike selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceBand {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub ws_url: String,
    pub token_url: String,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub live_url: String,
    pub sandbox_url: String,
    pub api_token: String,
    pub account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Instrument
    pub symbol: String,
    pub timeframes: Vec<Timeframe>,

    // Money
    pub real_money_activated: bool,
    pub account_balances: (f64, f64),
    pub account_order_percentage: f64,
    pub num_out_of_money: usize,
    pub quantity_cap: u32,
    pub per_contract_fee: f64,
    pub order_cost_buffer: f64,
    pub price_bands: Vec<PriceBand>,
    pub option_expiration_dte: String,

    // Exits
    pub stop_loss: StopLossRule,
    pub take_profit_percentages: Vec<f64>,

    // Candles
    pub candle_buffer_secs: i64,

    // Zones
    pub past_days: usize,
    pub get_pdhl: bool,
    pub zone_size_thresholds: (f64, f64),
    pub zone_spacing: f64,
    pub tpl_threshold: f64,
    pub remove_tps_too_close: bool,

    // Flags
    pub flagpole: FlagpoleCriteria,

    // EMAs: (period, chart color)
    pub emas: Vec<(u32, String)>,

    // Rules
    pub orders_zone_threshold: u32,
    pub mins_before_news_cancelation: i64,

    // Feed / broker plumbing
    pub primary_provider: ProviderConfig,
    pub secondary_provider: ProviderConfig,
    pub broker: BrokerConfig,
    pub historical_base_url: String,
    pub historical_api_key: String,
    pub retry_attempts: u32,
    pub backoff_factor: f64,
    pub retry_interval_secs: u64,
    pub retry_count: u32,

    // Side channels
    pub webhook_url: String,
    pub events_file: String,

    // Paths & logging
    pub data_dir: String,
    pub log_dir: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let env = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };

        let timeframes: Vec<Timeframe> = env("TIMEFRAMES", "2M,5M,15M")
            .split(',')
            .filter_map(Timeframe::from_str_loose)
            .collect();

        let take_profit_percentages: Vec<f64> = env("TAKE_PROFIT_PERCENTAGES", "20,40,80,160")
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        let balances: Vec<f64> = env("ACCOUNT_BALANCES", "100000,0")
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        let account_balances = (
            balances.first().copied().unwrap_or(100_000.0),
            balances.get(1).copied().unwrap_or(0.0),
        );

        let thresholds: Vec<f64> = env("ZONE_SIZE_THRESHOLDS", "0.20,1.00")
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        let zone_size_thresholds = (
            thresholds.first().copied().unwrap_or(0.20),
            thresholds.get(1).copied().unwrap_or(1.00),
        );

        let emas: Vec<(u32, String)> = env("EMAS", "13:#2962ff,48:#9c27b0,200:#000000")
            .split(',')
            .filter_map(|pair| {
                let (period, color) = pair.split_once(':')?;
                Some((period.trim().parse().ok()?, color.trim().to_string()))
            })
            .collect();

        let price_bands: Vec<PriceBand> = env("PRICE_BANDS", "0.30-0.50,0.20-0.80,0.10-1.25")
            .split(',')
            .filter_map(|band| {
                let (lo, hi) = band.split_once('-')?;
                Some(PriceBand {
                    low: lo.trim().parse().ok()?,
                    high: hi.trim().parse().ok()?,
                })
            })
            .collect();

        let stop_loss = StopLossRule::parse(&env("STOP_LOSS_PERCENTAGE", "EMA 13"))
            .unwrap_or(StopLossRule::EmaBreak(13));

        Config {
            symbol: env("SYMBOL", "SPY"),
            timeframes,
            real_money_activated: env("REAL_MONEY_ACTIVATED", "false").to_lowercase() == "true",
            account_balances,
            account_order_percentage: env("ACCOUNT_ORDER_PERCENTAGE", "0.05")
                .parse()
                .unwrap_or(0.05),
            num_out_of_money: env("NUM_OUT_OF_MONEY", "3").parse().unwrap_or(3),
            quantity_cap: env("QUANTITY_CAP", "30").parse().unwrap_or(30),
            per_contract_fee: env("PER_CONTRACT_FEE", "0.65").parse().unwrap_or(0.65),
            order_cost_buffer: env("ORDER_COST_BUFFER", "5.0").parse().unwrap_or(5.0),
            price_bands,
            option_expiration_dte: env("OPTION_EXPIRATION_DTE", "0dtE"),
            stop_loss,
            take_profit_percentages,
            candle_buffer_secs: env("CANDLE_BUFFER", "3").parse().unwrap_or(3),
            past_days: env("PAST_DAYS", "4").parse().unwrap_or(4),
            get_pdhl: env("GET_PDHL", "true").to_lowercase() == "true",
            zone_size_thresholds,
            zone_spacing: env("ZONE_SPACING", "0.30").parse().unwrap_or(0.30),
            tpl_threshold: env("TPL_THRESHOLD", "0.25").parse().unwrap_or(0.25),
            remove_tps_too_close: env("REMOVE_TPS_TOO_CLOSE", "true").to_lowercase() == "true",
            flagpole: FlagpoleCriteria {
                min_num_candles: env("FLAGPOLE_MIN_NUM_CANDLES", "3").parse().unwrap_or(3),
                max_num_candles: env("FLAGPOLE_MAX_NUM_CANDLES", "20").parse().unwrap_or(20),
                min_angle: env("FLAGPOLE_MIN_ANGLE", "5").parse().unwrap_or(5.0),
                max_angle: env("FLAGPOLE_MAX_ANGLE", "80").parse().unwrap_or(80.0),
            },
            emas,
            orders_zone_threshold: env("ORDERS_ZONE_THRESHOLD", "2").parse().unwrap_or(2),
            mins_before_news_cancelation: env("MINS_BEFORE_MAJOR_NEWS_ORDER_CANCELATION", "20")
                .parse()
                .unwrap_or(20),
            primary_provider: ProviderConfig {
                ws_url: env("PRIMARY_WS_URL", "wss://stream.primary-feed.example/v1"),
                token_url: env(
                    "PRIMARY_TOKEN_URL",
                    "https://api.primary-feed.example/v1/session",
                ),
                api_key: env("PRIMARY_API_KEY", ""),
                api_secret: env("PRIMARY_API_SECRET", "").replace("\\n", "\n"),
            },
            secondary_provider: ProviderConfig {
                ws_url: env("SECONDARY_WS_URL", "wss://stream.secondary-feed.example/ws"),
                token_url: String::new(),
                api_key: env("SECONDARY_API_KEY", ""),
                api_secret: String::new(),
            },
            broker: BrokerConfig {
                live_url: env("BROKER_LIVE_URL", "https://api.broker.example/v1"),
                sandbox_url: env("BROKER_SANDBOX_URL", "https://sandbox.broker.example/v1"),
                api_token: env("BROKER_API_TOKEN", ""),
                account_id: env("BROKER_ACCOUNT_ID", ""),
            },
            historical_base_url: env(
                "HISTORICAL_BASE_URL",
                "https://api.historical-data.example/v2",
            ),
            historical_api_key: env("HISTORICAL_API_KEY", ""),
            retry_attempts: env("RETRY_ATTEMPTS", "5").parse().unwrap_or(5),
            backoff_factor: env("BACKOFF_FACTOR", "1.5").parse().unwrap_or(1.5),
            retry_interval_secs: env("RETRY_INTERVAL", "5").parse().unwrap_or(5),
            retry_count: env("RETRY_COUNT", "3").parse().unwrap_or(3),
            webhook_url: env("WEBHOOK_URL", ""),
            events_file: env("EVENTS_FILE", "data/economic_events.json"),
            data_dir: env("DATA_DIR", "data"),
            log_dir: env("LOG_DIR", "logs"),
            log_level: env("LOG_LEVEL", "INFO"),
        }
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    pub fn ema_periods(&self) -> Vec<u32> {
        self.emas.iter().map(|(p, _)| *p).collect()
    }

    /// Days-to-expiration from the `"NdtE"` form; None for "not specified".
    pub fn expiration_dte(&self) -> Option<u32> {
        let raw = self.option_expiration_dte.trim();
        if raw.eq_ignore_ascii_case("not specified") {
            return None;
        }
        raw.to_lowercase()
            .strip_suffix("dte")
            .and_then(|n| n.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_loss_rule_forms() {
        assert_eq!(StopLossRule::parse("-25"), Some(StopLossRule::Percent(-25.0)));
        assert_eq!(StopLossRule::parse("EMA 13"), Some(StopLossRule::EmaBreak(13)));
        assert_eq!(
            StopLossRule::parse(r#"["EMA 13", -40]"#),
            Some(StopLossRule::Both(13, -40.0))
        );
        assert_eq!(StopLossRule::parse("nonsense"), None);
    }

    #[test]
    fn dte_parsing() {
        let mut cfg = crate::test_helpers::default_test_config();
        cfg.option_expiration_dte = "0dtE".to_string();
        assert_eq!(cfg.expiration_dte(), Some(0));
        cfg.option_expiration_dte = "2dtE".to_string();
        assert_eq!(cfg.expiration_dte(), Some(2));
        cfg.option_expiration_dte = "not specified".to_string();
        assert_eq!(cfg.expiration_dte(), None);
    }

    #[test]
    fn ema_periods_from_pairs() {
        let cfg = crate::test_helpers::default_test_config();
        assert_eq!(cfg.ema_periods(), vec![13, 48, 200]);
    }
}
