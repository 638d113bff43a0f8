use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::US::Eastern;

use crate::config::{BrokerConfig, Config, FlagpoleCriteria, PriceBand, ProviderConfig, StopLossRule};
use crate::models::{Candle, CandleSeries, Timeframe};

/// 2M candles from (open, high, low, close) rows, 2-minute spacing from
/// 09:30 ET on 2025-03-14, seq = row index.
pub fn make_candles(rows: &[(f64, f64, f64, f64)]) -> CandleSeries {
    CandleSeries::new(make_candles_with_seq(0, rows))
}

/// Like `make_candles` but seq (and the matching time offset) starts at
/// `start_seq`, for tests that index from an arbitrary candle.
pub fn make_candles_with_seq(start_seq: u64, rows: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
    let base: DateTime<Utc> = Utc.with_ymd_and_hms(2025, 3, 14, 13, 30, 0).unwrap();
    rows.iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| {
            let seq = start_seq + i as u64;
            Candle {
                timeframe: Timeframe::M2,
                open_ts: base + chrono::Duration::minutes(2 * seq as i64),
                open: o,
                high: h,
                low: l,
                close: c,
                volume: 100.0,
                seq,
            }
        })
        .collect()
}

/// 15M candles on the given Eastern-time date, starting at 09:30 ET.
pub fn make_day_candles(date: NaiveDate, rows: &[(f64, f64, f64, f64)]) -> CandleSeries {
    let open = Eastern
        .from_local_datetime(&date.and_time(NaiveTime::from_hms_opt(9, 30, 0).unwrap()))
        .single()
        .expect("unambiguous eastern time")
        .with_timezone(&Utc);
    let candles: Vec<Candle> = rows
        .iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| Candle {
            timeframe: Timeframe::M15,
            open_ts: open + chrono::Duration::minutes(15 * i as i64),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1000.0,
            seq: i as u64,
        })
        .collect();
    CandleSeries::new(candles)
}

pub fn make_candles_at(date: NaiveDate, rows: &[(f64, f64, f64, f64)]) -> CandleSeries {
    make_day_candles(date, rows)
}

/// A Config for tests: paper mode, no credentials, temp dirs.
pub fn default_test_config() -> Config {
    let tmp = std::env::temp_dir()
        .join(format!("flag_bot_test_{}", std::process::id()))
        .to_string_lossy()
        .to_string();
    Config {
        symbol: "SPY".to_string(),
        timeframes: vec![Timeframe::M2, Timeframe::M5, Timeframe::M15],
        real_money_activated: false,
        account_balances: (100_000.0, 0.0),
        account_order_percentage: 0.005,
        num_out_of_money: 3,
        quantity_cap: 30,
        per_contract_fee: 0.65,
        order_cost_buffer: 5.0,
        price_bands: vec![
            PriceBand { low: 0.30, high: 0.50 },
            PriceBand { low: 0.20, high: 0.80 },
            PriceBand { low: 0.10, high: 1.25 },
        ],
        option_expiration_dte: "0dtE".to_string(),
        stop_loss: StopLossRule::EmaBreak(13),
        take_profit_percentages: vec![20.0, 40.0, 80.0, 160.0],
        candle_buffer_secs: 3,
        past_days: 4,
        get_pdhl: true,
        zone_size_thresholds: (0.20, 1.00),
        zone_spacing: 0.30,
        tpl_threshold: 0.25,
        remove_tps_too_close: true,
        flagpole: FlagpoleCriteria {
            min_num_candles: 3,
            max_num_candles: 20,
            min_angle: 5.0,
            max_angle: 80.0,
        },
        emas: vec![
            (13, "#2962ff".to_string()),
            (48, "#9c27b0".to_string()),
            (200, "#000000".to_string()),
        ],
        orders_zone_threshold: 2,
        mins_before_news_cancelation: 20,
        primary_provider: ProviderConfig {
            ws_url: "wss://stream.primary-feed.example/v1".to_string(),
            token_url: "https://api.primary-feed.example/v1/session".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
        },
        secondary_provider: ProviderConfig {
            ws_url: "wss://stream.secondary-feed.example/ws".to_string(),
            token_url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
        },
        broker: BrokerConfig {
            live_url: "https://api.broker.example/v1".to_string(),
            sandbox_url: "https://sandbox.broker.example/v1".to_string(),
            api_token: String::new(),
            account_id: "test".to_string(),
        },
        historical_base_url: "https://api.historical-data.example/v2".to_string(),
        historical_api_key: String::new(),
        retry_attempts: 5,
        backoff_factor: 1.5,
        retry_interval_secs: 5,
        retry_count: 3,
        webhook_url: String::new(),
        events_file: format!("{}/economic_events.json", tmp),
        data_dir: tmp.clone(),
        log_dir: format!("{}/logs", tmp),
        log_level: "ERROR".to_string(),
    }
}
