mod common;

use chrono::{NaiveDate, TimeZone, Utc};
use std::sync::{Arc, RwLock};

use flag_trading_bot::config::Config;
use flag_trading_bot::core::aggregator::CandleAggregator;
use flag_trading_bot::core::classifier::{classify, ZoneClassifier};
use flag_trading_bot::core::ema::EmaEngine;
use flag_trading_bot::core::events::FileEventCalendar;
use flag_trading_bot::core::flags::FlagEngine;
use flag_trading_bot::core::zones::{ZoneEngine, ZoneSettings};
use flag_trading_bot::feed::stream::parse_trade_message;
use flag_trading_bot::models::{OptionType, Timeframe, ZoneKind};
use flag_trading_bot::notify::LogNotifier;
use flag_trading_bot::storage;
use flag_trading_bot::strategies::signals::Decision;
use flag_trading_bot::strategies::RuleGate;
use flag_trading_bot::trading::order_manager::EmaView;
use flag_trading_bot::trading::{
    OrderLog, OrderManager, OrderManagerSettings, SessionState, SubmitOutcome, TickOutcome,
};

use common::{call_chain, candles_2m, day_candles_15m, temp_dir, MockBroker};

fn test_config() -> Config {
    let mut cfg = Config::from_env();
    cfg.symbol = "SPY".to_string();
    cfg.account_order_percentage = 0.005;
    cfg.orders_zone_threshold = 2;
    cfg.data_dir = temp_dir("cfg").to_string_lossy().to_string();
    cfg
}

fn manager(cfg: &Config, broker: Arc<MockBroker>) -> Arc<OrderManager> {
    Arc::new(OrderManager::new(
        OrderManagerSettings::from_config(cfg),
        broker,
        Arc::new(LogNotifier::new()),
        SessionState::new(100_000.0, 0.0).shared(),
        Arc::new(RwLock::new(EmaView::default())),
        OrderLog::open(temp_dir("log").join("orders.csv")),
    ))
}

/// Raw provider JSON all the way to EMA samples in candle lockstep.
#[test]
fn trade_prints_roll_into_candles_and_emas() {
    let mut aggregator = CandleAggregator::new(vec![Timeframe::M2], 3);
    let mut ema = EmaEngine::new(Timeframe::M2, vec![13, 48, 200]);
    ema.bootstrap(&[]);

    // a print every 30 seconds for an hour, starting 09:30:01 ET
    let session_open_ms: i64 = Utc
        .with_ymd_and_hms(2025, 3, 14, 13, 30, 1)
        .unwrap()
        .timestamp_millis();
    let mut candles = Vec::new();
    for i in 0..120 {
        let price = 450.0 + ((i as f64) * 0.31).sin();
        let raw = format!(
            r#"{{"type":"trade","price":{:.4},"timestamp":{}}}"#,
            price,
            session_open_ms + i * 30_000
        );
        let event = parse_trade_message(&raw).unwrap().expect("trade event");
        for candle in aggregator.on_trade(event) {
            assert!(candle.is_well_formed());
            ema.on_candle(&candle);
            candles.push(candle);
        }
    }

    assert!(!candles.is_empty());
    assert_eq!(ema.samples().len(), candles.len());
    for (sample, candle) in ema.samples().iter().zip(&candles) {
        assert_eq!(sample.x, candle.seq);
        assert_eq!(sample.values.len(), 3);
    }
}

/// A full signal path: zones from the daily window, arming, flag fit,
/// breakout, rule gate, buy pipeline, first ladder trim.
#[tokio::test]
async fn bullish_flag_breakout_fires_and_trims() {
    let cfg = test_config();

    // one trading day whose extremes seed resistance [449.60, 450.00]
    // and support [448.00, 448.50]
    let mut rows: Vec<(f64, f64, f64, f64)> = (0..26)
        .map(|i| {
            let base = 449.0 + (i as f64 * 0.01);
            (base, base + 0.05, base - 0.05, base + 0.02)
        })
        .collect();
    rows[20] = (449.5, 450.0, 449.4, 449.6);
    rows[21] = (449.60, 449.70, 449.35, 449.40);
    rows[3] = (448.6, 448.7, 448.0, 448.5);
    rows[4] = (448.5, 448.8, 448.3, 448.7);
    let day = day_candles_15m(NaiveDate::from_ymd_opt(2025, 3, 13).unwrap(), &rows);

    let mut zone_engine = ZoneEngine::new(ZoneSettings::from_config(&cfg));
    zone_engine.rebuild(&day);
    let resistance = zone_engine
        .zones()
        .iter()
        .find(|z| z.kind == ZoneKind::Resistance)
        .expect("resistance zone");
    assert!((resistance.important - 450.0).abs() < 1e-9);

    // price breaks over the resistance PDH and consolidates downward
    let flag_candles = candles_2m(
        100,
        &[
            (451.8, 452.10, 451.5, 452.00),
            (451.6, 451.95, 451.3, 451.80),
            (451.3, 451.70, 451.1, 451.50),
            (451.1, 451.40, 450.9, 451.20),
            (451.0, 451.80, 450.9, 451.60), // breakout
        ],
    );

    let mut classifier = ZoneClassifier::new(60);
    let mut flag_engine = FlagEngine::new(cfg.flagpole.clone());
    let mut completed = Vec::new();
    for candle in &flag_candles {
        let update = classifier.on_candle(candle, zone_engine.zones());
        for context in &update.disarmed {
            flag_engine.disarm(context);
        }
        for (context, flag_type) in &update.armed {
            assert_eq!(update.classification, "above resistance_1 PDH");
            flag_engine.arm(context, *flag_type, candle);
        }
        completed.extend(flag_engine.on_candle(candle));
    }
    assert_eq!(completed.len(), 1);
    assert!(completed[0].name.contains("bull_flag_1"));

    // rule gate approves a call (close above the 200 EMA, no events)
    let gate = RuleGate::new();
    let last = flag_candles.last().unwrap();
    let classification = classify(last.close, zone_engine.zones());
    let events = FileEventCalendar::from_events(Vec::new(), 3);
    let now = Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap();
    let decision = gate
        .evaluate(
            &completed,
            last,
            &classification,
            zone_engine.zones(),
            Some(450.5),
            &events,
            now,
            &cfg,
        )
        .await;
    let request = match decision {
        Decision::Fire(req) => req,
        Decision::Refuse(reason) => panic!("refused: {}", reason),
    };
    assert_eq!(request.option_type, OptionType::Call);
    assert_eq!(request.zone_classification, "above resistance_1 PDH");

    // buy pipeline picks the 452 call from the narrow band and sizes it
    let broker = Arc::new(MockBroker::new(call_chain(), 451.6));
    let om = manager(&cfg, broker.clone());
    let outcome = om.submit_buy(&request, now).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Submitted { .. }));
    let order = om.active_order().unwrap();
    assert!((order.strike - 452.0).abs() < 1e-9);
    assert_eq!(order.quantity, 11);

    // first target touch trims the cost-recovery rung
    broker.push_bids(&[0.55]);
    assert_eq!(om.manage_tick(now).await.unwrap(), TickOutcome::Holding);
    let order = om.active_order().unwrap();
    assert_eq!(order.partial_exits.len(), 1);
    assert_eq!(order.partial_exits[0].quantity, 10);
    assert_eq!(order.remaining_quantity(), 1);
}

/// Two simultaneous same-type signals: exactly one position results.
#[tokio::test]
async fn concurrent_same_type_signals_keep_one_position() {
    let cfg = test_config();
    let broker = Arc::new(MockBroker::new(call_chain(), 451.6));
    let om = manager(&cfg, broker.clone());
    let now = Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap();

    let request = flag_trading_bot::strategies::signals::OrderRequest {
        option_type: OptionType::Call,
        tp_price: None,
        zone_classification: "above resistance_1 PDH".to_string(),
        flag_name: "bull_flag_1".to_string(),
    };

    let (a, b) = tokio::join!(om.submit_buy(&request, now), om.submit_buy(&request, now));
    let outcomes = [a.unwrap(), b.unwrap()];
    let submitted = outcomes
        .iter()
        .filter(|o| matches!(o, SubmitOutcome::Submitted { .. }))
        .count();
    let refused = outcomes
        .iter()
        .filter(|o| matches!(o, SubmitOutcome::RefusedSameType))
        .count();
    assert_eq!(submitted, 1);
    assert_eq!(refused, 1);
    assert!(om.has_active_order());

    // only one buy reached the broker
    let buys = broker.submitted().len();
    assert_eq!(buys, 1);
}

/// Directional switch: the active call is fully closed before the put
/// goes out, with no interleaving.
#[tokio::test]
async fn directional_switch_closes_call_then_buys_put() {
    let cfg = test_config();
    let broker = Arc::new(MockBroker::new(call_chain(), 451.6));
    let om = manager(&cfg, broker.clone());
    let now = Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap();

    let call = flag_trading_bot::strategies::signals::OrderRequest {
        option_type: OptionType::Call,
        tp_price: None,
        zone_classification: "above resistance_1 PDH".to_string(),
        flag_name: "bull_flag_1".to_string(),
    };
    let mut put = call.clone();
    put.option_type = OptionType::Put;
    put.flag_name = "bear_flag_1".to_string();

    om.submit_buy(&call, now).await.unwrap();
    let call_qty = om.active_order().unwrap().quantity;
    om.submit_buy(&put, now).await.unwrap();

    let active = om.active_order().unwrap();
    assert_eq!(active.option_type, OptionType::Put);

    let submits = broker.submitted();
    assert_eq!(submits.len(), 3);
    assert_eq!(submits[1].quantity, call_qty, "single sell_rest for the call");
    assert_eq!(
        submits[1].side,
        flag_trading_bot::models::OrderSide::SellToClose
    );
}

/// safe_write survives concurrent readers: a reader sees either the old
/// or the new value, never a torn file.
#[test]
fn safe_write_with_concurrent_readers() {
    let path = temp_dir("writes").join("state.json");
    storage::safe_write_json(&path, &vec![0u64]).unwrap();

    let reader_path = path.clone();
    let reader = std::thread::spawn(move || {
        for _ in 0..200 {
            let value: Vec<u64> = storage::safe_read_json(&reader_path).unwrap();
            assert!(!value.is_empty());
            assert!(value[0] <= 50);
        }
    });

    for i in 1..=50u64 {
        storage::safe_write_json(&path, &vec![i]).unwrap();
    }
    reader.join().unwrap();

    let last: Vec<u64> = storage::safe_read_json(&path).unwrap();
    assert_eq!(last, vec![50]);
}
