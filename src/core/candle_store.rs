use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::models::{Candle, CandleSeries, Timeframe};
use crate::storage;

/// Session-scoped append-only candle log per timeframe, mirrored to JSONL
/// audit files, plus the long-lived compacted 15-minute history used for
/// zone building and EMA bootstrap.
pub struct CandleStore {
    data_dir: PathBuf,
    session: HashMap<Timeframe, CandleSeries>,
}

impl CandleStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            session: HashMap::new(),
        }
    }

    fn session_log_path(&self, tf: Timeframe) -> PathBuf {
        self.data_dir.join(format!("candles_{}.jsonl", tf))
    }

    fn history_path(&self) -> PathBuf {
        self.data_dir.join("history_15m.json")
    }

    /// Append one closed candle. In-memory state is the source of truth;
    /// the JSONL file is an audit artifact.
    pub fn append(&mut self, candle: Candle) -> Result<()> {
        let path = self.session_log_path(candle.timeframe);
        storage::append_jsonl(&path, &candle)?;
        self.session
            .entry(candle.timeframe)
            .or_default()
            .push(candle);
        Ok(())
    }

    pub fn series(&self, tf: Timeframe) -> Option<&CandleSeries> {
        self.session.get(&tf)
    }

    pub fn session_len(&self, tf: Timeframe) -> usize {
        self.session.get(&tf).map(|s| s.len()).unwrap_or(0)
    }

    pub fn last(&self, tf: Timeframe) -> Option<&Candle> {
        self.session.get(&tf).and_then(|s| s.last())
    }

    /// Long-lived 15-minute history, oldest first.
    pub fn load_history(&self) -> CandleSeries {
        let candles: Vec<Candle> =
            storage::safe_read_json(&self.history_path()).unwrap_or_default();
        CandleSeries::new(candles)
    }

    /// Merge authoritative 15-minute candles into the long-lived store,
    /// keyed by timestamp. Existing rows win; duplicates are dropped.
    pub fn append_history(&self, incoming: &[Candle]) -> Result<usize> {
        let mut history: Vec<Candle> =
            storage::safe_read_json(&self.history_path()).unwrap_or_default();
        let mut known: std::collections::HashSet<i64> =
            history.iter().map(|c| c.open_ts.timestamp()).collect();

        let mut added = 0;
        for candle in incoming {
            if known.insert(candle.open_ts.timestamp()) {
                history.push(candle.clone());
                added += 1;
            }
        }
        history.sort_by_key(|c| c.open_ts);
        storage::safe_write_json(&self.history_path(), &history)?;
        if added > 0 {
            info!("history store: +{} candles ({} total)", added, history.len());
        }
        Ok(added)
    }

    /// Clear session state and delete the per-timeframe JSONL logs.
    /// The history store is retained. Idempotent.
    pub fn reset_session(&mut self) -> Result<()> {
        self.session.clear();
        for tf in [Timeframe::M2, Timeframe::M5, Timeframe::M15] {
            storage::remove_if_exists(&self.session_log_path(tf))?;
        }
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_candles;

    fn store() -> CandleStore {
        let dir = std::env::temp_dir().join(format!(
            "flag_bot_store_test_{}_{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        CandleStore::new(dir)
    }

    #[test]
    fn append_grows_session_and_audit_log() {
        let mut s = store();
        let candles = make_candles(&[
            (450.0, 450.5, 449.0, 450.2),
            (450.2, 452.0, 450.0, 451.5),
        ]);
        for c in &candles {
            s.append(c.clone()).unwrap();
        }
        assert_eq!(s.session_len(Timeframe::M2), 2);

        let rows: Vec<Candle> =
            storage::read_jsonl(&s.session_log_path(Timeframe::M2)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].seq, 1);
    }

    #[test]
    fn history_dedupes_by_timestamp() {
        let s = store();
        let batch = make_candles(&[
            (450.0, 450.5, 449.0, 450.2),
            (450.2, 452.0, 450.0, 451.5),
        ]);
        assert_eq!(s.append_history(batch.as_slice()).unwrap(), 2);
        // second write of the same candles adds nothing
        assert_eq!(s.append_history(batch.as_slice()).unwrap(), 0);
        assert_eq!(s.load_history().len(), 2);
    }

    #[test]
    fn reset_session_keeps_history() {
        let mut s = store();
        let candles = make_candles(&[(450.0, 450.5, 449.0, 450.2)]);
        s.append(candles[0].clone()).unwrap();
        s.append_history(candles.as_slice()).unwrap();

        s.reset_session().unwrap();
        s.reset_session().unwrap(); // idempotent
        assert_eq!(s.session_len(Timeframe::M2), 0);
        assert_eq!(s.load_history().len(), 1);
    }
}
