use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::types::{Side, Signal, SignalStatus, SignalType};

pub type SqlitePool = Pool<SqliteConnectionManager>;

/// Owns the `signals` table. Every connection in the pool runs with WAL journaling and a
/// busy timeout, so concurrent ingestion/claim/maintenance tasks never block indefinitely
/// on each other (§5's "single-file transactional databases in WAL mode").
#[derive(Clone)]
pub struct SignalStore {
    pool: SqlitePool,
}

/// Default dedup window: a hash match younger than this is treated as a duplicate even
/// if the (channel, message_id) pair differs (re-posts, edits).
const DUPLICATE_TTL_HOURS: i64 = 2;

impl SignalStore {
    pub fn new(path: &str) -> Result<Self, rusqlite::Error> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
        });
        // A single pooled connection: SQLite serializes writers regardless, and a single
        // connection keeps an `:memory:` database (used in tests) from fragmenting across
        // pool checkouts into unrelated in-memory databases.
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .expect("failed to build sqlite pool");
        let store = SignalStore { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                signal_id INTEGER PRIMARY KEY AUTOINCREMENT,
                received_at TEXT NOT NULL,
                source_channel TEXT NOT NULL,
                source_message_id TEXT NOT NULL,
                normalized_hash TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_mid TEXT NOT NULL,
                entry_low TEXT,
                entry_high TEXT,
                targets TEXT NOT NULL,
                stop_loss TEXT,
                declared_leverage TEXT,
                signal_type TEXT,
                status TEXT NOT NULL,
                re_entry_attempts INTEGER NOT NULL DEFAULT 0,
                UNIQUE(source_channel, source_message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_signals_hash ON signals(normalized_hash, received_at);
            CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status);
            "#,
        )
    }

    /// SHA-256 over lowercased, whitespace-collapsed text, per §4.F step 2.
    pub fn normalize_hash(text: &str) -> String {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(collapsed.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns `true` if this (channel, message_id) already exists, or a hash match exists
    /// within the dedup TTL.
    pub fn is_duplicate(&self, channel: &str, message_id: &str, normalized_hash: &str) -> Result<bool, rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        let by_id: bool = conn
            .query_row(
                "SELECT 1 FROM signals WHERE source_channel=?1 AND source_message_id=?2",
                params![channel, message_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if by_id {
            return Ok(true);
        }
        let cutoff = (Utc::now() - chrono::Duration::hours(DUPLICATE_TTL_HOURS)).to_rfc3339();
        let by_hash: bool = conn
            .query_row(
                "SELECT 1 FROM signals WHERE normalized_hash=?1 AND received_at >= ?2",
                params![normalized_hash, cutoff],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        Ok(by_hash)
    }

    /// Persist a newly detected signal as NEW. Caller has already checked `is_duplicate`.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_new(
        &self,
        channel: &str,
        message_id: &str,
        normalized_hash: &str,
        parsed: &crate::detector::ParsedSignal,
    ) -> Result<i64, rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        let targets_json = serde_json::to_string(&parsed.targets).unwrap();
        conn.execute(
            "INSERT INTO signals (
                received_at, source_channel, source_message_id, normalized_hash,
                symbol, side, entry_mid, entry_low, entry_high, targets, stop_loss,
                declared_leverage, signal_type, status, re_entry_attempts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, 'NEW', 0)",
            params![
                Utc::now().to_rfc3339(),
                channel,
                message_id,
                normalized_hash,
                parsed.symbol,
                parsed.side.as_str(),
                parsed.entry_mid.to_string(),
                parsed.entry_low.to_string(),
                parsed.entry_high.map(|d| d.to_string()),
                targets_json,
                parsed.stop_loss.map(|d| d.to_string()),
                parsed.leverage.map(|d| d.to_string()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomic compare-and-swap claim: moves exactly one NEW signal to CLAIMED and returns
    /// it, or `None` if no NEW signal is available. Safe across a worker pool because the
    /// `UPDATE ... WHERE status='NEW'` only ever affects the row if it is still NEW.
    pub fn claim_next(&self) -> Result<Option<Signal>, rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        let signal_id: Option<i64> = conn
            .query_row(
                "SELECT signal_id FROM signals WHERE status='NEW' ORDER BY signal_id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(signal_id) = signal_id else {
            return Ok(None);
        };
        let affected = conn.execute(
            "UPDATE signals SET status='CLAIMED' WHERE signal_id=?1 AND status='NEW'",
            params![signal_id],
        )?;
        if affected != 1 {
            return Ok(None); // lost the race to another worker
        }
        self.get(signal_id)
    }

    pub fn get(&self, signal_id: i64) -> Result<Option<Signal>, rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.query_row(
            "SELECT signal_id, received_at, source_channel, source_message_id, symbol, side,
                    entry_mid, entry_low, entry_high, targets, stop_loss, declared_leverage,
                    signal_type, status, re_entry_attempts
             FROM signals WHERE signal_id=?1",
            params![signal_id],
            row_to_signal,
        )
        .optional()
    }

    pub fn set_status(&self, signal_id: i64, status: SignalStatus) -> Result<(), rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.execute(
            "UPDATE signals SET status=?1 WHERE signal_id=?2",
            params![status.as_str(), signal_id],
        )?;
        Ok(())
    }

    pub fn revert_to_new(&self, signal_id: i64) -> Result<(), rusqlite::Error> {
        self.set_status(signal_id, SignalStatus::New)
    }

    pub fn increment_re_entry_attempts(&self, signal_id: i64) -> Result<u32, rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.execute(
            "UPDATE signals SET re_entry_attempts = re_entry_attempts + 1 WHERE signal_id=?1",
            params![signal_id],
        )?;
        conn.query_row(
            "SELECT re_entry_attempts FROM signals WHERE signal_id=?1",
            params![signal_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|v| v as u32)
    }

    /// Signals still NEW whose entry order has aged past `hours` with no matching claim.
    pub fn expire_stale(&self, hours: i64) -> Result<Vec<i64>, rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        let cutoff = (Utc::now() - chrono::Duration::hours(hours)).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT signal_id FROM signals WHERE status='NEW' AND received_at < ?1",
        )?;
        let ids: Vec<i64> = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        for id in &ids {
            conn.execute(
                "UPDATE signals SET status='EXPIRED' WHERE signal_id=?1",
                params![id],
            )?;
        }
        Ok(ids)
    }
}

fn row_to_signal(row: &rusqlite::Row) -> rusqlite::Result<Signal> {
    let received_at: String = row.get(1)?;
    let targets_json: String = row.get(9)?;
    let targets: Vec<String> = serde_json::from_str(&targets_json).unwrap_or_default();
    let side_str: String = row.get(5)?;
    Ok(Signal {
        signal_id: row.get(0)?,
        received_at: DateTime::parse_from_rfc3339(&received_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        source_channel: row.get(2)?,
        source_message_id: row.get(3)?,
        symbol: row.get(4)?,
        side: if side_str == "LONG" { Side::Long } else { Side::Short },
        entry_mid: row.get::<_, String>(6)?.parse().unwrap_or_default(),
        entry_low: row.get::<_, Option<String>>(7)?.and_then(|s| s.parse().ok()),
        entry_high: row.get::<_, Option<String>>(8)?.and_then(|s| s.parse().ok()),
        targets: targets.iter().filter_map(|s| s.parse().ok()).collect(),
        stop_loss: row.get::<_, Option<String>>(10)?.and_then(|s| s.parse().ok()),
        declared_leverage: row.get::<_, Option<String>>(11)?.and_then(|s| s.parse().ok()),
        signal_type: row.get::<_, Option<String>>(12)?.map(|s| match s.as_str() {
            "DYNAMIC" => SignalType::Dynamic,
            "FAST" => SignalType::Fast,
            _ => SignalType::Swing,
        }),
        status: SignalStatus::from_str(&row.get::<_, String>(13)?),
        re_entry_attempts: row.get::<_, i64>(14)? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ParsedSignal;
    use rust_decimal_macros::dec;

    fn sample_parsed() -> ParsedSignal {
        ParsedSignal {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_low: dec!(100),
            entry_high: Some(dec!(102)),
            entry_mid: dec!(101),
            targets: vec![dec!(105), dec!(110)],
            stop_loss: Some(dec!(95)),
            leverage: None,
        }
    }

    #[test]
    fn duplicate_by_message_id_is_detected() {
        let store = SignalStore::new(":memory:").unwrap();
        let hash = SignalStore::normalize_hash("hello world");
        store.insert_new("chan1", "msg1", &hash, &sample_parsed()).unwrap();
        assert!(store.is_duplicate("chan1", "msg1", "different-hash").unwrap());
        assert!(!store.is_duplicate("chan1", "msg2", "different-hash").unwrap());
    }

    #[test]
    fn duplicate_by_hash_within_ttl() {
        let store = SignalStore::new(":memory:").unwrap();
        let hash = SignalStore::normalize_hash("Buy  BTC   now");
        store.insert_new("chan1", "msg1", &hash, &sample_parsed()).unwrap();
        let same_hash = SignalStore::normalize_hash("buy btc now");
        assert!(store.is_duplicate("chan2", "msg-different", &same_hash).unwrap());
    }

    #[test]
    fn claim_next_is_exclusive() {
        let store = SignalStore::new(":memory:").unwrap();
        let hash = SignalStore::normalize_hash("text a");
        store.insert_new("c", "1", &hash, &sample_parsed()).unwrap();
        let first = store.claim_next().unwrap();
        assert!(first.is_some());
        let second = store.claim_next().unwrap();
        assert!(second.is_none());
    }
}
