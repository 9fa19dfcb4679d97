use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rust_decimal::Decimal;
use rusqlite::{params, OptionalExtension};

use crate::types::{
    HedgeInfo, Position, PositionState, PyramidState, Side,
};

pub type SqlitePool = Pool<SqliteConnectionManager>;

/// Owns the `positions` and `order_tracker` tables.
#[derive(Clone)]
pub struct LifecycleStore {
    pool: SqlitePool,
}

impl LifecycleStore {
    pub fn new(path: &str) -> Result<Self, rusqlite::Error> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
        });
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .expect("failed to build sqlite pool");
        let store = LifecycleStore { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                position_id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                planned_qty TEXT NOT NULL,
                filled_qty TEXT NOT NULL,
                avg_entry_price TEXT NOT NULL,
                leverage TEXT NOT NULL,
                initial_margin_plan TEXT NOT NULL,
                sl_price TEXT NOT NULL,
                tp_prices TEXT NOT NULL,
                tp_order_ids TEXT NOT NULL,
                sl_order_id TEXT,
                entry_order_ids TEXT NOT NULL,
                replacement_order_id TEXT,
                state TEXT NOT NULL,
                pyramid_state TEXT NOT NULL,
                hedge_state TEXT NOT NULL,
                original_entry_price TEXT,
                highest_favorable_price TEXT,
                last_trailing_update TEXT,
                tp2_breakeven_applied INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_state ON positions(state);
            CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions(symbol);

            CREATE TABLE IF NOT EXISTS order_tracker (
                order_id TEXT PRIMARY KEY,
                position_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                placed_at TEXT NOT NULL,
                last_seen_status TEXT NOT NULL,
                FOREIGN KEY(position_id) REFERENCES positions(position_id)
            );
            CREATE INDEX IF NOT EXISTS idx_order_tracker_position ON order_tracker(position_id);
            "#,
        )
    }

    pub fn create_pending(
        &self,
        signal_id: i64,
        symbol: &str,
        side: Side,
        planned_qty: Decimal,
        leverage: Decimal,
        initial_margin_plan: Decimal,
        sl_price: Decimal,
        tp_prices: &[Decimal],
        entry_order_ids: &[String],
    ) -> Result<i64, rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO positions (
                signal_id, symbol, side, planned_qty, filled_qty, avg_entry_price, leverage,
                initial_margin_plan, sl_price, tp_prices, tp_order_ids, sl_order_id,
                entry_order_ids, replacement_order_id, state, pyramid_state, hedge_state,
                original_entry_price, highest_favorable_price, last_trailing_update,
                tp2_breakeven_applied, created_at, updated_at
            ) VALUES (?1,?2,?3,?4,'0','0',?5,?6,?7,?8,'[]',NULL,?9,NULL,'PENDING_ENTRY','{\"executed_scales\":[]}','none',NULL,NULL,NULL,0,?10,?10)",
            params![
                signal_id,
                symbol,
                side.as_str(),
                planned_qty.to_string(),
                leverage.to_string(),
                initial_margin_plan.to_string(),
                sl_price.to_string(),
                serde_json::to_string(&tp_prices.iter().map(|d| d.to_string()).collect::<Vec<_>>()).unwrap(),
                serde_json::to_string(entry_order_ids).unwrap(),
                now,
            ],
        )?;
        let position_id = conn.last_insert_rowid();
        for order_id in entry_order_ids {
            register_order(&conn, order_id, position_id, "entry_a")?;
        }
        Ok(position_id)
    }

    pub fn get(&self, position_id: i64) -> Result<Option<Position>, rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.query_row(
            "SELECT position_id, signal_id, symbol, side, planned_qty, filled_qty,
                    avg_entry_price, leverage, initial_margin_plan, sl_price, tp_prices,
                    tp_order_ids, sl_order_id, entry_order_ids, replacement_order_id, state,
                    pyramid_state, hedge_state, original_entry_price, highest_favorable_price,
                    last_trailing_update, tp2_breakeven_applied, created_at, updated_at
             FROM positions WHERE position_id=?1",
            params![position_id],
            row_to_position,
        )
        .optional()
    }

    pub fn open_positions(&self) -> Result<Vec<Position>, rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        let mut stmt = conn.prepare(
            "SELECT position_id, signal_id, symbol, side, planned_qty, filled_qty,
                    avg_entry_price, leverage, initial_margin_plan, sl_price, tp_prices,
                    tp_order_ids, sl_order_id, entry_order_ids, replacement_order_id, state,
                    pyramid_state, hedge_state, original_entry_price, highest_favorable_price,
                    last_trailing_update, tp2_breakeven_applied, created_at, updated_at
             FROM positions WHERE state IN ('PENDING_ENTRY', 'PARTIAL', 'OPEN', 'CLOSING')",
        )?;
        let rows = stmt.query_map([], row_to_position)?;
        rows.collect()
    }

    /// Positions currently tracking a live hedge, regardless of the primary's own state —
    /// a primary that already hit its stop is CLOSED and drops out of `open_positions`, but
    /// its hedge still needs polling through to resolution.
    pub fn hedged_positions(&self) -> Result<Vec<Position>, rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        let mut stmt = conn.prepare(
            "SELECT position_id, signal_id, symbol, side, planned_qty, filled_qty,
                    avg_entry_price, leverage, initial_margin_plan, sl_price, tp_prices,
                    tp_order_ids, sl_order_id, entry_order_ids, replacement_order_id, state,
                    pyramid_state, hedge_state, original_entry_price, highest_favorable_price,
                    last_trailing_update, tp2_breakeven_applied, created_at, updated_at
             FROM positions WHERE hedge_state LIKE '%\"state\":\"HEDGED\"%'",
        )?;
        let rows = stmt.query_map([], row_to_position)?;
        rows.collect()
    }

    /// Count of positions that still occupy exchange capacity (everything not terminal).
    pub fn active_count(&self) -> Result<u32, rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE state NOT IN ('CLOSED','CANCELLED','FAILED')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn set_state(&self, position_id: i64, from: PositionState, to: PositionState) -> Result<bool, rusqlite::Error> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let conn = self.pool.get().expect("pool exhausted");
        let affected = conn.execute(
            "UPDATE positions SET state=?1, updated_at=?2 WHERE position_id=?3 AND state=?4",
            params![to.as_str(), Utc::now().to_rfc3339(), position_id, from.as_str()],
        )?;
        Ok(affected == 1)
    }

    pub fn record_fill(
        &self,
        position_id: i64,
        filled_qty: Decimal,
        avg_entry_price: Decimal,
        original_entry_price: Option<Decimal>,
        replacement_order_id: Option<&str>,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.execute(
            "UPDATE positions SET filled_qty=?1, avg_entry_price=?2,
                original_entry_price = COALESCE(original_entry_price, ?3),
                replacement_order_id = ?4, updated_at=?5
             WHERE position_id=?6",
            params![
                filled_qty.to_string(),
                avg_entry_price.to_string(),
                original_entry_price.map(|d| d.to_string()),
                replacement_order_id,
                Utc::now().to_rfc3339(),
                position_id,
            ],
        )?;
        Ok(())
    }

    pub fn attach_tp_sl(
        &self,
        position_id: i64,
        tp_order_ids: &[String],
        sl_order_id: &str,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.execute(
            "UPDATE positions SET tp_order_ids=?1, sl_order_id=?2, updated_at=?3 WHERE position_id=?4",
            params![
                serde_json::to_string(tp_order_ids).unwrap(),
                sl_order_id,
                Utc::now().to_rfc3339(),
                position_id,
            ],
        )?;
        for tp in tp_order_ids {
            register_order(&conn, tp, position_id, "tp")?;
        }
        register_order(&conn, sl_order_id, position_id, "sl")?;
        Ok(())
    }

    pub fn update_sl_price(&self, position_id: i64, sl_price: Decimal, highest_favorable: Decimal) -> Result<(), rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.execute(
            "UPDATE positions SET sl_price=?1, highest_favorable_price=?2, last_trailing_update=?3, updated_at=?3
             WHERE position_id=?4",
            params![sl_price.to_string(), highest_favorable.to_string(), Utc::now().to_rfc3339(), position_id],
        )?;
        Ok(())
    }

    pub fn apply_tp2_breakeven(&self, position_id: i64, sl_price: Decimal) -> Result<(), rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.execute(
            "UPDATE positions SET sl_price=?1, tp2_breakeven_applied=1, updated_at=?2 WHERE position_id=?3",
            params![sl_price.to_string(), Utc::now().to_rfc3339(), position_id],
        )?;
        Ok(())
    }

    pub fn record_pyramid_scale(&self, position_id: i64, pyramid_state: &PyramidState) -> Result<(), rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.execute(
            "UPDATE positions SET pyramid_state=?1, updated_at=?2 WHERE position_id=?3",
            params![serde_json::to_string(pyramid_state).unwrap(), Utc::now().to_rfc3339(), position_id],
        )?;
        Ok(())
    }

    pub fn record_hedge(&self, position_id: i64, hedge: &HedgeInfo) -> Result<(), rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.execute(
            "UPDATE positions SET hedge_state=?1, updated_at=?2 WHERE position_id=?3",
            params![serde_json::to_string(hedge).unwrap(), Utc::now().to_rfc3339(), position_id],
        )?;
        Ok(())
    }

    pub fn register_order(&self, order_id: &str, position_id: i64, role: &str) -> Result<(), rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        register_order(&conn, order_id, position_id, role)
    }

    pub fn update_order_status(&self, order_id: &str, status: &str) -> Result<(), rusqlite::Error> {
        let conn = self.pool.get().expect("pool exhausted");
        conn.execute(
            "UPDATE order_tracker SET last_seen_status=?1 WHERE order_id=?2",
            params![status, order_id],
        )?;
        Ok(())
    }
}

fn register_order(conn: &rusqlite::Connection, order_id: &str, position_id: i64, role: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO order_tracker (order_id, position_id, role, placed_at, last_seen_status)
         VALUES (?1, ?2, ?3, ?4, 'New')",
        params![order_id, position_id, role, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
    let side_str: String = row.get(3)?;
    let tp_prices_json: String = row.get(10)?;
    let tp_prices: Vec<String> = serde_json::from_str(&tp_prices_json).unwrap_or_default();
    let tp_order_ids_json: String = row.get(11)?;
    let tp_order_ids: Vec<String> = serde_json::from_str(&tp_order_ids_json).unwrap_or_default();
    let entry_order_ids_json: String = row.get(13)?;
    let entry_order_ids: Vec<String> = serde_json::from_str(&entry_order_ids_json).unwrap_or_default();
    let pyramid_json: String = row.get(16)?;
    let pyramid_state: PyramidState = serde_json::from_str(&pyramid_json).unwrap_or_default();
    let hedge_json: String = row.get(17)?;
    let hedge: HedgeInfo = serde_json::from_str(&hedge_json).unwrap_or_default();

    Ok(Position {
        position_id: row.get(0)?,
        signal_id: row.get(1)?,
        symbol: row.get(2)?,
        side: if side_str == "LONG" { Side::Long } else { Side::Short },
        planned_qty: row.get::<_, String>(4)?.parse().unwrap_or_default(),
        filled_qty: row.get::<_, String>(5)?.parse().unwrap_or_default(),
        avg_entry_price: row.get::<_, String>(6)?.parse().unwrap_or_default(),
        leverage: row.get::<_, String>(7)?.parse().unwrap_or_default(),
        initial_margin_plan: row.get::<_, String>(8)?.parse().unwrap_or_default(),
        sl_price: row.get::<_, String>(9)?.parse().unwrap_or_default(),
        tp_prices: tp_prices.iter().filter_map(|s| s.parse().ok()).collect(),
        tp_order_ids,
        sl_order_id: row.get(12)?,
        entry_order_ids,
        replacement_order_id: row.get(14)?,
        state: PositionState::from_str(&row.get::<_, String>(15)?),
        pyramid_state,
        hedge,
        original_entry_price: row.get::<_, Option<String>>(18)?.and_then(|s| s.parse().ok()),
        highest_favorable_price: row.get::<_, Option<String>>(19)?.and_then(|s| s.parse().ok()),
        last_trailing_update: row.get::<_, Option<String>>(20)?.map(|s| parse_dt(&s)),
        tp2_breakeven_applied: row.get::<_, i64>(21)? != 0,
        created_at: parse_dt(&row.get::<_, String>(22)?),
        updated_at: parse_dt(&row.get::<_, String>(23)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn create_and_fetch_pending_position() {
        let store = LifecycleStore::new(":memory:").unwrap();
        let id = store
            .create_pending(
                1,
                "BTCUSDT",
                Side::Long,
                dec!(1.0),
                dec!(10),
                dec!(20),
                dec!(95),
                &[dec!(105), dec!(110)],
                &["order-a".into(), "order-b".into()],
            )
            .unwrap();
        let pos = store.get(id).unwrap().unwrap();
        assert_eq!(pos.state, PositionState::PendingEntry);
        assert_eq!(pos.entry_order_ids.len(), 2);
    }

    #[test]
    fn original_entry_price_is_set_once() {
        let store = LifecycleStore::new(":memory:").unwrap();
        let id = store
            .create_pending(1, "BTCUSDT", Side::Long, dec!(1.0), dec!(10), dec!(20), dec!(95), &[dec!(105)], &["o1".into()])
            .unwrap();
        store.record_fill(id, dec!(0.5), dec!(101), Some(dec!(101)), None).unwrap();
        store.record_fill(id, dec!(1.0), dec!(100.5), Some(dec!(100.5)), None).unwrap();
        let pos = store.get(id).unwrap().unwrap();
        assert_eq!(pos.original_entry_price, Some(dec!(101)));
    }

    #[test]
    fn state_transition_rejects_invalid_jump() {
        let store = LifecycleStore::new(":memory:").unwrap();
        let id = store
            .create_pending(1, "BTCUSDT", Side::Long, dec!(1.0), dec!(10), dec!(20), dec!(95), &[dec!(105)], &["o1".into()])
            .unwrap();
        let ok = store.set_state(id, PositionState::PendingEntry, PositionState::Closed).unwrap();
        assert!(!ok);
        let pos = store.get(id).unwrap().unwrap();
        assert_eq!(pos.state, PositionState::PendingEntry);
    }
}
