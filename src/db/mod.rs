//! Ledger persistence for trades, orders and pair locks.
//!
//! One `Database` handle owns the SQLite pool and is constructed at startup,
//! then passed explicitly to the control loop and to the read path; there is
//! no global session. Writes are confined to the control loop and the
//! administrative command handlers. Trade state transitions that also touch
//! an order row are applied inside a single transaction so a crash never
//! leaves a fill half-recorded.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{
    ExitReason, Order, OrderKind, OrderSide, OrderStatus, PairLock, Trade, TradeDirection,
    TradeState, LOCK_ALL_PAIRS,
};

/// Database connection pool and ledger operations.
pub struct Database {
    pool: SqlitePool,
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in ledger: {s}"))
}

fn parse_dec(s: &str) -> Result<Decimal> {
    s.parse::<Decimal>()
        .with_context(|| format!("Invalid decimal in ledger: {s}"))
}

fn parse_opt_dec(s: &Option<String>) -> Result<Option<Decimal>> {
    s.as_deref().map(parse_dec).transpose()
}

/// Raw trade row; decimals and timestamps are stored as TEXT to keep the
/// ledger exact and are parsed on read.
#[derive(Debug, Clone, sqlx::FromRow)]
struct TradeRow {
    id: i64,
    pair: String,
    direction: String,
    state: String,
    strategy: String,
    amount: String,
    open_rate: String,
    stake_amount: String,
    leverage: String,
    stoploss: Option<String>,
    stoploss_pct: Option<String>,
    initial_stoploss: Option<String>,
    initial_stoploss_pct: Option<String>,
    is_open: bool,
    is_frozen: bool,
    exit_reason: Option<String>,
    open_order_id: Option<String>,
    stoploss_order_id: Option<String>,
    open_date: String,
    close_date: Option<String>,
    close_rate: Option<String>,
    close_profit: Option<String>,
}

impl TradeRow {
    fn into_model(self) -> Result<Trade> {
        Ok(Trade {
            id: Some(self.id),
            pair: self.pair,
            direction: TradeDirection::from_str(&self.direction),
            state: TradeState::from_str(&self.state),
            strategy: self.strategy,
            amount: parse_dec(&self.amount)?,
            open_rate: parse_dec(&self.open_rate)?,
            stake_amount: parse_dec(&self.stake_amount)?,
            leverage: parse_dec(&self.leverage)?,
            stoploss: parse_opt_dec(&self.stoploss)?,
            stoploss_pct: parse_opt_dec(&self.stoploss_pct)?,
            initial_stoploss: parse_opt_dec(&self.initial_stoploss)?,
            initial_stoploss_pct: parse_opt_dec(&self.initial_stoploss_pct)?,
            is_open: self.is_open,
            is_frozen: self.is_frozen,
            exit_reason: self.exit_reason.as_deref().and_then(ExitReason::from_str),
            open_order_id: self.open_order_id,
            stoploss_order_id: self.stoploss_order_id,
            open_date: parse_ts(&self.open_date)?,
            close_date: self.close_date.as_deref().map(parse_ts).transpose()?,
            close_rate: parse_opt_dec(&self.close_rate)?,
            close_profit: parse_opt_dec(&self.close_profit)?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct OrderRow {
    id: i64,
    trade_id: i64,
    order_id: Option<String>,
    side: String,
    kind: String,
    price: Option<String>,
    average: Option<String>,
    amount: String,
    filled: String,
    cost: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl OrderRow {
    fn into_model(self) -> Result<Order> {
        Ok(Order {
            id: Some(self.id),
            trade_id: self.trade_id,
            order_id: self.order_id,
            side: OrderSide::from_str(&self.side),
            kind: OrderKind::from_str(&self.kind),
            price: parse_opt_dec(&self.price)?,
            average: parse_opt_dec(&self.average)?,
            amount: parse_dec(&self.amount)?,
            filled: parse_dec(&self.filled)?,
            cost: parse_dec(&self.cost)?,
            status: OrderStatus::from_str(&self.status),
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PairLockRow {
    id: i64,
    pair: String,
    reason: Option<String>,
    lock_time: String,
    lock_until: String,
    active: bool,
}

impl PairLockRow {
    fn into_model(self) -> Result<PairLock> {
        Ok(PairLock {
            id: Some(self.id),
            pair: self.pair,
            reason: self.reason,
            lock_time: parse_ts(&self.lock_time)?,
            lock_until: parse_ts(&self.lock_until)?,
            active: self.active,
        })
    }
}

impl Database {
    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory ledger for tests. A single connection keeps every query on
    /// the same SQLite memory instance.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pair TEXT NOT NULL,
                direction TEXT NOT NULL,
                state TEXT NOT NULL,
                strategy TEXT NOT NULL,
                amount TEXT NOT NULL,
                open_rate TEXT NOT NULL,
                stake_amount TEXT NOT NULL,
                leverage TEXT NOT NULL,
                stoploss TEXT,
                stoploss_pct TEXT,
                initial_stoploss TEXT,
                initial_stoploss_pct TEXT,
                is_open INTEGER NOT NULL DEFAULT 1,
                is_frozen INTEGER NOT NULL DEFAULT 0,
                exit_reason TEXT,
                open_order_id TEXT,
                stoploss_order_id TEXT,
                open_date TEXT NOT NULL,
                close_date TEXT,
                close_rate TEXT,
                close_profit TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id INTEGER NOT NULL,
                order_id TEXT,
                side TEXT NOT NULL,
                kind TEXT NOT NULL,
                price TEXT,
                average TEXT,
                amount TEXT NOT NULL,
                filled TEXT NOT NULL DEFAULT '0',
                cost TEXT NOT NULL DEFAULT '0',
                status TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (trade_id) REFERENCES trades(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pair_locks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pair TEXT NOT NULL,
                reason TEXT,
                lock_time TEXT NOT NULL,
                lock_until TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_is_open ON trades(is_open)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_pair ON trades(pair)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_trade ON orders(trade_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_order_id ON orders(order_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pair_locks_pair ON pair_locks(pair)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Trades ====================

    /// Insert a new trade, assigning its ledger id.
    pub async fn insert_trade(&self, trade: &mut Trade) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                pair, direction, state, strategy, amount, open_rate, stake_amount,
                leverage, stoploss, stoploss_pct, initial_stoploss, initial_stoploss_pct,
                is_open, is_frozen, exit_reason, open_order_id, stoploss_order_id,
                open_date, close_date, close_rate, close_profit
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.pair)
        .bind(trade.direction.as_str())
        .bind(trade.state.as_str())
        .bind(&trade.strategy)
        .bind(trade.amount.to_string())
        .bind(trade.open_rate.to_string())
        .bind(trade.stake_amount.to_string())
        .bind(trade.leverage.to_string())
        .bind(trade.stoploss.map(|d| d.to_string()))
        .bind(trade.stoploss_pct.map(|d| d.to_string()))
        .bind(trade.initial_stoploss.map(|d| d.to_string()))
        .bind(trade.initial_stoploss_pct.map(|d| d.to_string()))
        .bind(trade.is_open)
        .bind(trade.is_frozen)
        .bind(trade.exit_reason.map(|r| r.as_str()))
        .bind(&trade.open_order_id)
        .bind(&trade.stoploss_order_id)
        .bind(fmt_ts(trade.open_date))
        .bind(trade.close_date.map(fmt_ts))
        .bind(trade.close_rate.map(|d| d.to_string()))
        .bind(trade.close_profit.map(|d| d.to_string()))
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        trade.id = Some(id);
        Ok(id)
    }

    /// Persist every mutable field of an existing trade.
    pub async fn update_trade(&self, trade: &Trade) -> Result<()> {
        let id = trade.id.context("Cannot update a trade without an id")?;
        sqlx::query(
            r#"
            UPDATE trades SET
                state = ?, amount = ?, open_rate = ?, stake_amount = ?,
                stoploss = ?, stoploss_pct = ?, initial_stoploss = ?, initial_stoploss_pct = ?,
                is_open = ?, is_frozen = ?, exit_reason = ?,
                open_order_id = ?, stoploss_order_id = ?,
                close_date = ?, close_rate = ?, close_profit = ?
            WHERE id = ?
            "#,
        )
        .bind(trade.state.as_str())
        .bind(trade.amount.to_string())
        .bind(trade.open_rate.to_string())
        .bind(trade.stake_amount.to_string())
        .bind(trade.stoploss.map(|d| d.to_string()))
        .bind(trade.stoploss_pct.map(|d| d.to_string()))
        .bind(trade.initial_stoploss.map(|d| d.to_string()))
        .bind(trade.initial_stoploss_pct.map(|d| d.to_string()))
        .bind(trade.is_open)
        .bind(trade.is_frozen)
        .bind(trade.exit_reason.map(|r| r.as_str()))
        .bind(&trade.open_order_id)
        .bind(&trade.stoploss_order_id)
        .bind(trade.close_date.map(fmt_ts))
        .bind(trade.close_rate.map(|d| d.to_string()))
        .bind(trade.close_profit.map(|d| d.to_string()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_trade(&self, id: i64) -> Result<Option<Trade>> {
        let row = sqlx::query_as::<_, TradeRow>("SELECT * FROM trades WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TradeRow::into_model).transpose()
    }

    /// All open trades in creation order.
    pub async fn get_open_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE is_open = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TradeRow::into_model).collect()
    }

    pub async fn get_open_trades_by_pair(&self, pair: &str) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE is_open = 1 AND pair = ? ORDER BY id",
        )
        .bind(pair)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TradeRow::into_model).collect()
    }

    pub async fn open_trade_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trades WHERE is_open = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Sum of stake committed to currently open trades.
    pub async fn total_open_stake(&self) -> Result<Decimal> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT stake_amount FROM trades WHERE is_open = 1")
                .fetch_all(&self.pool)
                .await?;
        let mut total = Decimal::ZERO;
        for (stake,) in rows {
            total += parse_dec(&stake)?;
        }
        Ok(total)
    }

    /// Realized profit over all closed trades.
    pub async fn total_closed_profit(&self) -> Result<Decimal> {
        let rows: Vec<(Option<String>,)> =
            sqlx::query_as("SELECT close_profit FROM trades WHERE is_open = 0")
                .fetch_all(&self.pool)
                .await?;
        let mut total = Decimal::ZERO;
        for (profit,) in rows {
            if let Some(p) = profit {
                total += parse_dec(&p)?;
            }
        }
        Ok(total)
    }

    /// Remove a trade and its order history. Returns how many non-terminal
    /// orders were attached, i.e. how many exchange-side cancellations the
    /// caller still owes.
    pub async fn delete_trade(&self, id: i64) -> Result<usize> {
        let orders = self.orders_for_trade(id).await?;
        let open_orders = orders.iter().filter(|o| !o.is_terminal()).count();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM orders WHERE trade_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM trades WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(open_orders)
    }

    // ==================== Orders ====================

    pub async fn insert_order(&self, order: &mut Order) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (
                trade_id, order_id, side, kind, price, average, amount,
                filled, cost, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order.trade_id)
        .bind(&order.order_id)
        .bind(order.side.as_str())
        .bind(order.kind.as_str())
        .bind(order.price.map(|d| d.to_string()))
        .bind(order.average.map(|d| d.to_string()))
        .bind(order.amount.to_string())
        .bind(order.filled.to_string())
        .bind(order.cost.to_string())
        .bind(order.status.as_str())
        .bind(fmt_ts(order.created_at))
        .bind(fmt_ts(order.updated_at))
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        order.id = Some(id);
        Ok(id)
    }

    pub async fn update_order(&self, order: &Order) -> Result<()> {
        let id = order.id.context("Cannot update an order without an id")?;
        sqlx::query(
            r#"
            UPDATE orders SET
                order_id = ?, price = ?, average = ?, filled = ?, cost = ?,
                status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&order.order_id)
        .bind(order.price.map(|d| d.to_string()))
        .bind(order.average.map(|d| d.to_string()))
        .bind(order.filled.to_string())
        .bind(order.cost.to_string())
        .bind(order.status.as_str())
        .bind(fmt_ts(order.updated_at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Order history of a trade in submission order.
    pub async fn orders_for_trade(&self, trade_id: i64) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE trade_id = ? ORDER BY id",
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OrderRow::into_model).collect()
    }

    pub async fn find_order_by_exchange_id(
        &self,
        trade_id: i64,
        order_id: &str,
    ) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE trade_id = ? AND order_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(trade_id)
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(OrderRow::into_model).transpose()
    }

    /// Insert a trade together with its first order in one transaction.
    pub async fn create_trade_with_order(
        &self,
        trade: &mut Trade,
        order: &mut Order,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                pair, direction, state, strategy, amount, open_rate, stake_amount,
                leverage, stoploss, stoploss_pct, initial_stoploss, initial_stoploss_pct,
                is_open, is_frozen, exit_reason, open_order_id, stoploss_order_id,
                open_date, close_date, close_rate, close_profit
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.pair)
        .bind(trade.direction.as_str())
        .bind(trade.state.as_str())
        .bind(&trade.strategy)
        .bind(trade.amount.to_string())
        .bind(trade.open_rate.to_string())
        .bind(trade.stake_amount.to_string())
        .bind(trade.leverage.to_string())
        .bind(trade.stoploss.map(|d| d.to_string()))
        .bind(trade.stoploss_pct.map(|d| d.to_string()))
        .bind(trade.initial_stoploss.map(|d| d.to_string()))
        .bind(trade.initial_stoploss_pct.map(|d| d.to_string()))
        .bind(trade.is_open)
        .bind(trade.is_frozen)
        .bind(trade.exit_reason.map(|r| r.as_str()))
        .bind(&trade.open_order_id)
        .bind(&trade.stoploss_order_id)
        .bind(fmt_ts(trade.open_date))
        .bind(trade.close_date.map(fmt_ts))
        .bind(trade.close_rate.map(|d| d.to_string()))
        .bind(trade.close_profit.map(|d| d.to_string()))
        .execute(&mut *tx)
        .await?;

        let trade_id = result.last_insert_rowid();
        order.trade_id = trade_id;

        let result = sqlx::query(
            r#"
            INSERT INTO orders (
                trade_id, order_id, side, kind, price, average, amount,
                filled, cost, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order.trade_id)
        .bind(&order.order_id)
        .bind(order.side.as_str())
        .bind(order.kind.as_str())
        .bind(order.price.map(|d| d.to_string()))
        .bind(order.average.map(|d| d.to_string()))
        .bind(order.amount.to_string())
        .bind(order.filled.to_string())
        .bind(order.cost.to_string())
        .bind(order.status.as_str())
        .bind(fmt_ts(order.created_at))
        .bind(fmt_ts(order.updated_at))
        .execute(&mut *tx)
        .await?;

        let order_id = result.last_insert_rowid();
        tx.commit().await?;

        trade.id = Some(trade_id);
        order.id = Some(order_id);
        Ok(())
    }

    /// Persist a trade mutation and the order that caused it atomically.
    pub async fn update_trade_with_order(&self, trade: &Trade, order: &Order) -> Result<()> {
        let trade_id = trade.id.context("Cannot update a trade without an id")?;
        let order_id = order.id.context("Cannot update an order without an id")?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE trades SET
                state = ?, amount = ?, open_rate = ?, stake_amount = ?,
                stoploss = ?, stoploss_pct = ?, initial_stoploss = ?, initial_stoploss_pct = ?,
                is_open = ?, is_frozen = ?, exit_reason = ?,
                open_order_id = ?, stoploss_order_id = ?,
                close_date = ?, close_rate = ?, close_profit = ?
            WHERE id = ?
            "#,
        )
        .bind(trade.state.as_str())
        .bind(trade.amount.to_string())
        .bind(trade.open_rate.to_string())
        .bind(trade.stake_amount.to_string())
        .bind(trade.stoploss.map(|d| d.to_string()))
        .bind(trade.stoploss_pct.map(|d| d.to_string()))
        .bind(trade.initial_stoploss.map(|d| d.to_string()))
        .bind(trade.initial_stoploss_pct.map(|d| d.to_string()))
        .bind(trade.is_open)
        .bind(trade.is_frozen)
        .bind(trade.exit_reason.map(|r| r.as_str()))
        .bind(&trade.open_order_id)
        .bind(&trade.stoploss_order_id)
        .bind(trade.close_date.map(fmt_ts))
        .bind(trade.close_rate.map(|d| d.to_string()))
        .bind(trade.close_profit.map(|d| d.to_string()))
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE orders SET
                order_id = ?, price = ?, average = ?, filled = ?, cost = ?,
                status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&order.order_id)
        .bind(order.price.map(|d| d.to_string()))
        .bind(order.average.map(|d| d.to_string()))
        .bind(order.filled.to_string())
        .bind(order.cost.to_string())
        .bind(order.status.as_str())
        .bind(fmt_ts(order.updated_at))
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ==================== Pair locks ====================

    pub async fn lock_pair(
        &self,
        pair: &str,
        lock_until: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<PairLock> {
        let mut lock = PairLock::new(pair, lock_until, reason.map(String::from));
        let result = sqlx::query(
            r#"
            INSERT INTO pair_locks (pair, reason, lock_time, lock_until, active)
            VALUES (?, ?, ?, ?, 1)
            "#,
        )
        .bind(&lock.pair)
        .bind(&lock.reason)
        .bind(fmt_ts(lock.lock_time))
        .bind(fmt_ts(lock.lock_until))
        .execute(&self.pool)
        .await?;

        lock.id = Some(result.last_insert_rowid());
        Ok(lock)
    }

    /// Deactivate all locks for a pair. Returns how many were released.
    pub async fn unlock_pair(&self, pair: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE pair_locks SET active = 0 WHERE pair = ? AND active = 1")
            .bind(pair)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn unlock_by_id(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE pair_locks SET active = 0 WHERE id = ? AND active = 1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All locks still active at `now`, expiry evaluated here rather than in
    /// SQL so the timestamp encoding stays an implementation detail.
    pub async fn active_locks(&self, now: DateTime<Utc>) -> Result<Vec<PairLock>> {
        let rows = sqlx::query_as::<_, PairLockRow>(
            "SELECT * FROM pair_locks WHERE active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let locks: Result<Vec<PairLock>> =
            rows.into_iter().map(PairLockRow::into_model).collect();
        Ok(locks?.into_iter().filter(|l| l.is_active_at(now)).collect())
    }

    /// A pair is locked iff any active lock exists for it or for `"*"`.
    pub async fn is_pair_locked(&self, pair: &str, now: DateTime<Utc>) -> Result<bool> {
        let rows = sqlx::query_as::<_, PairLockRow>(
            "SELECT * FROM pair_locks WHERE active = 1 AND (pair = ? OR pair = ?)",
        )
        .bind(pair)
        .bind(LOCK_ALL_PAIRS)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let lock = row.into_model()?;
            if lock.is_active_at(now) && lock.applies_to(pair) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The connection pool, for read-path consumers needing custom queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
