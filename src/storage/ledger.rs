//! Paper account, positions and the append-only order ledger.
//!
//! `apply_fill` is the only writer of positions and cash: the order row,
//! the position change and the account update commit together or not at
//! all.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeMap;

use super::{decimal_from_db, ts_from_db, ts_to_db, Store};
use crate::types::{CoreError, CoreResult, OrderSide, PaperAccount, PaperOrder, PaperPosition};

/// Result of applying one order to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum FillResult {
    Applied {
        account: PaperAccount,
        /// Realized P&L of a sell, net of all costs.
        realized: Option<Decimal>,
    },
    /// An order with the same (run, instrument, side) was already applied.
    Duplicate,
}

impl Store {
    /// Create the account with `initial_cash` unless it already exists.
    pub async fn ensure_account(
        &self,
        initial_cash: Decimal,
        now: DateTime<Utc>,
    ) -> CoreResult<PaperAccount> {
        sqlx::query(
            "INSERT OR IGNORE INTO paper_account (id, cash, nav, realized_pnl, updated_at)
             VALUES (1, ?, ?, '0', ?)",
        )
        .bind(initial_cash.to_string())
        .bind(initial_cash.to_string())
        .bind(ts_to_db(now))
        .execute(&self.pool)
        .await?;
        self.load_account().await
    }

    pub async fn load_account(&self) -> CoreResult<PaperAccount> {
        let row = sqlx::query("SELECT cash, nav, realized_pnl, updated_at FROM paper_account WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => account_from_row(&r),
            None => Err(CoreError::Config("paper account not initialised".into())),
        }
    }

    pub async fn open_positions(&self) -> CoreResult<Vec<PaperPosition>> {
        let rows = sqlx::query(
            "SELECT instrument_id, quantity, average_cost, opened_at, last_price
             FROM paper_positions ORDER BY opened_at, instrument_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    /// Orders with `from <= ts < to`, oldest first.
    pub async fn orders_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<PaperOrder>> {
        let rows = sqlx::query(
            "SELECT order_id, run_id, instrument_id, side, quantity, price, fee, slippage, reason, ts
             FROM paper_orders WHERE ts >= ? AND ts < ? ORDER BY ts, rowid",
        )
        .bind(ts_to_db(from))
        .bind(ts_to_db(to))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    /// One instrument's orders with `ts < to`, oldest first.
    pub async fn instrument_orders_before(
        &self,
        instrument_id: &str,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<PaperOrder>> {
        let rows = sqlx::query(
            "SELECT order_id, run_id, instrument_id, side, quantity, price, fee, slippage, reason, ts
             FROM paper_orders WHERE instrument_id = ? AND ts < ? ORDER BY ts, rowid",
        )
        .bind(instrument_id)
        .bind(ts_to_db(to))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    /// The whole ledger, oldest first.
    pub async fn all_orders(&self) -> CoreResult<Vec<PaperOrder>> {
        let rows = sqlx::query(
            "SELECT order_id, run_id, instrument_id, side, quantity, price, fee, slippage, reason, ts
             FROM paper_orders ORDER BY ts, rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    /// Apply one order: ledger row, position change and account update in a
    /// single transaction. Rejects anything that would take cash below zero
    /// or sell more than is held.
    pub async fn apply_fill(&self, order: &PaperOrder) -> CoreResult<FillResult> {
        if order.quantity <= 0 {
            return Err(CoreError::ConstraintViolation(format!(
                "non-positive quantity {} for {}",
                order.quantity, order.instrument_id
            )));
        }

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO paper_orders
             (order_id, run_id, instrument_id, side, quantity, price, fee, slippage, reason, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&order.order_id)
        .bind(&order.run_id)
        .bind(&order.instrument_id)
        .bind(order.side.to_string())
        .bind(order.quantity)
        .bind(order.price.to_string())
        .bind(order.fee.to_string())
        .bind(order.slippage.to_string())
        .bind(&order.reason)
        .bind(ts_to_db(order.timestamp))
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(FillResult::Duplicate);
        }

        let row = sqlx::query("SELECT cash, nav, realized_pnl, updated_at FROM paper_account WHERE id = 1")
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::Config("paper account not initialised".into()))?;
        let mut account = account_from_row(&row)?;

        let cash_after = account.cash + order.cash_delta();
        if cash_after < Decimal::ZERO {
            return Err(CoreError::ConstraintViolation(format!(
                "insufficient cash for {}: have {}, need {}",
                order.instrument_id,
                account.cash.round_dp(2),
                (-order.cash_delta()).round_dp(2)
            )));
        }

        let existing = sqlx::query(
            "SELECT instrument_id, quantity, average_cost, opened_at, last_price
             FROM paper_positions WHERE instrument_id = ?",
        )
        .bind(&order.instrument_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| position_from_row(&r))
        .transpose()?;

        let realized = match order.side {
            OrderSide::Buy => {
                let qty = Decimal::from(order.quantity);
                let all_in = order.notional() + order.fee + order.slippage;
                match existing {
                    Some(pos) => {
                        let held = Decimal::from(pos.quantity);
                        let avg = (pos.average_cost * held + all_in) / (held + qty);
                        sqlx::query(
                            "UPDATE paper_positions SET quantity = ?, average_cost = ?, last_price = ?
                             WHERE instrument_id = ?",
                        )
                        .bind(pos.quantity + order.quantity)
                        .bind(avg.to_string())
                        .bind(order.price.to_string())
                        .bind(&order.instrument_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                    None => {
                        sqlx::query(
                            "INSERT INTO paper_positions (instrument_id, quantity, average_cost, opened_at, last_price)
                             VALUES (?, ?, ?, ?, ?)",
                        )
                        .bind(&order.instrument_id)
                        .bind(order.quantity)
                        .bind((all_in / qty).to_string())
                        .bind(ts_to_db(order.timestamp))
                        .bind(order.price.to_string())
                        .execute(&mut *tx)
                        .await?;
                    }
                }
                None
            }
            OrderSide::Sell => {
                let pos = existing.ok_or_else(|| {
                    CoreError::ConstraintViolation(format!("no position in {}", order.instrument_id))
                })?;
                if pos.quantity < order.quantity {
                    return Err(CoreError::ConstraintViolation(format!(
                        "sell {} exceeds held {} for {}",
                        order.quantity, pos.quantity, order.instrument_id
                    )));
                }
                let proceeds = order.cash_delta();
                let pnl = proceeds - pos.average_cost * Decimal::from(order.quantity);
                let remaining = pos.quantity - order.quantity;
                if remaining == 0 {
                    sqlx::query("DELETE FROM paper_positions WHERE instrument_id = ?")
                        .bind(&order.instrument_id)
                        .execute(&mut *tx)
                        .await?;
                } else {
                    sqlx::query("UPDATE paper_positions SET quantity = ?, last_price = ? WHERE instrument_id = ?")
                        .bind(remaining)
                        .bind(order.price.to_string())
                        .bind(&order.instrument_id)
                        .execute(&mut *tx)
                        .await?;
                }
                Some(pnl)
            }
        };

        account.cash = cash_after;
        if let Some(pnl) = realized {
            account.realized_pnl += pnl;
        }
        account.nav = cash_after + holdings_value(&mut tx).await?;
        account.updated_at = order.timestamp;
        write_account(&mut tx, &account).await?;

        tx.commit().await?;
        Ok(FillResult::Applied { account, realized })
    }

    /// Update last prices for held instruments and recompute NAV.
    pub async fn mark_positions(
        &self,
        prices: &BTreeMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> CoreResult<PaperAccount> {
        let mut tx = self.pool.begin().await?;
        for (id, px) in prices {
            sqlx::query("UPDATE paper_positions SET last_price = ? WHERE instrument_id = ?")
                .bind(px.to_string())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let row = sqlx::query("SELECT cash, nav, realized_pnl, updated_at FROM paper_account WHERE id = 1")
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::Config("paper account not initialised".into()))?;
        let mut account = account_from_row(&row)?;
        account.nav = account.cash + holdings_value(&mut tx).await?;
        account.updated_at = now;
        write_account(&mut tx, &account).await?;
        tx.commit().await?;
        Ok(account)
    }
}

async fn holdings_value(tx: &mut Transaction<'_, Sqlite>) -> CoreResult<Decimal> {
    let rows = sqlx::query("SELECT quantity, last_price FROM paper_positions")
        .fetch_all(&mut **tx)
        .await?;
    let mut total = Decimal::ZERO;
    for r in rows {
        let qty: i64 = r.try_get("quantity")?;
        total += decimal_from_db(&r.try_get::<String, _>("last_price")?)? * Decimal::from(qty);
    }
    Ok(total)
}

async fn write_account(tx: &mut Transaction<'_, Sqlite>, account: &PaperAccount) -> CoreResult<()> {
    sqlx::query("UPDATE paper_account SET cash = ?, nav = ?, realized_pnl = ?, updated_at = ? WHERE id = 1")
        .bind(account.cash.to_string())
        .bind(account.nav.to_string())
        .bind(account.realized_pnl.to_string())
        .bind(ts_to_db(account.updated_at))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn account_from_row(r: &SqliteRow) -> CoreResult<PaperAccount> {
    Ok(PaperAccount {
        cash: decimal_from_db(&r.try_get::<String, _>("cash")?)?,
        nav: decimal_from_db(&r.try_get::<String, _>("nav")?)?,
        realized_pnl: decimal_from_db(&r.try_get::<String, _>("realized_pnl")?)?,
        updated_at: ts_from_db(r.try_get("updated_at")?)?,
    })
}

fn position_from_row(r: &SqliteRow) -> CoreResult<PaperPosition> {
    Ok(PaperPosition {
        instrument_id: r.try_get("instrument_id")?,
        quantity: r.try_get("quantity")?,
        average_cost: decimal_from_db(&r.try_get::<String, _>("average_cost")?)?,
        opened_at: ts_from_db(r.try_get("opened_at")?)?,
        last_price: decimal_from_db(&r.try_get::<String, _>("last_price")?)?,
    })
}

fn order_from_row(r: &SqliteRow) -> CoreResult<PaperOrder> {
    Ok(PaperOrder {
        order_id: r.try_get("order_id")?,
        run_id: r.try_get("run_id")?,
        instrument_id: r.try_get("instrument_id")?,
        side: r.try_get::<String, _>("side")?.parse()?,
        quantity: r.try_get("quantity")?,
        price: decimal_from_db(&r.try_get::<String, _>("price")?)?,
        fee: decimal_from_db(&r.try_get::<String, _>("fee")?)?,
        slippage: decimal_from_db(&r.try_get::<String, _>("slippage")?)?,
        reason: r.try_get("reason")?,
        timestamp: ts_from_db(r.try_get("ts")?)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
