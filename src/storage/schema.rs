//! Database schema creation.

use rusqlite::{Connection, OptionalExtension, Result};

use super::types::AuditTotals;

/// Create all database tables and indexes.
pub fn create_tables(conn: &Connection) -> Result<()> {
    // One row per finished session attempt
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bet_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            line_id TEXT,
            market TEXT,
            selection TEXT NOT NULL,
            price INTEGER NOT NULL,
            stake_cents INTEGER NOT NULL,
            fund_type TEXT NOT NULL,
            outcome TEXT NOT NULL,
            success INTEGER NOT NULL,
            confirmation TEXT,
            error TEXT,
            attempts INTEGER NOT NULL,
            locked_path INTEGER NOT NULL,
            settled TEXT,
            payout_cents INTEGER,
            running_type TEXT
        )",
        [],
    )?;

    // Single-row running totals, survives retention trimming
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_totals (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            attempts INTEGER NOT NULL,
            wins INTEGER NOT NULL,
            losses INTEGER NOT NULL,
            pending INTEGER NOT NULL,
            wagered_cents INTEGER NOT NULL,
            won_cents INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bet_log_time ON bet_log(timestamp DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bet_log_confirmation ON bet_log(confirmation)",
        [],
    )?;

    Ok(())
}

/// Totals persisted by a previous run, or zeros.
pub fn load_totals(conn: &Connection) -> Result<AuditTotals> {
    let totals = conn
        .query_row(
            "SELECT attempts, wins, losses, pending, wagered_cents, won_cents FROM audit_totals WHERE id = 1",
            [],
            |row| {
                Ok(AuditTotals {
                    attempts: row.get(0)?,
                    wins: row.get(1)?,
                    losses: row.get(2)?,
                    pending: row.get(3)?,
                    wagered_cents: row.get(4)?,
                    won_cents: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(totals.unwrap_or_default())
}

pub fn save_totals(conn: &Connection, t: &AuditTotals) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_totals (id, attempts, wins, losses, pending, wagered_cents, won_cents)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            attempts = excluded.attempts, wins = excluded.wins, losses = excluded.losses,
            pending = excluded.pending, wagered_cents = excluded.wagered_cents, won_cents = excluded.won_cents",
        rusqlite::params![t.attempts, t.wins, t.losses, t.pending, t.wagered_cents, t.won_cents],
    )?;
    Ok(())
}

/// Keep only the most recent `keep` rows. Returns rows removed.
pub fn enforce_retention(conn: &Connection, keep: usize) -> Result<usize> {
    conn.execute(
        "DELETE FROM bet_log WHERE id NOT IN (SELECT id FROM bet_log ORDER BY id DESC LIMIT ?1)",
        [keep as i64],
    )
}
