//! Non-blocking SQLite writer using a dedicated thread and mpsc channel.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{error, info, warn};

use super::schema::{create_tables, enforce_retention, load_totals, save_totals};
use super::types::{AuditRecord, AuditTotals};
use crate::config::AuditConfig;
use crate::dispatch::AuditSink;

const BATCH_SIZE: usize = 100;
const BATCH_TIMEOUT: Duration = Duration::from_millis(100);

/// Messages sent to the audit writer thread.
enum AuditMessage {
    Placement(AuditRecord),
    Settlement { confirmation: String, won: bool, payout_cents: i64 },
    /// Flush now and acknowledge
    Flush(Sender<()>),
    Shutdown,
}

/// Channel handle for sending audit messages (non-blocking).
#[derive(Clone)]
pub struct AuditChannel {
    tx: Sender<AuditMessage>,
    totals: Arc<Mutex<AuditTotals>>,
    /// Running type for this process: "DRY_RUN" or "REAL_MONEY"
    pub running_type: String,
}

impl AuditChannel {
    pub fn record(&self, record: AuditRecord) {
        self.totals.lock().apply_placement(&record);
        let _ = self.tx.send(AuditMessage::Placement(record));
    }

    /// Settle an accepted wager by its confirmation. Totals move once the
    /// writer has closed an open row for it; repeats and unknown
    /// confirmations leave them untouched.
    pub fn record_settlement(&self, confirmation: impl Into<String>, won: bool, payout_cents: i64) {
        let _ = self.tx.send(AuditMessage::Settlement {
            confirmation: confirmation.into(),
            won,
            payout_cents,
        });
    }

    pub fn totals(&self) -> AuditTotals {
        *self.totals.lock()
    }

    /// Block until everything sent so far is on disk. False if the writer
    /// is gone or did not answer in time.
    pub fn flush(&self) -> bool {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(AuditMessage::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(Duration::from_secs(5)).is_ok()
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.tx.send(AuditMessage::Shutdown);
    }
}

impl AuditSink for AuditChannel {
    fn record_placement(&self, record: AuditRecord) {
        self.record(record);
    }
}

/// Open the database, load persisted totals and spawn the writer thread.
///
/// `running_type` should be one of: "DRY_RUN" or "REAL_MONEY"
pub fn create_audit_channel(config: &AuditConfig, running_type: &str) -> rusqlite::Result<AuditChannel> {
    let conn = Connection::open(&config.db_path)?;
    create_tables(&conn)?;
    let loaded = load_totals(&conn)?;
    info!(
        "[AUDIT] Database initialized at {} | {} attempts, {} pending, ${:.2} wagered",
        config.db_path,
        loaded.attempts,
        loaded.pending,
        loaded.wagered_cents as f64 / 100.0
    );

    let (tx, rx) = mpsc::channel();
    let totals = Arc::new(Mutex::new(loaded));
    let writer = Writer {
        conn,
        totals: totals.clone(),
        retention: config.retention,
        running_type: running_type.to_string(),
    };

    // Dedicated writer thread, isolated from the async runtime
    thread::spawn(move || writer.run(rx));

    Ok(AuditChannel {
        tx,
        totals,
        running_type: running_type.to_string(),
    })
}

struct Writer {
    conn: Connection,
    totals: Arc<Mutex<AuditTotals>>,
    retention: usize,
    running_type: String,
}

impl Writer {
    fn run(self, rx: Receiver<AuditMessage>) {
        let mut batch: Vec<AuditMessage> = Vec::with_capacity(BATCH_SIZE);

        loop {
            match rx.recv_timeout(BATCH_TIMEOUT) {
                Ok(AuditMessage::Shutdown) => {
                    self.flush_batch(&mut batch);
                    info!("[AUDIT] Writer shutdown complete");
                    break;
                }
                Ok(AuditMessage::Flush(ack)) => {
                    self.flush_batch(&mut batch);
                    let _ = ack.send(());
                }
                Ok(msg) => {
                    batch.push(msg);
                    if batch.len() >= BATCH_SIZE {
                        self.flush_batch(&mut batch);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => self.flush_batch(&mut batch),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.flush_batch(&mut batch);
                    info!("[AUDIT] Channel disconnected, writer exiting");
                    break;
                }
            }
        }
    }

    /// Write a batch, trim to retention and persist totals in one transaction.
    fn flush_batch(&self, batch: &mut Vec<AuditMessage>) {
        if batch.is_empty() {
            return;
        }

        let tx = match self.conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => {
                error!("[AUDIT] Failed to start transaction: {}", e);
                batch.clear();
                return;
            }
        };

        let mut placed = 0;
        let mut settled = 0;
        for msg in batch.drain(..) {
            match msg {
                AuditMessage::Placement(r) => {
                    if insert_record(&tx, &r, &self.running_type) {
                        placed += 1;
                    }
                }
                AuditMessage::Settlement { confirmation, won, payout_cents } => {
                    if settle_record(&tx, &confirmation, won, payout_cents) {
                        self.totals.lock().apply_settlement(won, payout_cents);
                        settled += 1;
                    }
                }
                AuditMessage::Flush(_) | AuditMessage::Shutdown => {}
            }
        }

        let trimmed = match enforce_retention(&tx, self.retention) {
            Ok(n) => n,
            Err(e) => {
                warn!("[AUDIT] Retention pass failed: {}", e);
                0
            }
        };
        let totals = *self.totals.lock();
        if let Err(e) = save_totals(&tx, &totals) {
            warn!("[AUDIT] Failed to save totals: {}", e);
        }

        if let Err(e) = tx.commit() {
            error!("[AUDIT] Failed to commit transaction: {}", e);
        } else if placed > 0 || settled > 0 {
            info!(
                "[AUDIT] Flushed {} placements, {} settlements ({} trimmed)",
                placed, settled, trimmed
            );
        }
    }
}

fn insert_record(conn: &Connection, r: &AuditRecord, running_type: &str) -> bool {
    let result = conn.execute(
        "INSERT INTO bet_log (timestamp, session_id, event_id, line_id, market, selection, price, stake_cents, fund_type, outcome, success, confirmation, error, attempts, locked_path, running_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        rusqlite::params![
            r.timestamp_secs,
            r.session_id,
            r.event_id,
            r.line_id,
            r.market,
            r.selection,
            r.price,
            r.stake_cents,
            r.fund_type,
            r.outcome,
            r.success as i32,
            r.confirmation,
            r.error,
            r.attempts,
            r.locked_path as i32,
            running_type,
        ],
    );

    match result {
        Ok(_) => true,
        Err(e) => {
            warn!("[AUDIT] Failed to insert record for {}: {}", r.session_id, e);
            false
        }
    }
}

fn settle_record(conn: &Connection, confirmation: &str, won: bool, payout_cents: i64) -> bool {
    let result = conn.execute(
        "UPDATE bet_log SET settled = ?1, payout_cents = ?2 WHERE confirmation = ?3 AND settled IS NULL",
        rusqlite::params![if won { "won" } else { "lost" }, payout_cents, confirmation],
    );

    match result {
        Ok(rows) if rows > 0 => true,
        Ok(_) => {
            // Unknown, already settled or trimmed
            warn!("[AUDIT] No open record for confirmation {}", confirmation);
            false
        }
        Err(e) => {
            warn!("[AUDIT] Failed to settle {}: {}", confirmation, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Outcome, PlacementRequest};
    use crate::types::FundType;

    fn temp_db(name: &str) -> AuditConfig {
        let path = std::env::temp_dir().join(format!("odds_relay_{}_{}.db", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        AuditConfig { db_path: path.to_string_lossy().into_owned(), retention: 3 }
    }

    fn record(stake_cents: u32, outcome: Outcome) -> AuditRecord {
        let req = PlacementRequest {
            event_id: "A".into(),
            line_id: Some("L1".into()),
            selection: "Lakers -4.5".into(),
            price: -110,
            stake_cents,
            fund_type: FundType::Cash,
            param: Some(-4.5),
            market: Some("Spread".into()),
        };
        AuditRecord::from_attempt("p1", &req, &outcome, 1, false)
    }

    fn row_count(path: &str) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row("SELECT COUNT(*) FROM bet_log", [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_retention_keeps_most_recent_rows() {
        let cfg = temp_db("retention");
        let audit = create_audit_channel(&cfg, "DRY_RUN").unwrap();
        for i in 0..5 {
            audit.record(record(100 + i, Outcome::Success { confirmation: Some(format!("B{i}")) }));
        }
        assert!(audit.flush());

        assert_eq!(row_count(&cfg.db_path), 3);
        let conn = Connection::open(&cfg.db_path).unwrap();
        let oldest: i64 = conn.query_row("SELECT MIN(stake_cents) FROM bet_log", [], |r| r.get(0)).unwrap();
        assert_eq!(oldest, 102);
        // Totals cover everything, including trimmed rows
        assert_eq!(audit.totals().attempts, 5);
    }

    #[test]
    fn test_totals_reload_across_restart() {
        let cfg = temp_db("reload");
        {
            let audit = create_audit_channel(&cfg, "DRY_RUN").unwrap();
            audit.record(record(500, Outcome::Success { confirmation: Some("B1".into()) }));
            audit.record(record(500, Outcome::RateLimited));
            audit.record(record(300, Outcome::Success { confirmation: Some("B2".into()) }));
            audit.record_settlement("B1", true, 950);
            assert!(audit.flush());
            audit.shutdown();
        }

        let audit = create_audit_channel(&cfg, "DRY_RUN").unwrap();
        let t = audit.totals();
        assert_eq!(t.attempts, 3);
        assert_eq!(t.wins, 1);
        assert_eq!(t.pending, 1);
        assert_eq!(t.wagered_cents, 800);
        assert_eq!(t.won_cents, 950);
        assert_eq!(t.net_cents(), 150);
    }

    #[test]
    fn test_settlement_counts_once_per_open_wager() {
        let cfg = temp_db("settle_once");
        let audit = create_audit_channel(&cfg, "DRY_RUN").unwrap();
        audit.record(record(500, Outcome::Success { confirmation: Some("B1".into()) }));
        audit.record_settlement("B1", true, 950);
        audit.record_settlement("B1", true, 950);
        audit.record_settlement("UNKNOWN", false, 0);
        assert!(audit.flush());

        let t = audit.totals();
        assert_eq!(t.wins, 1);
        assert_eq!(t.losses, 0);
        assert_eq!(t.pending, 0);
        assert_eq!(t.won_cents, 950);

        let conn = Connection::open(&cfg.db_path).unwrap();
        let settled: String = conn
            .query_row("SELECT settled FROM bet_log WHERE confirmation = 'B1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(settled, "won");
    }

    #[test]
    fn test_failed_attempt_is_logged_without_wager() {
        let cfg = temp_db("failed");
        let audit = create_audit_channel(&cfg, "DRY_RUN").unwrap();
        audit.record_placement(record(500, Outcome::MarketUnavailable));
        assert!(audit.flush());

        let conn = Connection::open(&cfg.db_path).unwrap();
        let (outcome, success): (String, i32) = conn
            .query_row("SELECT outcome, success FROM bet_log", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(outcome, "market_unavailable");
        assert_eq!(success, 0);
        assert_eq!(audit.totals().wagered_cents, 0);
    }
}
