//! Audit record types.

use serde::Serialize;

use crate::dispatch::{Outcome, PlacementRequest};

/// One finished placement attempt for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub timestamp_secs: i64,
    pub session_id: String,
    pub event_id: String,
    pub line_id: Option<String>,
    pub market: Option<String>,
    pub selection: String,
    pub price: i32,
    pub stake_cents: u32,
    pub fund_type: String,
    /// Outcome label ("success", "rate_limited", ...)
    pub outcome: String,
    pub success: bool,
    pub confirmation: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub locked_path: bool,
}

impl AuditRecord {
    pub fn from_attempt(
        session_id: &str,
        req: &PlacementRequest,
        outcome: &Outcome,
        attempts: u32,
        locked_path: bool,
    ) -> Self {
        let confirmation = match outcome {
            Outcome::Success { confirmation } => confirmation.clone(),
            _ => None,
        };
        Self {
            timestamp_secs: chrono::Utc::now().timestamp(),
            session_id: session_id.to_string(),
            event_id: req.event_id.to_string(),
            line_id: req.line_id.as_deref().map(String::from),
            market: req.market.clone(),
            selection: req.selection.clone(),
            price: req.price,
            stake_cents: req.stake_cents,
            fund_type: req.fund_type.to_string(),
            outcome: outcome.label().to_string(),
            success: outcome.is_success(),
            confirmation,
            error: outcome.error_text(),
            attempts,
            locked_path,
        }
    }
}

/// Running totals across the lifetime of the log, not just retained rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditTotals {
    pub attempts: i64,
    pub wins: i64,
    pub losses: i64,
    /// Accepted and not yet settled
    pub pending: i64,
    pub wagered_cents: i64,
    pub won_cents: i64,
}

impl AuditTotals {
    pub fn apply_placement(&mut self, record: &AuditRecord) {
        self.attempts += 1;
        if record.success {
            self.pending += 1;
            self.wagered_cents += record.stake_cents as i64;
        }
    }

    pub fn apply_settlement(&mut self, won: bool, payout_cents: i64) {
        self.pending = (self.pending - 1).max(0);
        if won {
            self.wins += 1;
            self.won_cents += payout_cents;
        } else {
            self.losses += 1;
        }
    }

    /// Net result in cents over settled and open wagers
    pub fn net_cents(&self) -> i64 {
        self.won_cents - self.wagered_cents
    }
}
