//! Placement response classification.

use serde::Serialize;

use crate::dispatch::placer::PlacementResponse;
use crate::error::PlacementError;

/// Classified result of one placement attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Success { confirmation: Option<String> },
    /// Price moved under a fresh placement; retry advised to the caller
    OddsChanged,
    Unauthorized,
    RateLimited,
    MarketUnavailable,
    EventUnavailable,
    Failure(String),
}

impl Outcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Retried in-call with backoff and a forced credential refresh
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Outcome::Unauthorized | Outcome::RateLimited)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::OddsChanged => "odds_changed",
            Outcome::Unauthorized => "unauthorized",
            Outcome::RateLimited => "rate_limited",
            Outcome::MarketUnavailable => "market_unavailable",
            Outcome::EventUnavailable => "event_unavailable",
            Outcome::Failure(_) => "failure",
        }
    }

    /// Caller-facing error text, None on success
    pub fn error_text(&self) -> Option<String> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure(msg) => Some(msg.clone()),
            Outcome::OddsChanged => Some("odds changed, retry advised".into()),
            other => Some(other.label().replace('_', " ")),
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify a collaborator response. `locked` marks a template replay, where
/// the venue skips its odds check and OddsChanged cannot legitimately occur.
pub fn classify(resp: &PlacementResponse, locked: bool, accepted_codes: &[i64]) -> Outcome {
    match resp.status {
        Some(401) | Some(403) => return Outcome::Unauthorized,
        Some(420) | Some(429) => return Outcome::RateLimited,
        _ => {}
    }

    if let Some(bet_id) = resp.bet_id() {
        return Outcome::Success { confirmation: Some(bet_id) };
    }
    if let Some(code) = resp.confirmation_code() {
        if resp.success && accepted_codes.contains(&code) {
            return Outcome::Success { confirmation: Some(format!("code:{code}")) };
        }
    }

    let text = resp.error.as_deref().unwrap_or_default().to_lowercase();

    if resp.odds_changed || contains_any(&text, &["odds changed", "odds have changed", "price changed"]) {
        return if locked {
            Outcome::Failure(format!("venue reported odds change on locked replay: {}", text))
        } else {
            Outcome::OddsChanged
        };
    }
    if contains_any(&text, &["unauthorized", "token expired", "not logged in", "session expired"]) {
        return Outcome::Unauthorized;
    }
    if contains_any(&text, &["rate limit", "too many requests", "slow down"]) {
        return Outcome::RateLimited;
    }
    if text.contains("market") && contains_any(&text, &["unavailable", "closed", "suspended"]) {
        return Outcome::MarketUnavailable;
    }
    if text.contains("event") && contains_any(&text, &["unavailable", "ended", "not found", "closed"]) {
        return Outcome::EventUnavailable;
    }

    if resp.success {
        // Venue said yes but gave nothing we recognise as a confirmation
        let code = resp.confirmation_code().map(|c| c.to_string()).unwrap_or_else(|| "none".into());
        return Outcome::Failure(format!("unconfirmed acceptance (code {code})"));
    }

    Outcome::Failure(resp.error.clone().unwrap_or_else(|| "placement rejected".into()))
}

/// Transport-level failures are terminal for the attempt.
pub fn classify_error(err: &PlacementError) -> Outcome {
    match err {
        PlacementError::Timeout(ms) => Outcome::Failure(format!("timeout after {ms}ms")),
        other => Outcome::Failure(other.to_string()),
    }
}
