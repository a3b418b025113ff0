//! Multi-session bet dispatch.
//!
//! One request fans out to every ready session. Each session runs its own
//! resolve → refresh → place → classify → retry sequence; every outcome is
//! collected and nothing short-circuits on another session's failure.

pub mod classify;
pub mod placer;

pub use classify::{classify, classify_error, Outcome};
pub use placer::{
    BetPlacer, CredentialCapture, DryRunPlacer, HttpSessionBridge, PlacementRequest, PlacementResponse,
};

use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::error::PlacementError;
use crate::lock_cache::{LockedRequestCache, LockedRequestTemplate};
use crate::repository::OddsRepository;
use crate::session::{Session, SessionRegistry};
use crate::storage::AuditRecord;
use crate::types::{DispatchRequest, EventId, LineId, SessionId, StakeCents};

/// Receives one record per finished session attempt. Must not block.
pub trait AuditSink: Send + Sync {
    fn record_placement(&self, record: AuditRecord);
}

/// Final outcome for one session.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub session_id: SessionId,
    pub success: bool,
    /// Caller may retry (odds moved, or auth/rate limits outlasted the retries)
    pub retryable: bool,
    pub unauthorized: bool,
    pub rate_limited: bool,
    pub error: Option<String>,
    pub outcome: Outcome,
    pub attempts: u32,
    pub locked_path: bool,
    /// A locked template exists for this session and line after the attempt
    pub armed: bool,
    pub confirmation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchSummary {
    pub event_id: EventId,
    pub line_id: LineId,
    pub stake_cents: StakeCents,
    pub success_count: usize,
    pub failed_count: usize,
    pub any_success: bool,
    pub any_armed: bool,
    pub all_armed: bool,
    pub elapsed_ms: u64,
    pub results: Vec<DispatchResult>,
}

impl DispatchSummary {
    fn from_results(req: &DispatchRequest, results: Vec<DispatchResult>, elapsed: Duration) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            event_id: req.event_id.clone(),
            line_id: req.line_id.clone(),
            stake_cents: req.stake_cents,
            success_count,
            failed_count: results.len() - success_count,
            any_success: success_count > 0,
            any_armed: results.iter().any(|r| r.armed),
            all_armed: !results.is_empty() && results.iter().all(|r| r.armed),
            elapsed_ms: elapsed.as_millis() as u64,
            results,
        }
    }
}

/// Result of a budgeted dispatch call.
pub enum DispatchOutcome {
    Completed(DispatchSummary),
    /// Budget ran out; the dispatch keeps running and the handle yields its summary
    Pending(JoinHandle<DispatchSummary>),
}

/// Delay before retry number `retry` (0-based): base doubled per retry, capped.
pub fn backoff_delay(retry: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(1u32 << retry.min(16)).min(cap)
}

pub struct Dispatcher {
    repo: Arc<OddsRepository>,
    sessions: Arc<SessionRegistry>,
    locks: Arc<LockedRequestCache>,
    placer: Arc<dyn BetPlacer>,
    audit: Option<Arc<dyn AuditSink>>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        repo: Arc<OddsRepository>,
        sessions: Arc<SessionRegistry>,
        locks: Arc<LockedRequestCache>,
        placer: Arc<dyn BetPlacer>,
        config: DispatchConfig,
    ) -> Self {
        Self { repo, sessions, locks, placer, audit: None, config }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Place across every ready session and wait for all of them.
    pub async fn dispatch(&self, req: &DispatchRequest) -> DispatchSummary {
        let started = Instant::now();
        let sessions = self.sessions.ready_sessions();
        if sessions.is_empty() {
            warn!("[DISPATCH] No ready sessions for {} / {}", req.event_id, req.line_id);
        }

        let fresh = self.resolve(req);
        let attempts = sessions.into_iter().map(|s| self.run_session(s, req, &fresh));
        let results = join_all(attempts).await;

        let summary = DispatchSummary::from_results(req, results, started.elapsed());
        info!(
            "[DISPATCH] {} / {} ${:.2} | {}/{} ok | armed any={} all={} | {}ms",
            summary.event_id,
            summary.line_id,
            summary.stake_cents as f64 / 100.0,
            summary.success_count,
            summary.success_count + summary.failed_count,
            summary.any_armed,
            summary.all_armed,
            summary.elapsed_ms
        );
        summary
    }

    /// Probe placement at the minimum stake. Successful sessions come back armed.
    pub async fn lock(&self, req: &DispatchRequest) -> DispatchSummary {
        let probe = DispatchRequest {
            stake_cents: self.config.probe_stake_cents,
            use_locked_path: false,
            ..req.clone()
        };
        self.dispatch(&probe).await
    }

    /// Dispatch, but stop waiting after `budget`. The dispatch itself is never
    /// cancelled; a pending handle resolves to its summary later.
    pub async fn dispatch_within(self: &Arc<Self>, req: DispatchRequest, budget: Duration) -> anyhow::Result<DispatchOutcome> {
        let this = self.clone();
        let mut handle = tokio::spawn(async move { this.dispatch(&req).await });
        match timeout(budget, &mut handle).await {
            Ok(joined) => Ok(DispatchOutcome::Completed(joined?)),
            Err(_) => {
                debug!("[DISPATCH] Caller budget {}ms exceeded, continuing in background", budget.as_millis());
                Ok(DispatchOutcome::Pending(handle))
            }
        }
    }

    /// `dispatch_within` bounded by the configured caller budget.
    pub async fn submit(self: &Arc<Self>, req: DispatchRequest) -> anyhow::Result<DispatchOutcome> {
        self.dispatch_within(req, self.config.caller_budget).await
    }

    /// Authoritative line from the repository, or the caller's fields on a miss.
    fn resolve(&self, req: &DispatchRequest) -> PlacementRequest {
        match self.repo.get_line(&req.event_id, &req.line_id) {
            Some(line) => PlacementRequest {
                event_id: req.event_id.clone(),
                line_id: Some(line.id),
                selection: line.selection,
                price: line.price,
                stake_cents: req.stake_cents,
                fund_type: req.fund_type,
                param: line.param,
                market: Some(line.market),
            },
            None => {
                debug!("[DISPATCH] Line {} not in book, using caller fields", req.line_id);
                PlacementRequest {
                    event_id: req.event_id.clone(),
                    line_id: Some(req.line_id.clone()),
                    selection: req.selection.clone(),
                    price: req.price,
                    stake_cents: req.stake_cents,
                    fund_type: req.fund_type,
                    param: req.param,
                    market: req.market.clone(),
                }
            }
        }
    }

    /// Best-effort refresh; falls back to the last stored credential.
    async fn refresh_credential(&self, session: &Session) -> Option<String> {
        let captured = timeout(
            self.config.placement_timeout,
            self.placer.capture_current_credential(&session.id),
        )
        .await;

        match captured {
            Ok(Ok(CredentialCapture { success: true, token: Some(token), .. })) if !token.is_empty() => {
                self.sessions.store_credential(&session.id, token.clone());
                Some(token)
            }
            other => {
                let reason = match other {
                    Ok(Ok(c)) => c.error.unwrap_or_else(|| "no token".into()),
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "refresh timed out".into(),
                };
                let stored = self
                    .sessions
                    .credential(&session.id)
                    .or_else(|| session.credential.clone());
                if stored.is_some() {
                    debug!("[DISPATCH] {} refresh failed ({}), using stored credential", session.id, reason);
                } else {
                    warn!("[DISPATCH] {} refresh failed ({}) and no stored credential", session.id, reason);
                }
                stored
            }
        }
    }

    async fn attempt(&self, session: &Session, outbound: &PlacementRequest, locked: bool) -> Outcome {
        let Some(credential) = self.refresh_credential(session).await else {
            return Outcome::Unauthorized;
        };

        let call = if locked {
            self.placer.place_bet_replaying_template(session, &credential, outbound)
        } else {
            self.placer.place_bet(session, &credential, outbound)
        };

        match timeout(self.config.placement_timeout, call).await {
            Ok(Ok(resp)) => classify(&resp, locked, &self.config.accepted_codes),
            Ok(Err(e)) => classify_error(&e),
            Err(_) => classify_error(&PlacementError::Timeout(self.config.placement_timeout.as_millis() as u64)),
        }
    }

    async fn run_session(&self, session: Session, req: &DispatchRequest, fresh: &PlacementRequest) -> DispatchResult {
        let template = if req.use_locked_path {
            self.locks.get(&session.id, &req.line_id)
        } else {
            None
        };
        let locked = template.is_some();
        let outbound = match &template {
            Some(t) => t.with_stake(req.stake_cents),
            None => PlacementRequest { stake_cents: req.stake_cents, ..fresh.clone() },
        };

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            let outcome = self.attempt(&session, &outbound, locked).await;
            let retries_used = attempts - 1;
            if outcome.is_retryable() && retries_used < self.config.max_retries {
                let delay = backoff_delay(retries_used, self.config.backoff_base, self.config.backoff_cap);
                warn!(
                    "[DISPATCH] {} {} (attempt {}), retrying in {}ms",
                    session.id,
                    outcome.label(),
                    attempts,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            break outcome;
        };

        let success = outcome.is_success();
        if success && !locked && outbound.stake_cents == self.config.probe_stake_cents {
            self.locks.capture(
                session.id.clone(),
                req.line_id.clone(),
                LockedRequestTemplate::new(outbound.clone()),
            );
        }

        let confirmation = match &outcome {
            Outcome::Success { confirmation } => confirmation.clone(),
            _ => None,
        };
        let error = match (&outcome, outcome.is_retryable()) {
            (o, true) => Some(format!("{} after {} retries", o.label().replace('_', " "), attempts - 1)),
            (o, false) => o.error_text(),
        };

        if success {
            info!(
                "[DISPATCH] ✅ {} {} @ {:+}{} ({})",
                session.id,
                outbound.selection,
                outbound.price,
                if locked { " [locked]" } else { "" },
                confirmation.as_deref().unwrap_or("-")
            );
        } else {
            warn!("[DISPATCH] ❌ {} {}: {}", session.id, outcome.label(), error.as_deref().unwrap_or(""));
        }

        if let Some(audit) = &self.audit {
            audit.record_placement(AuditRecord::from_attempt(
                &session.id,
                &outbound,
                &outcome,
                attempts,
                locked,
            ));
        }

        DispatchResult {
            session_id: session.id.clone(),
            success,
            retryable: outcome.is_retryable() || outcome == Outcome::OddsChanged,
            unauthorized: outcome == Outcome::Unauthorized,
            rate_limited: outcome == Outcome::RateLimited,
            error,
            armed: self.locks.contains(&session.id, &req.line_id),
            outcome,
            attempts,
            locked_path: locked,
            confirmation,
        }
    }
}

/// Create a new dispatch request channel with bounded capacity
pub fn create_dispatch_channel() -> (mpsc::Sender<DispatchRequest>, mpsc::Receiver<DispatchRequest>) {
    mpsc::channel(256)
}

/// Dispatch loop: each request runs in its own task so a slow one never
/// holds up the next.
pub async fn run_dispatch_loop(mut rx: mpsc::Receiver<DispatchRequest>, dispatcher: Arc<Dispatcher>) {
    info!(
        "[DISPATCH] Dispatcher started (probe=${:.2}, retries={})",
        dispatcher.config.probe_stake_cents as f64 / 100.0,
        dispatcher.config.max_retries
    );

    while let Some(req) = rx.recv().await {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let summary = if req.stake_cents == dispatcher.config.probe_stake_cents && !req.use_locked_path {
                dispatcher.lock(&req).await
            } else {
                dispatcher.dispatch(&req).await
            };
            if !summary.any_success && !summary.results.is_empty() {
                error!(
                    "[DISPATCH] {} / {}: all {} sessions failed",
                    summary.event_id,
                    summary.line_id,
                    summary.failed_count
                );
            }
        });
    }

    info!("[DISPATCH] Dispatcher stopped");
}
