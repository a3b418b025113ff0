//! Locked-request cache for lock-and-load placement.
//!
//! A probe placement at the minimum stake that the venue accepts is captured
//! here per (session, line). A later full-stake placement replays the exact
//! captured request with only the stake replaced. Replay never re-reads the
//! odds book: a successful lock means the line was valid at lock time.

use dashmap::DashMap;
use tracing::{debug, info};

use crate::dispatch::PlacementRequest;
use crate::types::{now_ms, LineId, SessionId, StakeCents};

/// The accepted probe request, stored verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct LockedRequestTemplate {
    pub request: PlacementRequest,
    pub captured_at_ms: i64,
}

impl LockedRequestTemplate {
    pub fn new(request: PlacementRequest) -> Self {
        Self { request, captured_at_ms: now_ms() }
    }

    /// The captured request with only the stake substituted.
    pub fn with_stake(&self, stake_cents: StakeCents) -> PlacementRequest {
        PlacementRequest { stake_cents, ..self.request.clone() }
    }

    pub fn age_ms(&self) -> i64 {
        now_ms() - self.captured_at_ms
    }
}

#[derive(Default)]
pub struct LockedRequestCache {
    templates: DashMap<(SessionId, LineId), LockedRequestTemplate>,
}

impl LockedRequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a template. A newer probe for the same key replaces the old one.
    pub fn capture(&self, session: SessionId, line: LineId, template: LockedRequestTemplate) {
        info!(
            "[LOCK] Captured {} / {} | {} @ {:+}",
            session, line, template.request.selection, template.request.price
        );
        if let Some(old) = self.templates.insert((session, line), template) {
            debug!("[LOCK] Replaced template captured {}ms ago", old.age_ms());
        }
    }

    pub fn get(&self, session: &SessionId, line: &LineId) -> Option<LockedRequestTemplate> {
        self.templates
            .get(&(session.clone(), line.clone()))
            .map(|t| t.clone())
    }

    pub fn contains(&self, session: &SessionId, line: &LineId) -> bool {
        self.templates.contains_key(&(session.clone(), line.clone()))
    }

    /// Forget everything captured for a session (credential reset, logout).
    pub fn remove_session(&self, session: &str) -> usize {
        let before = self.templates.len();
        self.templates.retain(|(s, _), _| &**s != session);
        before - self.templates.len()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
