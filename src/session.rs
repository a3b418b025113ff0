//! Betting profiles as seen by the dispatcher.
//!
//! Session lifecycle belongs to the browser-automation sidecar. This registry
//! only mirrors what dispatch needs: readiness, capability and the last known
//! bearer credential.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{now_ms, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Live,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ScrapingOnly,
    Betting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub capability: Capability,
    /// Last known bearer credential; opaque
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub credential_updated_ms: Option<i64>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, capability: Capability) -> Self {
        Self {
            id: id.into(),
            state: SessionState::Live,
            capability,
            credential: None,
            credential_updated_ms: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self.credential_updated_ms = Some(now_ms());
        self
    }

    /// Live and allowed to place bets
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Live && self.capability == Capability::Betting
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `id[:scrape][,id...]`. Entries without a suffix are betting-enabled.
    pub fn from_profiles(profiles: &str) -> Self {
        let registry = Self::new();
        for entry in profiles.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (id, capability) = match entry.split_once(':') {
                Some((id, "scrape")) => (id, Capability::ScrapingOnly),
                Some((id, _)) => (id, Capability::Betting),
                None => (entry, Capability::Betting),
            };
            registry.upsert(Session::new(id, capability));
        }
        registry
    }

    /// Insert or replace. A replacement without a credential keeps the
    /// credential already on file.
    pub fn upsert(&self, mut session: Session) {
        if let Some(existing) = self.sessions.get(&session.id) {
            if session.credential.is_none() {
                session.credential = existing.credential.clone();
                session.credential_updated_ms = existing.credential_updated_ms;
            }
        }
        debug!("[DISPATCH] Session {} {:?}/{:?}", session.id, session.state, session.capability);
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn set_state(&self, id: &str, state: SessionState) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut s) => {
                if s.state != state {
                    info!("[DISPATCH] Session {} -> {:?}", id, state);
                }
                s.state = state;
                true
            }
            None => false,
        }
    }

    pub fn store_credential(&self, id: &str, credential: String) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            s.credential = Some(credential);
            s.credential_updated_ms = Some(now_ms());
        }
    }

    pub fn credential(&self, id: &str) -> Option<String> {
        self.sessions.get(id).and_then(|s| s.credential.clone())
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Ready sessions, ordered by id for stable result ordering.
    pub fn ready_sessions(&self) -> Vec<Session> {
        let mut ready: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.is_ready())
            .map(|s| s.clone())
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));
        ready
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
