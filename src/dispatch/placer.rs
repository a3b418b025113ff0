//! The placement collaborator: whatever actually talks to the venue on behalf
//! of a session.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::error::PlacementError;
use crate::session::Session;
use crate::types::{AmericanOdds, EventId, FundType, LineId, SessionId, StakeCents};

/// Outbound wager as handed to the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub event_id: EventId,
    pub line_id: Option<LineId>,
    pub selection: String,
    pub price: AmericanOdds,
    pub stake_cents: StakeCents,
    pub fund_type: FundType,
    pub param: Option<f64>,
    pub market: Option<String>,
}

/// What the collaborator reports back. `status` is the upstream HTTP status
/// when the collaborator knows it; `response` is the raw venue body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub odds_changed: bool,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub response: Option<Value>,
}

impl PlacementResponse {
    /// Venue confirmation code, under any of the names it has been seen with
    pub fn confirmation_code(&self) -> Option<i64> {
        let body = self.response.as_ref()?;
        ["code", "confirmation_code", "status_code"]
            .iter()
            .find_map(|k| body.get(*k).and_then(Value::as_i64))
    }

    /// Venue bet/ticket identifier, if one came back
    pub fn bet_id(&self) -> Option<String> {
        let body = self.response.as_ref()?;
        ["bet_id", "betId", "ticket_id"].iter().find_map(|k| match body.get(*k)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialCapture {
    pub success: bool,
    #[serde(default)]
    pub token: Option<String>,
    /// Where the token came from (storage, network capture, ...)
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait BetPlacer: Send + Sync {
    /// Fresh placement at a live-checked price.
    async fn place_bet(
        &self,
        session: &Session,
        credential: &str,
        req: &PlacementRequest,
    ) -> Result<PlacementResponse, PlacementError>;

    /// Replay a previously accepted request. The venue-side odds check is
    /// skipped; `req` is sent as given.
    async fn place_bet_replaying_template(
        &self,
        session: &Session,
        credential: &str,
        req: &PlacementRequest,
    ) -> Result<PlacementResponse, PlacementError>;

    async fn capture_current_credential(&self, session: &SessionId) -> Result<CredentialCapture, PlacementError>;
}

// === HTTP bridge to the automation sidecar ===

pub struct HttpSessionBridge {
    http: Client,
    base_url: String,
}

impl HttpSessionBridge {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PlacementError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    async fn post_bet(
        &self,
        path: &str,
        session: &Session,
        credential: &str,
        req: &PlacementRequest,
    ) -> Result<PlacementResponse, PlacementError> {
        let url = format!("{}/sessions/{}/{}", self.base_url, session.id, path);
        let res = self
            .http
            .post(&url)
            .bearer_auth(credential)
            .json(&json!({ "request": req }))
            .send()
            .await?;

        let status = res.status().as_u16();
        let text = res.text().await?;
        let mut parsed = match serde_json::from_str::<PlacementResponse>(&text) {
            Ok(parsed) => parsed,
            Err(_) if !(200..300).contains(&status) => PlacementResponse {
                success: false,
                error: Some(text.chars().take(300).collect()),
                ..Default::default()
            },
            Err(e) => return Err(PlacementError::Body(e.to_string())),
        };
        parsed.status.get_or_insert(status);
        Ok(parsed)
    }
}

#[async_trait]
impl BetPlacer for HttpSessionBridge {
    async fn place_bet(
        &self,
        session: &Session,
        credential: &str,
        req: &PlacementRequest,
    ) -> Result<PlacementResponse, PlacementError> {
        self.post_bet("bets", session, credential, req).await
    }

    async fn place_bet_replaying_template(
        &self,
        session: &Session,
        credential: &str,
        req: &PlacementRequest,
    ) -> Result<PlacementResponse, PlacementError> {
        self.post_bet("bets/replay", session, credential, req).await
    }

    async fn capture_current_credential(&self, session: &SessionId) -> Result<CredentialCapture, PlacementError> {
        let url = format!("{}/sessions/{}/credential", self.base_url, session);
        let res = self.http.post(&url).send().await?;
        if !res.status().is_success() {
            return Ok(CredentialCapture {
                success: false,
                source: "bridge".into(),
                error: Some(format!("bridge returned {}", res.status())),
                ..Default::default()
            });
        }
        Ok(res.json::<CredentialCapture>().await?)
    }
}

// === Dry run ===

/// Accepts everything without touching the venue.
#[derive(Default)]
pub struct DryRunPlacer {
    placed: AtomicU64,
}

impl DryRunPlacer {
    pub fn new() -> Self {
        Self::default()
    }

    fn accept(&self, session: &Session, req: &PlacementRequest, replay: bool) -> PlacementResponse {
        let n = self.placed.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "[DISPATCH] DRY RUN {} | {} | {} @ {:+} | ${:.2}{}",
            session.id,
            req.event_id,
            req.selection,
            req.price,
            req.stake_cents as f64 / 100.0,
            if replay { " (locked)" } else { "" }
        );
        PlacementResponse {
            success: true,
            status: Some(200),
            response: Some(json!({ "code": 0, "bet_id": format!("dry-{n}") })),
            ..Default::default()
        }
    }
}

#[async_trait]
impl BetPlacer for DryRunPlacer {
    async fn place_bet(
        &self,
        session: &Session,
        _credential: &str,
        req: &PlacementRequest,
    ) -> Result<PlacementResponse, PlacementError> {
        Ok(self.accept(session, req, false))
    }

    async fn place_bet_replaying_template(
        &self,
        session: &Session,
        _credential: &str,
        req: &PlacementRequest,
    ) -> Result<PlacementResponse, PlacementError> {
        Ok(self.accept(session, req, true))
    }

    async fn capture_current_credential(&self, _session: &SessionId) -> Result<CredentialCapture, PlacementError> {
        Ok(CredentialCapture {
            success: true,
            token: Some("dry-run".into()),
            source: "dry_run".into(),
            error: None,
        })
    }
}
