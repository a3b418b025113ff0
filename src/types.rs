//! Core type definitions for events, odds lines and feed messages.
//!
//! These are the decoded, strictly typed forms of what the upstream feed
//! sends. Wire-level JSON shapes live in `feed::schema` and are converted into
//! these types at the decode boundary.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Upstream event identifier
pub type EventId = Arc<str>;

/// Stable upstream proposal key
pub type LineId = Arc<str>;

/// Betting profile identifier
pub type SessionId = Arc<str>;

/// American-style odds (e.g. -110, +145)
pub type AmericanOdds = i32;

/// Stake in cents
pub type StakeCents = u32;

// === Events ===

/// Live scoreline, home first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scoreline {
    pub home: u32,
    pub away: u32,
}

impl std::fmt::Display for Scoreline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.home, self.away)
    }
}

/// One live or upcoming contest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub home: String,
    pub away: String,
    pub score: Option<Scoreline>,
    /// Free-text status from upstream ("2nd Half", "Q3 04:12", ...)
    pub status: String,
    /// Upstream's estimate of how many markets are open
    pub market_count: u32,
    /// Correlation key used to deep-link into the venue
    pub external_key: Option<String>,
    /// True when the event arrived in a live (in-play) update
    pub live: bool,
}

// === Odds lines ===

/// One bettable price for one selection within one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: LineId,
    pub event_id: EventId,
    pub market: String,
    pub selection: String,
    /// Handicap or total, when the market has one
    pub param: Option<f64>,
    pub price: AmericanOdds,
    /// Price before the most recent change. On first sighting, upstream's own
    /// previous price when it sends one.
    pub previous_price: Option<AmericanOdds>,
    /// Upstream's event text for this line. Used only to verify ownership.
    pub event_description: String,
    pub suspended: bool,
    /// Last time this line was touched by the feed (ms since epoch)
    pub updated_at_ms: i64,
}

/// A line that was created or changed by an ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct LineChange {
    pub line: Line,
    /// Signed price move; None for a first sighting
    pub delta: Option<i32>,
}

impl LineChange {
    #[inline]
    pub fn is_new(&self) -> bool {
        self.delta.is_none()
    }
}

// === Feed messages ===

/// One proposal inside an odds delta.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalUpdate {
    pub key: LineId,
    pub event_description: String,
    /// Overrides the enclosing market name when upstream sends one
    pub market_name: Option<String>,
    pub selection: String,
    pub price: AmericanOdds,
    pub previous_price: Option<AmericanOdds>,
    pub param: Option<f64>,
    pub suspended: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupUpdate {
    pub proposals: Vec<ProposalUpdate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketUpdate {
    pub market_name: String,
    pub groups: Vec<GroupUpdate>,
}

/// Nested market → group → proposal update batch for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct OddsDelta {
    pub event_id: EventId,
    pub markets: Vec<MarketUpdate>,
}

impl OddsDelta {
    /// Flatten to (market name, proposal) pairs in wire order.
    pub fn proposals(&self) -> impl Iterator<Item = (&str, &ProposalUpdate)> {
        self.markets.iter().flat_map(|m| {
            m.groups.iter().flat_map(move |g| {
                g.proposals
                    .iter()
                    .map(move |p| (p.market_name.as_deref().unwrap_or(m.market_name.as_str()), p))
            })
        })
    }

    pub fn proposal_count(&self) -> usize {
        self.markets
            .iter()
            .flat_map(|m| m.groups.iter())
            .map(|g| g.proposals.len())
            .sum()
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    LiveEventsUpdate(Vec<Event>),
    UpcomingEventsUpdate(Vec<Event>),
    OddsDelta(OddsDelta),
    Unrecognized { message_name: String },
}

impl FeedMessage {
    pub fn kind(&self) -> &str {
        match self {
            FeedMessage::LiveEventsUpdate(_) => "live_events",
            FeedMessage::UpcomingEventsUpdate(_) => "upcoming_events",
            FeedMessage::OddsDelta(_) => "odds_delta",
            FeedMessage::Unrecognized { message_name } => message_name,
        }
    }
}

// === Dispatch ===

/// Which balance a wager draws from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundType {
    #[default]
    Cash,
    Bonus,
}

impl std::fmt::Display for FundType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FundType::Cash => write!(f, "cash"),
            FundType::Bonus => write!(f, "bonus"),
        }
    }
}

/// Caller-facing placement request, run across every ready session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub event_id: EventId,
    pub line_id: LineId,
    /// Caller's view of the selection; used only if the repository misses
    pub selection: String,
    pub price: AmericanOdds,
    pub market: Option<String>,
    pub param: Option<f64>,
    pub stake_cents: StakeCents,
    /// Replay a captured template when one exists for the session
    pub use_locked_path: bool,
    #[serde(default)]
    pub fund_type: FundType,
}

/// Current time in milliseconds since the Unix epoch
#[inline]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
