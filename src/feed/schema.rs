//! Wire-level JSON shapes for inbound feed frames.
//!
//! Frames are parsed into a `serde_json::Value` first so the envelope can be
//! routed on its keys, then each payload is deserialized into the strict
//! structs below and converted into the domain types in `crate::types`.
//! Unknown extra fields are tolerated; missing or mistyped required fields
//! reject the whole frame.

use serde::de::Error as _;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::types::{
    AmericanOdds, Event, EventId, FeedMessage, GroupUpdate, MarketUpdate, OddsDelta, ProposalUpdate,
    Scoreline,
};

/// Suffix shared by every per-event odds update key
pub const SUBFEEDS_SUFFIX: &str = "_subfeeds_update";

/// Upstream ids arrive as either strings or integers.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

impl WireId {
    fn into_arc(self) -> EventId {
        match self {
            WireId::Text(s) => s.into(),
            WireId::Number(n) => n.to_string().into(),
        }
    }
}

/// Prices arrive as integers or signed strings ("+145", "-110").
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum WireOdds {
    Number(i64),
    Text(String),
}

impl WireOdds {
    fn parse(self) -> Result<AmericanOdds, serde_json::Error> {
        let n = match self {
            WireOdds::Number(n) => n,
            WireOdds::Text(s) => s
                .trim()
                .trim_start_matches('+')
                .parse::<i64>()
                .map_err(|_| serde_json::Error::custom(format!("bad odds value {s:?}")))?,
        };
        AmericanOdds::try_from(n).map_err(|_| serde_json::Error::custom(format!("odds out of range: {n}")))
    }
}

#[derive(Deserialize, Debug)]
struct WireScore {
    home: u32,
    away: u32,
}

#[derive(Deserialize, Debug)]
struct WireConflict {
    #[serde(alias = "id")]
    conflict_id: WireId,
    home: String,
    away: String,
    #[serde(default)]
    score: Option<WireScore>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "markets_count")]
    market_count: Option<u32>,
    #[serde(default, alias = "deeplink_key")]
    external_key: Option<String>,
}

impl WireConflict {
    fn into_event(self, live: bool) -> Event {
        Event {
            id: self.conflict_id.into_arc(),
            home: self.home,
            away: self.away,
            score: self.score.map(|s| Scoreline { home: s.home, away: s.away }),
            status: self.status.unwrap_or_default(),
            market_count: self.market_count.unwrap_or(0),
            external_key: self.external_key,
            live,
        }
    }
}

#[derive(Deserialize, Debug)]
struct WireProposal {
    key: WireId,
    #[serde(default)]
    event_description: String,
    #[serde(default)]
    market_name: Option<String>,
    selection: String,
    odds: WireOdds,
    #[serde(default)]
    previous_odds: Option<WireOdds>,
    #[serde(default)]
    param: Option<f64>,
    #[serde(default)]
    suspended: Option<bool>,
}

impl WireProposal {
    fn into_update(self) -> Result<ProposalUpdate, serde_json::Error> {
        Ok(ProposalUpdate {
            key: self.key.into_arc(),
            event_description: self.event_description,
            market_name: self.market_name,
            selection: self.selection,
            price: self.odds.parse()?,
            previous_price: self.previous_odds.map(WireOdds::parse).transpose()?,
            param: self.param,
            suspended: self.suspended.unwrap_or(false),
        })
    }
}

#[derive(Deserialize, Debug)]
struct WireGroup {
    #[serde(default)]
    proposals: Vec<WireProposal>,
}

#[derive(Deserialize, Debug)]
struct WireMarket {
    market_name: String,
    #[serde(default)]
    groups: Vec<WireGroup>,
}

#[derive(Deserialize, Debug)]
struct WireSubfeedsUpdate {
    conflict_id: WireId,
    #[serde(default)]
    market_updates: Vec<WireMarket>,
}

impl WireSubfeedsUpdate {
    fn into_delta(self) -> Result<OddsDelta, serde_json::Error> {
        let markets = self
            .market_updates
            .into_iter()
            .map(|m| {
                let groups = m
                    .groups
                    .into_iter()
                    .map(|g| {
                        let proposals = g
                            .proposals
                            .into_iter()
                            .map(WireProposal::into_update)
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok(GroupUpdate { proposals })
                    })
                    .collect::<Result<Vec<_>, serde_json::Error>>()?;
                Ok(MarketUpdate { market_name: m.market_name, groups })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        Ok(OddsDelta { event_id: self.conflict_id.into_arc(), markets })
    }
}

fn events_from(value: Value, live: bool) -> Result<Vec<Event>, DecodeError> {
    let conflicts: Vec<WireConflict> = serde_json::from_value(value).map_err(DecodeError::Schema)?;
    Ok(conflicts.into_iter().map(|c| c.into_event(live)).collect())
}

fn subfeeds_key(obj: &Map<String, Value>) -> Option<String> {
    obj.keys().find(|k| k.ends_with(SUBFEEDS_SUFFIX)).cloned()
}

/// Route a parsed envelope to its typed message.
pub fn into_feed_message(value: Value) -> Result<FeedMessage, DecodeError> {
    let Value::Object(mut obj) = value else {
        return Err(DecodeError::Schema(serde_json::Error::custom("frame is not a JSON object")));
    };

    let message_name = obj
        .get("message_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if let Some(live) = obj.remove("inplay_conflicts") {
        return Ok(FeedMessage::LiveEventsUpdate(events_from(live, true)?));
    }
    if let Some(upcoming) = obj.remove("prematch_conflicts") {
        return Ok(FeedMessage::UpcomingEventsUpdate(events_from(upcoming, false)?));
    }
    if let Some(key) = subfeeds_key(&obj) {
        let payload = obj.remove(&key).unwrap_or(Value::Null);
        let update: WireSubfeedsUpdate = serde_json::from_value(payload).map_err(DecodeError::Schema)?;
        return update.into_delta().map(FeedMessage::OddsDelta).map_err(DecodeError::Schema);
    }

    Ok(FeedMessage::Unrecognized { message_name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inplay_conflicts_become_live_events() {
        let msg = into_feed_message(json!({
            "message_name": "inplay_update",
            "inplay_conflicts": [
                {"conflict_id": 9912, "home": "Lakers", "away": "Celtics",
                 "score": {"home": 54, "away": 61}, "status": "Q3 04:12",
                 "markets_count": 87, "deeplink_key": "nba-lal-bos", "league": "NBA"}
            ]
        }))
        .unwrap();

        let FeedMessage::LiveEventsUpdate(events) = msg else { panic!("expected live events") };
        assert_eq!(events.len(), 1);
        assert_eq!(&*events[0].id, "9912");
        assert_eq!(events[0].score, Some(Scoreline { home: 54, away: 61 }));
        assert_eq!(events[0].market_count, 87);
        assert!(events[0].live);
    }

    #[test]
    fn test_prematch_conflicts_are_not_live() {
        let msg = into_feed_message(json!({
            "prematch_conflicts": [{"id": "E7", "home": "Duke Blue Devils", "away": "UNC Tar Heels"}]
        }))
        .unwrap();
        let FeedMessage::UpcomingEventsUpdate(events) = msg else { panic!("expected upcoming") };
        assert!(!events[0].live);
        assert_eq!(events[0].status, "");
    }

    #[test]
    fn test_subfeeds_update_becomes_odds_delta() {
        let msg = into_feed_message(json!({
            "message_name": "conflict_subfeeds_update",
            "conflict_subfeeds_update": {
                "conflict_id": "A",
                "market_updates": [{
                    "market_name": "Spread",
                    "groups": [{"proposals": [
                        {"key": "p-1", "event_description": "Lakers vs Celtics",
                         "selection": "Lakers -4.5", "odds": -110, "previous_odds": "-105",
                         "param": -4.5},
                        {"key": 77, "event_description": "Lakers vs Celtics",
                         "selection": "Celtics +4.5", "odds": "+100", "suspended": true}
                    ]}]
                }]
            }
        }))
        .unwrap();

        let FeedMessage::OddsDelta(delta) = msg else { panic!("expected odds delta") };
        assert_eq!(&*delta.event_id, "A");
        let props: Vec<_> = delta.proposals().map(|(_, p)| p.clone()).collect();
        assert_eq!(props[0].price, -110);
        assert_eq!(props[0].previous_price, Some(-105));
        assert_eq!(props[0].param, Some(-4.5));
        assert_eq!(&*props[1].key, "77");
        assert_eq!(props[1].price, 100);
        assert!(props[1].suspended);
    }

    #[test]
    fn test_unknown_envelope_is_unrecognized() {
        let msg = into_feed_message(json!({"message_name": "server_hello", "server_ts": 1})).unwrap();
        assert_eq!(msg, FeedMessage::Unrecognized { message_name: "server_hello".into() });
    }

    #[test]
    fn test_malformed_proposal_rejects_frame() {
        let err = into_feed_message(json!({
            "x_subfeeds_update": {
                "conflict_id": "A",
                "market_updates": [{"market_name": "Spread", "groups": [{"proposals": [
                    {"key": "p-1", "selection": "Lakers", "odds": "evens"}
                ]}]}]
            }
        }))
        .unwrap_err();
        assert!(matches!(err, DecodeError::Schema(_)));
    }

    #[test]
    fn test_non_object_frame_is_schema_error() {
        assert!(matches!(into_feed_message(json!([1, 2, 3])), Err(DecodeError::Schema(_))));
    }
}
