//! Ingestion: decoded feed messages into the repository, changes out to consumers.

use rustc_hash::FxHashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broadcast::{Broadcaster, FocusFilter};
use crate::feed::{event_topic, FeedHandle};
use crate::repository::OddsRepository;
use crate::types::{Event, EventId, FeedMessage};

pub struct Pipeline {
    repo: Arc<OddsRepository>,
    broadcaster: Arc<Broadcaster>,
    focus: FocusFilter,
    feed: Option<FeedHandle>,
    auto_subscribe_live: bool,
    subscribed: FxHashSet<EventId>,
    filtered: u64,
}

impl Pipeline {
    pub fn new(repo: Arc<OddsRepository>, broadcaster: Arc<Broadcaster>, focus: FocusFilter) -> Self {
        Self {
            repo,
            broadcaster,
            focus,
            feed: None,
            auto_subscribe_live: false,
            subscribed: FxHashSet::default(),
            filtered: 0,
        }
    }

    /// Subscribe to each live event's subfeed the first time it appears.
    pub fn with_feed(mut self, feed: FeedHandle, auto_subscribe_live: bool) -> Self {
        self.feed = Some(feed);
        self.auto_subscribe_live = auto_subscribe_live;
        self
    }

    /// Deltas dropped by focus mode so far
    pub fn filtered(&self) -> u64 {
        self.filtered
    }

    pub fn apply(&mut self, msg: FeedMessage) {
        match msg {
            FeedMessage::LiveEventsUpdate(events) => self.apply_events(events),
            FeedMessage::UpcomingEventsUpdate(events) => self.apply_events(events),
            FeedMessage::OddsDelta(delta) => {
                // Focus mode: other events never reach the repository
                if !self.focus.admits(&delta.event_id) {
                    self.filtered += 1;
                    return;
                }
                let changes = self.repo.ingest_odds_delta(&delta);
                if !changes.is_empty() {
                    let lines = changes.into_iter().map(|c| c.line).collect();
                    self.broadcaster.publish(&delta.event_id, lines);
                }
            }
            FeedMessage::Unrecognized { message_name } => {
                debug!("[FEED] Ignoring {}", message_name);
            }
        }
    }

    fn apply_events(&mut self, events: Vec<Event>) {
        for event in events {
            let id = event.id.clone();
            let live = event.live;
            if self.repo.upsert_event(event) {
                self.broadcaster.notify_event_changed(&id);
            }
            if live && self.auto_subscribe_live && !self.subscribed.contains(&id) {
                if let Some(feed) = &self.feed {
                    if feed.subscribe(event_topic(&id)) {
                        self.subscribed.insert(id);
                    }
                }
            }
        }
    }
}

/// Drain decoded feed messages until the feed side hangs up.
pub async fn run_ingestion(mut rx: mpsc::Receiver<FeedMessage>, mut pipeline: Pipeline) {
    info!("[ODDS] Ingestion started");
    while let Some(msg) = rx.recv().await {
        pipeline.apply(msg);
    }
    info!("[ODDS] Ingestion stopped ({} deltas filtered by focus)", pipeline.filtered());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Push;
    use crate::types::{GroupUpdate, MarketUpdate, OddsDelta, ProposalUpdate};

    fn event(id: &str, home: &str, away: &str) -> Event {
        Event {
            id: id.into(),
            home: home.into(),
            away: away.into(),
            score: None,
            status: "Q1".into(),
            market_count: 10,
            external_key: None,
            live: true,
        }
    }

    fn delta(event_id: &str, desc: &str, key: &str, price: i32) -> FeedMessage {
        FeedMessage::OddsDelta(OddsDelta {
            event_id: event_id.into(),
            markets: vec![MarketUpdate {
                market_name: "Moneyline".into(),
                groups: vec![GroupUpdate {
                    proposals: vec![ProposalUpdate {
                        key: key.into(),
                        event_description: desc.into(),
                        market_name: None,
                        selection: "Home".into(),
                        price,
                        previous_price: None,
                        param: None,
                        suspended: false,
                    }],
                }],
            }],
        })
    }

    fn setup() -> (Pipeline, Arc<OddsRepository>, Arc<Broadcaster>, FocusFilter) {
        let repo = Arc::new(OddsRepository::default());
        let bcast = Arc::new(Broadcaster::new(repo.clone()));
        let focus = FocusFilter::default();
        (Pipeline::new(repo.clone(), bcast.clone(), focus.clone()), repo, bcast, focus)
    }

    #[tokio::test]
    async fn test_delta_reaches_subscribed_consumer() {
        let (mut pipeline, repo, bcast, _) = setup();
        pipeline.apply(FeedMessage::LiveEventsUpdate(vec![event("A", "Lakers", "Celtics")]));

        let (id, mut rx) = bcast.connect();
        assert!(bcast.subscribe(id, "A".into(), false));
        assert!(matches!(rx.recv().await, Some(Push::Snapshot { .. })));

        pipeline.apply(delta("A", "Lakers vs Celtics", "L1", -110));
        match rx.recv().await {
            Some(Push::OddsUpdate { event_id, lines }) => {
                assert_eq!(&*event_id, "A");
                assert_eq!(lines[0].price, -110);
            }
            other => panic!("unexpected {:?}", other),
        }
        // Subscribers also get the list notice
        assert!(matches!(rx.recv().await, Some(Push::EventChanged { .. })));
        assert_eq!(repo.get_lines("A").len(), 1);
    }

    #[tokio::test]
    async fn test_focus_mode_drops_other_events() {
        let (mut pipeline, repo, _, focus) = setup();
        pipeline.apply(FeedMessage::LiveEventsUpdate(vec![
            event("A", "Lakers", "Celtics"),
            event("B", "Duke", "North Carolina"),
        ]));
        focus.set("A".into());

        pipeline.apply(delta("B", "Duke vs North Carolina", "L9", 120));
        pipeline.apply(delta("A", "Lakers vs Celtics", "L1", -110));

        assert!(repo.get_lines("B").is_empty());
        assert_eq!(repo.get_lines("A").len(), 1);
        assert_eq!(pipeline.filtered(), 1);

        focus.clear();
        pipeline.apply(delta("B", "Duke vs North Carolina", "L9", 120));
        assert_eq!(repo.get_lines("B").len(), 1);
    }

    #[tokio::test]
    async fn test_event_change_notifies_everyone() {
        let (mut pipeline, _, bcast, _) = setup();
        let (_, mut rx) = bcast.connect();

        pipeline.apply(FeedMessage::LiveEventsUpdate(vec![event("A", "Lakers", "Celtics")]));
        assert!(matches!(rx.recv().await, Some(Push::EventChanged { .. })));

        // Unchanged event: no push
        pipeline.apply(FeedMessage::LiveEventsUpdate(vec![event("A", "Lakers", "Celtics")]));
        assert!(rx.try_recv().is_err());
    }
}
