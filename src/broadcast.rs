//! Consumer fan-out for repository updates.
//!
//! Each consumer gets its own bounded channel, so one consumer's order is the
//! publish order and a slow consumer only loses its own pushes. Sends use
//! `try_send`; a full buffer drops the push and bumps a counter rather than
//! stalling the ingestion pipeline.

use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{CONSUMER_BUFFER, PRIORITY_REFRESH_MS, PRIORITY_TTL_SECS};
use crate::repository::OddsRepository;
use crate::types::{EventId, Line};

pub type ConsumerId = u64;

/// What a consumer receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    /// Lines that changed for a subscribed event
    OddsUpdate { event_id: EventId, lines: Vec<Line> },
    /// Something about this event changed; sent to every consumer, after
    /// the `OddsUpdate` for subscribers
    EventChanged { event_id: EventId },
    /// Full verified book, on subscribe and on every priority tick
    Snapshot { event_id: EventId, lines: Vec<Line> },
}

/// The single event the ingestion side should process, when set.
/// Cloning shares the same slot.
#[derive(Clone, Default, Debug)]
pub struct FocusFilter(Arc<RwLock<Option<EventId>>>);

impl FocusFilter {
    pub fn set(&self, event_id: EventId) {
        info!("[BCAST] Focus mode on {}", event_id);
        *self.0.write() = Some(event_id);
    }

    pub fn clear(&self) {
        if self.0.write().take().is_some() {
            info!("[BCAST] Focus mode off");
        }
    }

    pub fn current(&self) -> Option<EventId> {
        self.0.read().clone()
    }

    /// True when deltas for `event_id` should be processed.
    #[inline]
    pub fn admits(&self, event_id: &str) -> bool {
        match &*self.0.read() {
            Some(focus) => &**focus == event_id,
            None => true,
        }
    }
}

struct Consumer {
    tx: mpsc::Sender<Push>,
    events: FxHashSet<EventId>,
    priority: Option<JoinHandle<()>>,
}

impl Consumer {
    fn cancel_priority(&mut self) {
        if let Some(task) = self.priority.take() {
            task.abort();
        }
    }
}

pub struct Broadcaster {
    repo: Arc<OddsRepository>,
    consumers: DashMap<ConsumerId, Consumer>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    priority_ttl: Duration,
    priority_refresh: Duration,
}

impl Broadcaster {
    pub fn new(repo: Arc<OddsRepository>) -> Self {
        Self::with_priority_timing(
            repo,
            Duration::from_secs(PRIORITY_TTL_SECS),
            Duration::from_millis(PRIORITY_REFRESH_MS),
        )
    }

    pub fn with_priority_timing(repo: Arc<OddsRepository>, ttl: Duration, refresh: Duration) -> Self {
        Self {
            repo,
            consumers: DashMap::new(),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            priority_ttl: ttl,
            priority_refresh: refresh,
        }
    }

    /// Register a consumer and hand back its receiving end.
    pub fn connect(&self) -> (ConsumerId, mpsc::Receiver<Push>) {
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.consumers.insert(id, Consumer { tx, events: FxHashSet::default(), priority: None });
        debug!("[BCAST] Consumer {} connected ({} total)", id, self.consumers.len());
        (id, rx)
    }

    /// Follow an event. Sends the current snapshot immediately. With
    /// `priority`, also pushes a fresh snapshot on a fixed cadence until the
    /// priority window expires or the consumer unsubscribes.
    /// Returns false for an unknown consumer.
    pub fn subscribe(&self, consumer: ConsumerId, event_id: EventId, priority: bool) -> bool {
        let Some(mut entry) = self.consumers.get_mut(&consumer) else {
            return false;
        };

        entry.events.insert(event_id.clone());
        let lines = self.repo.snapshot(&event_id);
        let _ = self.deliver(&entry.tx, Push::Snapshot { event_id: event_id.clone(), lines });

        if priority {
            entry.cancel_priority();
            let task = self.spawn_priority(consumer, entry.tx.clone(), event_id.clone());
            entry.priority = Some(task);
            info!(
                "[BCAST] Consumer {} priority on {} for {}s",
                consumer, event_id, self.priority_ttl.as_secs()
            );
        }
        true
    }

    /// Drop every subscription (and any priority refresh) for a consumer.
    /// The consumer stays connected and keeps receiving `EventChanged`.
    pub fn unsubscribe(&self, consumer: ConsumerId) {
        if let Some(mut entry) = self.consumers.get_mut(&consumer) {
            entry.events.clear();
            entry.cancel_priority();
        }
    }

    pub fn disconnect(&self, consumer: ConsumerId) {
        if let Some((_, mut c)) = self.consumers.remove(&consumer) {
            c.cancel_priority();
            debug!("[BCAST] Consumer {} disconnected", consumer);
        }
    }

    /// Push changed lines to the event's subscribers, then an `EventChanged`
    /// notice to everyone, subscribers included.
    pub fn publish(&self, event_id: &EventId, lines: Vec<Line>) {
        let mut closed = Vec::new();
        for entry in self.consumers.iter() {
            let mut open = true;
            if entry.events.contains(event_id) && !lines.is_empty() {
                let update = Push::OddsUpdate { event_id: event_id.clone(), lines: lines.clone() };
                open = self.deliver(&entry.tx, update);
            }
            if open {
                open = self.deliver(&entry.tx, Push::EventChanged { event_id: event_id.clone() });
            }
            if !open {
                closed.push(*entry.key());
            }
        }
        self.reap(closed);
    }

    /// `EventChanged` to every consumer (event list views).
    pub fn notify_event_changed(&self, event_id: &EventId) {
        self.publish(event_id, Vec::new());
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Pushes lost to full consumer buffers since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns false when the consumer's receiver is gone.
    fn deliver(&self, tx: &mpsc::Sender<Push>, push: Push) -> bool {
        match tx.try_send(push) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed);
                if n % 1000 == 0 {
                    warn!("[BCAST] Slow consumer, {} pushes dropped so far", n + 1);
                }
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn reap(&self, closed: Vec<ConsumerId>) {
        for id in closed {
            self.disconnect(id);
        }
    }

    fn spawn_priority(&self, consumer: ConsumerId, tx: mpsc::Sender<Push>, event_id: EventId) -> JoinHandle<()> {
        let repo = self.repo.clone();
        let ttl = self.priority_ttl;
        let refresh = self.priority_refresh;

        tokio::spawn(async move {
            let deadline = Instant::now() + ttl;
            let mut tick = interval(refresh);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately; subscribe already sent that snapshot
            tick.tick().await;

            loop {
                tick.tick().await;
                if Instant::now() >= deadline {
                    break;
                }
                let lines = repo.snapshot(&event_id);
                match tx.try_send(Push::Snapshot { event_id: event_id.clone(), lines }) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => return,
                }
            }
            debug!("[BCAST] Consumer {} priority on {} expired", consumer, event_id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, GroupUpdate, MarketUpdate, OddsDelta, ProposalUpdate};

    fn repo_with_line() -> Arc<OddsRepository> {
        let repo = Arc::new(OddsRepository::default());
        repo.upsert_event(Event {
            id: "A".into(),
            home: "Lakers".into(),
            away: "Celtics".into(),
            score: None,
            status: String::new(),
            market_count: 0,
            external_key: None,
            live: true,
        });
        repo.ingest_odds_delta(&OddsDelta {
            event_id: "A".into(),
            markets: vec![MarketUpdate {
                market_name: "Spread".into(),
                groups: vec![GroupUpdate {
                    proposals: vec![ProposalUpdate {
                        key: "L1".into(),
                        event_description: "Lakers vs Celtics".into(),
                        market_name: None,
                        selection: "Lakers -4.5".into(),
                        price: -110,
                        previous_price: None,
                        param: Some(-4.5),
                        suspended: false,
                    }],
                }],
            }],
        });
        repo
    }

    fn drain(rx: &mut mpsc::Receiver<Push>) -> Vec<Push> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    #[tokio::test]
    async fn test_subscribers_get_odds_others_get_notice() {
        let repo = repo_with_line();
        let bcast = Broadcaster::new(repo.clone());
        let (watcher, mut watcher_rx) = bcast.connect();
        let (_lister, mut lister_rx) = bcast.connect();

        assert!(bcast.subscribe(watcher, "A".into(), false));
        assert!(matches!(drain(&mut watcher_rx).as_slice(), [Push::Snapshot { lines, .. }] if lines.len() == 1));

        bcast.publish(&"A".into(), repo.get_lines("A"));

        let pushes = drain(&mut watcher_rx);
        assert!(matches!(pushes.as_slice(), [Push::OddsUpdate { lines, .. }, Push::EventChanged { .. }] if lines[0].price == -110));
        assert_eq!(drain(&mut lister_rx), vec![Push::EventChanged { event_id: "A".into() }]);
    }

    #[tokio::test]
    async fn test_publish_order_is_preserved_per_consumer() {
        let bcast = Broadcaster::new(repo_with_line());
        let (c, mut rx) = bcast.connect();
        for id in ["E1", "E2", "E3"] {
            bcast.notify_event_changed(&id.into());
        }
        let ids: Vec<String> = drain(&mut rx)
            .into_iter()
            .map(|p| match p {
                Push::EventChanged { event_id } => event_id.to_string(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["E1", "E2", "E3"]);
        assert!(bcast.subscribe(c, "E1".into(), false));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_instead_of_blocking() {
        let bcast = Broadcaster::new(repo_with_line());
        let (_c, _rx) = bcast.connect();
        for _ in 0..CONSUMER_BUFFER + 10 {
            bcast.notify_event_changed(&"A".into());
        }
        assert_eq!(bcast.dropped(), 10);
        assert_eq!(bcast.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_consumer_is_reaped() {
        let bcast = Broadcaster::new(repo_with_line());
        let (_c, rx) = bcast.connect();
        drop(rx);
        bcast.notify_event_changed(&"A".into());
        assert_eq!(bcast.consumer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_refresh_expires_after_ttl() {
        let bcast = Broadcaster::new(repo_with_line());
        let (c, mut rx) = bcast.connect();
        bcast.subscribe(c, "A".into(), true);

        tokio::time::sleep(Duration::from_secs(PRIORITY_TTL_SECS + 5)).await;
        let snapshots = drain(&mut rx)
            .into_iter()
            .filter(|p| matches!(p, Push::Snapshot { .. }))
            .count();
        // One on subscribe plus roughly one per second of the window
        assert!((29..=31).contains(&snapshots), "got {snapshots}");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_cancels_priority() {
        let bcast = Broadcaster::new(repo_with_line());
        let (c, mut rx) = bcast.connect();
        bcast.subscribe(c, "A".into(), true);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        bcast.unsubscribe(c);
        assert!(!drain(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut rx).is_empty());

        // Still connected for list notices
        bcast.notify_event_changed(&"A".into());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_focus_filter_admits_only_focus() {
        let focus = FocusFilter::default();
        assert!(focus.admits("A") && focus.admits("B"));

        let shared = focus.clone();
        shared.set("A".into());
        assert!(focus.admits("A"));
        assert!(!focus.admits("B"));

        focus.clear();
        assert!(shared.admits("B"));
        assert_eq!(shared.current(), None);
    }
}
