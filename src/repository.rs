//! Verified per-event odds book.
//!
//! The repository is the single owner of event and line state. The ingestion
//! pipeline is its only writer; dispatch attempts and broadcaster pushes read
//! it concurrently. Every line passes the ownership check in
//! [`crate::verification`] before it is stored.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::config::RepositoryConfig;
use crate::types::{now_ms, Event, EventId, Line, LineChange, LineId, OddsDelta};
use crate::verification::match_signals;

/// Rejections logged at warn level before dropping to debug
const REJECT_WARN_LIMIT: u64 = 20;

/// One event and the lines attributed to it.
#[derive(Debug, Clone)]
struct EventBook {
    event: Event,
    lines: FxHashMap<LineId, Line>,
}

impl EventBook {
    fn new(event: Event) -> Self {
        Self { event, lines: FxHashMap::default() }
    }
}

/// Point-in-time counters for the status log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub events: usize,
    pub lines: usize,
    /// Lines dropped by the ownership check since startup
    pub rejected: u64,
    /// Deltas dropped because their event was never announced
    pub orphaned: u64,
}

pub struct OddsRepository {
    books: RwLock<FxHashMap<EventId, EventBook>>,
    config: RepositoryConfig,
    rejected: AtomicU64,
    orphaned: AtomicU64,
}

impl OddsRepository {
    pub fn new(config: RepositoryConfig) -> Self {
        Self {
            books: RwLock::new(FxHashMap::default()),
            config,
            rejected: AtomicU64::new(0),
            orphaned: AtomicU64::new(0),
        }
    }

    /// Insert or replace an event by id. Stored lines are kept.
    /// Returns true when anything visible about the event changed.
    pub fn upsert_event(&self, event: Event) -> bool {
        let mut books = self.books.write();
        match books.get_mut(&event.id) {
            Some(book) if book.event == event => false,
            Some(book) => {
                if book.event.home != event.home || book.event.away != event.away {
                    warn!(
                        "[ODDS] Participants changed for {}: {} vs {} -> {} vs {}",
                        event.id, book.event.home, book.event.away, event.home, event.away
                    );
                }
                book.event = event;
                true
            }
            None => {
                debug!("[ODDS] New event {}: {} vs {}", event.id, event.home, event.away);
                books.insert(event.id.clone(), EventBook::new(event));
                true
            }
        }
    }

    /// Apply an odds delta. Returns every line that was created or whose
    /// stored state changed, in wire order. Lines that fail the ownership
    /// check are dropped and never stored.
    pub fn ingest_odds_delta(&self, delta: &OddsDelta) -> Vec<LineChange> {
        let now = now_ms();
        let mut books = self.books.write();

        let Some(book) = books.get_mut(&delta.event_id) else {
            let n = self.orphaned.fetch_add(1, Ordering::Relaxed);
            if n < REJECT_WARN_LIMIT {
                warn!(
                    "[ODDS] Delta for unknown event {} ({} proposals) dropped",
                    delta.event_id,
                    delta.proposal_count()
                );
            }
            return Vec::new();
        };

        let mut changes = Vec::new();
        for (market, p) in delta.proposals() {
            let signals = match_signals(&p.event_description, &book.event.home, &book.event.away);
            if !signals.accepted() {
                let n = self.rejected.fetch_add(1, Ordering::Relaxed);
                if n < REJECT_WARN_LIMIT {
                    warn!(
                        "[ODDS] Rejected line {} for {} ({} vs {}): description {:?} signals {:?}",
                        p.key, delta.event_id, book.event.home, book.event.away,
                        p.event_description, signals
                    );
                } else {
                    debug!(
                        "[ODDS] Rejected line {} for {}: {:?}",
                        p.key, delta.event_id, p.event_description
                    );
                }
                continue;
            }

            match book.lines.get_mut(&p.key) {
                Some(line) => {
                    let price_moved = line.price != p.price;
                    let state_moved = line.suspended != p.suspended
                        || line.param != p.param
                        || line.selection != p.selection
                        || line.market != market;
                    line.updated_at_ms = now;
                    if !price_moved && !state_moved {
                        continue;
                    }

                    let move_by = p.price.saturating_sub(line.price);
                    if price_moved {
                        line.previous_price = Some(line.price);
                        line.price = p.price;
                        if move_by.unsigned_abs() >= self.config.delta_log_threshold.unsigned_abs() {
                            info!(
                                "[ODDS] {} {} {} moved {:+} ({} -> {})",
                                book.event.id, market, line.selection, move_by,
                                line.previous_price.unwrap_or(line.price), line.price
                            );
                        }
                    }
                    line.suspended = p.suspended;
                    line.param = p.param;
                    line.selection = p.selection.clone();
                    line.market = market.to_string();
                    line.event_description = p.event_description.clone();

                    changes.push(LineChange { line: line.clone(), delta: Some(move_by) });
                }
                None => {
                    let line = Line {
                        id: p.key.clone(),
                        event_id: book.event.id.clone(),
                        market: market.to_string(),
                        selection: p.selection.clone(),
                        param: p.param,
                        price: p.price,
                        previous_price: p.previous_price.filter(|prev| *prev != p.price),
                        event_description: p.event_description.clone(),
                        suspended: p.suspended,
                        updated_at_ms: now,
                    };
                    book.lines.insert(line.id.clone(), line.clone());
                    changes.push(LineChange { line, delta: None });
                }
            }
        }

        changes
    }

    /// Fresh lines for an event, ordered by market then selection.
    pub fn get_lines(&self, event_id: &str) -> Vec<Line> {
        self.get_lines_as_of(event_id, now_ms())
    }

    /// `get_lines` evaluated against an explicit clock.
    pub fn get_lines_as_of(&self, event_id: &str, now: i64) -> Vec<Line> {
        let books = self.books.read();
        books
            .get(event_id)
            .map(|book| self.fresh_sorted(book, now))
            .unwrap_or_default()
    }

    /// A single stored line, scoped to its event. Staleness is not applied;
    /// dispatch prefers an old authoritative line over the caller's copy.
    pub fn get_line(&self, event_id: &str, line_id: &str) -> Option<Line> {
        self.books.read().get(event_id)?.lines.get(line_id).cloned()
    }

    pub fn get_event(&self, event_id: &str) -> Option<Event> {
        self.books.read().get(event_id).map(|b| b.event.clone())
    }

    pub fn events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.books.read().values().map(|b| b.event.clone()).collect();
        events.sort_by(|a, b| a.id.cmp(&b.id));
        events
    }

    /// Full verified snapshot. Re-checks every stored line against the
    /// event's current participants and purges the ones that no longer pass.
    pub fn snapshot(&self, event_id: &str) -> Vec<Line> {
        let now = now_ms();
        let mut books = self.books.write();
        let Some(book) = books.get_mut(event_id) else {
            return Vec::new();
        };

        let (home, away) = (book.event.home.clone(), book.event.away.clone());
        let before = book.lines.len();
        book.lines
            .retain(|_, line| match_signals(&line.event_description, &home, &away).accepted());
        let purged = before - book.lines.len();
        if purged > 0 {
            warn!("[ODDS] Snapshot purged {} mismatched lines from {}", purged, event_id);
        }

        self.fresh_sorted(book, now)
    }

    pub fn stats(&self) -> RepositoryStats {
        let books = self.books.read();
        RepositoryStats {
            events: books.len(),
            lines: books.values().map(|b| b.lines.len()).sum(),
            rejected: self.rejected.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
        }
    }

    fn fresh_sorted(&self, book: &EventBook, now: i64) -> Vec<Line> {
        let stale_ms = self.config.stale_after.as_millis() as i64;
        let mut lines: Vec<Line> = book
            .lines
            .values()
            .filter(|l| now - l.updated_at_ms <= stale_ms)
            .cloned()
            .collect();
        lines.sort_by(|a, b| a.market.cmp(&b.market).then_with(|| a.selection.cmp(&b.selection)));
        lines
    }
}

impl Default for OddsRepository {
    fn default() -> Self {
        Self::new(RepositoryConfig::default())
    }
}
