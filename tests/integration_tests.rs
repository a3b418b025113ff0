// tests/integration_tests.rs
// Holistic integration tests for the odds relay
//
// These tests verify the full flow:
// 1. Compressed frame → decode → verified odds book
// 2. Odds book → consumer pushes
// 3. Multi-session dispatch with lock-and-load
// 4. Dispatch → audit log

// ============================================================================
// FEED → REPOSITORY TESTS - Verify frames land in the book correctly
// ============================================================================

mod feed_to_repository_tests {
    use odds_relay::feed::codec::deflate;
    use odds_relay::feed::decode;
    use odds_relay::repository::OddsRepository;
    use odds_relay::types::FeedMessage;
    use serde_json::json;

    fn ingest(repo: &OddsRepository, frame: &[u8]) {
        match decode(frame).expect("frame should decode") {
            FeedMessage::LiveEventsUpdate(events) | FeedMessage::UpcomingEventsUpdate(events) => {
                for e in events {
                    repo.upsert_event(e);
                }
            }
            FeedMessage::OddsDelta(delta) => {
                repo.ingest_odds_delta(&delta);
            }
            FeedMessage::Unrecognized { .. } => {}
        }
    }

    fn compressed(value: serde_json::Value) -> Vec<u8> {
        deflate(value.to_string().as_bytes()).unwrap()
    }

    /// Test: A cross-listed line from another game never enters the book
    #[test]
    fn test_compressed_frames_build_verified_book() {
        let repo = OddsRepository::default();

        ingest(&repo, &compressed(json!({
            "inplay_conflicts": [
                {"conflict_id": "A", "home": "Lakers", "away": "Celtics", "status": "Q2"},
                {"conflict_id": "B", "home": "Warriors", "away": "Suns", "status": "Q1"}
            ]
        })));

        ingest(&repo, &compressed(json!({
            "conflict_subfeeds_update": {
                "conflict_id": "A",
                "market_updates": [{"market_name": "Moneyline", "groups": [{"proposals": [
                    {"key": "L1", "event_description": "Lakers vs Celtics", "selection": "Lakers", "odds": -150},
                    {"key": "L2", "event_description": "Warriors vs Suns", "selection": "Warriors", "odds": "+120"}
                ]}]}]
            }
        })));

        let lines = repo.get_lines("A");
        assert_eq!(lines.len(), 1, "Only the Lakers/Celtics line belongs to A");
        assert_eq!(&*lines[0].id, "L1");
        assert_eq!(repo.stats().rejected, 1);
        assert!(repo.get_lines("B").is_empty(), "Rejected lines are not re-homed");
    }

    /// Test: Plain JSON and compressed frames decode identically
    #[test]
    fn test_plain_and_compressed_frames_agree() {
        let frame = json!({"prematch_conflicts": [{"id": 5, "home": "Duke", "away": "North Carolina"}]});
        let plain = decode(frame.to_string().as_bytes()).unwrap();
        let packed = decode(&compressed(frame)).unwrap();
        assert_eq!(plain, packed);
    }

    /// Test: Price history flows through consecutive deltas
    #[test]
    fn test_price_move_tracks_previous() {
        let repo = OddsRepository::default();
        ingest(&repo, json!({
            "inplay_conflicts": [{"conflict_id": "A", "home": "Lakers", "away": "Celtics"}]
        }).to_string().as_bytes());

        for odds in [-110, -125] {
            ingest(&repo, &compressed(json!({
                "conflict_subfeeds_update": {"conflict_id": "A", "market_updates": [
                    {"market_name": "Spread", "groups": [{"proposals": [
                        {"key": "L1", "event_description": "Lakers @ Celtics", "selection": "Lakers -4.5",
                         "odds": odds, "param": -4.5}
                    ]}]}
                ]}
            })));
        }

        let line = repo.get_line("A", "L1").unwrap();
        assert_eq!(line.price, -125);
        assert_eq!(line.previous_price, Some(-110));
    }
}

// ============================================================================
// BROADCAST TESTS - Verify consumers see repository changes
// ============================================================================

mod broadcast_tests {
    use odds_relay::broadcast::{Broadcaster, FocusFilter, Push};
    use odds_relay::pipeline::{run_ingestion, Pipeline};
    use odds_relay::repository::OddsRepository;
    use odds_relay::types::{Event, FeedMessage, GroupUpdate, MarketUpdate, OddsDelta, ProposalUpdate};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn live(id: &str, home: &str, away: &str) -> Event {
        Event {
            id: id.into(),
            home: home.into(),
            away: away.into(),
            score: None,
            status: String::new(),
            market_count: 0,
            external_key: None,
            live: true,
        }
    }

    fn delta(price: i32) -> FeedMessage {
        FeedMessage::OddsDelta(OddsDelta {
            event_id: "A".into(),
            markets: vec![MarketUpdate {
                market_name: "Moneyline".into(),
                groups: vec![GroupUpdate {
                    proposals: vec![ProposalUpdate {
                        key: "L1".into(),
                        event_description: "Lakers vs Celtics".into(),
                        market_name: None,
                        selection: "Lakers".into(),
                        price,
                        previous_price: None,
                        param: None,
                        suspended: false,
                    }],
                }],
            }],
        })
    }

    /// Test: Ingestion task pushes every price move to a subscriber, in order
    #[tokio::test]
    async fn test_ingestion_task_pushes_in_order() {
        let repo = Arc::new(OddsRepository::default());
        let bcast = Arc::new(Broadcaster::new(repo.clone()));
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run_ingestion(rx, Pipeline::new(repo.clone(), bcast.clone(), FocusFilter::default())));

        tx.send(FeedMessage::LiveEventsUpdate(vec![live("A", "Lakers", "Celtics")])).await.unwrap();
        // Let the event land before subscribing
        while repo.get_event("A").is_none() {
            tokio::task::yield_now().await;
        }

        let (consumer, mut pushes) = bcast.connect();
        assert!(bcast.subscribe(consumer, "A".into(), false));
        assert!(matches!(pushes.recv().await, Some(Push::Snapshot { .. })));

        for price in [-110, -120, -130] {
            tx.send(delta(price)).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let mut seen = Vec::new();
        while let Ok(push) = pushes.try_recv() {
            if let Push::OddsUpdate { lines, .. } = push {
                seen.push(lines[0].price);
            }
        }
        assert_eq!(seen, vec![-110, -120, -130]);
    }
}

// ============================================================================
// DISPATCH TESTS - Lock-and-load across sessions, audit side effects
// ============================================================================

mod dispatch_tests {
    use async_trait::async_trait;
    use odds_relay::config::{AuditConfig, DispatchConfig};
    use odds_relay::dispatch::{
        BetPlacer, CredentialCapture, Dispatcher, DryRunPlacer, PlacementRequest, PlacementResponse,
    };
    use odds_relay::error::PlacementError;
    use odds_relay::lock_cache::LockedRequestCache;
    use odds_relay::repository::OddsRepository;
    use odds_relay::session::{Session, SessionRegistry, SessionState};
    use odds_relay::storage::create_audit_channel;
    use odds_relay::types::{DispatchRequest, Event, FundType, GroupUpdate, MarketUpdate, OddsDelta, ProposalUpdate, SessionId};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn repo_with_spread(price: i32) -> Arc<OddsRepository> {
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
                        price,
                        previous_price: None,
                        param: Some(-4.5),
                        suspended: false,
                    }],
                }],
            }],
        });
        repo
    }

    fn request(stake_cents: u32, use_locked_path: bool) -> DispatchRequest {
        DispatchRequest {
            event_id: "A".into(),
            line_id: "L1".into(),
            // Deliberately stale caller view; the book wins
            selection: "Lakers -3.5".into(),
            price: -105,
            market: None,
            param: None,
            stake_cents,
            use_locked_path,
            fund_type: FundType::Cash,
        }
    }

    /// Records what it was asked to place
    #[derive(Default)]
    struct RecordingPlacer {
        placed: Mutex<Vec<(String, bool, PlacementRequest)>>,
    }

    #[async_trait]
    impl BetPlacer for RecordingPlacer {
        async fn place_bet(&self, s: &Session, _c: &str, req: &PlacementRequest) -> Result<PlacementResponse, PlacementError> {
            self.placed.lock().push((s.id.to_string(), false, req.clone()));
            Ok(PlacementResponse { success: true, status: Some(200), response: Some(json!({"code": 0})), ..Default::default() })
        }

        async fn place_bet_replaying_template(
            &self,
            s: &Session,
            _c: &str,
            req: &PlacementRequest,
        ) -> Result<PlacementResponse, PlacementError> {
            self.placed.lock().push((s.id.to_string(), true, req.clone()));
            Ok(PlacementResponse { success: true, status: Some(200), response: Some(json!({"bet_id": "T-9"})), ..Default::default() })
        }

        async fn capture_current_credential(&self, _s: &SessionId) -> Result<CredentialCapture, PlacementError> {
            Ok(CredentialCapture { success: true, token: Some("tok".into()), source: "test".into(), error: None })
        }
    }

    /// Test: Probe arms every ready session; full stake replays the probe verbatim
    #[tokio::test]
    async fn test_lock_and_load_replays_book_price() {
        let repo = repo_with_spread(-110);
        let sessions = Arc::new(SessionRegistry::from_profiles("p1,p2,p3:scrape"));
        let locks = Arc::new(LockedRequestCache::new());
        let placer = Arc::new(RecordingPlacer::default());
        let d = Dispatcher::new(repo.clone(), sessions.clone(), locks.clone(), placer.clone(), DispatchConfig::default());

        let probe = d.lock(&request(50_000, false)).await;
        assert_eq!(probe.success_count, 2, "Scrape-only profile never bets");
        assert!(probe.all_armed);
        assert_eq!(locks.len(), 2);

        // Book moves after the lock; replay must not re-read it
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
                        price: -140,
                        previous_price: None,
                        param: Some(-4.5),
                        suspended: false,
                    }],
                }],
            }],
        });

        let full = d.dispatch(&request(50_000, true)).await;
        assert_eq!(full.success_count, 2);
        assert!(full.results.iter().all(|r| r.locked_path && r.confirmation.as_deref() == Some("T-9")));

        let placed = placer.placed.lock().clone();
        let (fresh, replays): (Vec<_>, Vec<_>) = placed.into_iter().partition(|(_, replay, _)| !replay);
        assert!(fresh.iter().all(|(_, _, r)| r.price == -110 && r.stake_cents == 20 && r.selection == "Lakers -4.5"));
        assert!(replays.iter().all(|(_, _, r)| r.price == -110 && r.stake_cents == 50_000));
    }

    /// Test: Locked path without a template falls back to a fresh placement
    #[tokio::test]
    async fn test_locked_request_without_template_places_fresh() {
        let placer = Arc::new(RecordingPlacer::default());
        let d = Dispatcher::new(
            repo_with_spread(-110),
            Arc::new(SessionRegistry::from_profiles("p1")),
            Arc::new(LockedRequestCache::new()),
            placer.clone(),
            DispatchConfig::default(),
        );

        let summary = d.dispatch(&request(1_000, true)).await;
        assert!(summary.any_success);
        assert!(!summary.results[0].locked_path);
        assert!(!summary.any_armed, "Only probe-stake placements arm");
        assert!(!placer.placed.lock()[0].1);
    }

    /// Test: Suspended sessions are skipped entirely
    #[tokio::test]
    async fn test_suspended_session_not_dispatched() {
        let sessions = Arc::new(SessionRegistry::from_profiles("p1,p2"));
        sessions.set_state("p2", SessionState::Suspended);
        let placer = Arc::new(RecordingPlacer::default());
        let d = Dispatcher::new(
            repo_with_spread(-110),
            sessions,
            Arc::new(LockedRequestCache::new()),
            placer.clone(),
            DispatchConfig::default(),
        );

        let summary = d.dispatch(&request(1_000, false)).await;
        assert_eq!(summary.results.len(), 1);
        assert_eq!(&*summary.results[0].session_id, "p1");
    }

    /// Test: Every finished attempt reaches the audit log
    #[tokio::test]
    async fn test_dispatch_writes_audit_log() {
        let path = std::env::temp_dir().join(format!("odds_relay_it_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let audit = create_audit_channel(
            &AuditConfig { db_path: path.to_string_lossy().into_owned(), retention: 100 },
            "DRY_RUN",
        )
        .unwrap();

        let d = Dispatcher::new(
            repo_with_spread(-110),
            Arc::new(SessionRegistry::from_profiles("p1,p2")),
            Arc::new(LockedRequestCache::new()),
            Arc::new(DryRunPlacer::new()),
            DispatchConfig::default(),
        )
        .with_audit(Arc::new(audit.clone()));

        let summary = d.dispatch(&request(2_500, false)).await;
        assert_eq!(summary.success_count, 2);

        let totals = audit.totals();
        assert_eq!(totals.attempts, 2);
        assert_eq!(totals.pending, 2);
        assert_eq!(totals.wagered_cents, 5_000);
        assert!(audit.flush());

        let conn = rusqlite::Connection::open(&path).unwrap();
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM bet_log WHERE success = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(rows, 2);
    }
}
