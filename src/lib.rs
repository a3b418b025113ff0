//! Live-Odds Relay
//!
//! Ingests a compressed live-odds WebSocket feed, keeps a verified per-event
//! odds book, fans changes out to local consumers and dispatches bets across
//! several betting sessions at once, with a lock-and-load fast path that
//! replays a previously accepted request at a new stake.

pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod lock_cache;
pub mod pipeline;
pub mod repository;
pub mod session;
pub mod storage;
pub mod types;
pub mod verification;
