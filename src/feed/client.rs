//! Upstream feed WebSocket session.
//!
//! One `FeedClient` owns one upstream identity. Each call to
//! [`FeedClient::run_session`] is a single connection; [`FeedClient::run_forever`]
//! wraps it in the reconnect loop. Decoded messages leave through an mpsc
//! channel in arrival order. Topic changes come in through a [`FeedHandle`]
//! and are remembered so they are replayed after a reconnect.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{feed_trace_enabled, FeedConfig, FEED_CONNECT_TIMEOUT_SECS, FEED_STALE_SECS, WS_RECONNECT_DELAY_SECS};
use crate::feed::codec::{build_connect_url, decode_value, FeedCommand, FrameEncoder};
use crate::feed::schema::into_feed_message;
use crate::types::FeedMessage;

/// Decode failures logged with a payload preview before going quiet
const DECODE_ERROR_LOG_LIMIT: u64 = 5;

/// Pending topic commands buffered between the handle and the session
const COMMAND_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Cloneable control handle for a running feed client.
#[derive(Clone)]
pub struct FeedHandle {
    tx: mpsc::Sender<TopicCommand>,
    stats: Arc<FeedStats>,
}

impl FeedHandle {
    /// Queue a subscription. Never blocks; returns false if the queue is full
    /// or the client has stopped.
    pub fn subscribe(&self, topic: impl Into<String>) -> bool {
        self.send(TopicCommand::Subscribe(topic.into()))
    }

    pub fn unsubscribe(&self, topic: impl Into<String>) -> bool {
        self.send(TopicCommand::Unsubscribe(topic.into()))
    }

    pub fn stats(&self) -> &FeedStats {
        &self.stats
    }

    fn send(&self, cmd: TopicCommand) -> bool {
        match self.tx.try_send(cmd) {
            Ok(()) => true,
            Err(e) => {
                warn!("[FEED] Topic command not queued: {}", e);
                false
            }
        }
    }
}

/// Frame counters, readable from the status log.
#[derive(Debug, Default)]
pub struct FeedStats {
    pub frames: AtomicU64,
    pub decoded: AtomicU64,
    pub decode_errors: AtomicU64,
    pub unrecognized: AtomicU64,
    pub sessions: AtomicU64,
    /// Latest server timestamp echoed back on the next connect
    pub server_ts: AtomicI64,
}

pub struct FeedClient {
    config: FeedConfig,
    encoder: FrameEncoder,
    topics: BTreeSet<String>,
    cmd_rx: mpsc::Receiver<TopicCommand>,
    commands_open: bool,
    msg_tx: mpsc::Sender<FeedMessage>,
    stats: Arc<FeedStats>,
}

/// Build a client and its control handle. Decoded messages go to `msg_tx`.
pub fn feed_channel(config: FeedConfig, msg_tx: mpsc::Sender<FeedMessage>) -> (FeedClient, FeedHandle) {
    let (tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let stats = Arc::new(FeedStats::default());
    let topics = config.channels.iter().cloned().collect();
    let client = FeedClient {
        encoder: FrameEncoder::new(&config),
        config,
        topics,
        cmd_rx,
        commands_open: true,
        msg_tx,
        stats: stats.clone(),
    };
    (client, FeedHandle { tx, stats })
}

/// Apply a topic command to the remembered topic set. Returns the command to
/// send upstream, or None when it would be a no-op.
fn apply_topic(topics: &mut BTreeSet<String>, cmd: TopicCommand) -> Option<FeedCommand> {
    match cmd {
        TopicCommand::Subscribe(topic) => {
            topics.insert(topic.clone()).then_some(FeedCommand::Subscribe { topic })
        }
        TopicCommand::Unsubscribe(topic) => {
            topics.remove(&topic).then_some(FeedCommand::Unsubscribe { topic })
        }
    }
}

fn handle_frame(stats: &FeedStats, bytes: &[u8]) -> Option<FeedMessage> {
    stats.frames.fetch_add(1, Ordering::Relaxed);
    let decoded = decode_value(bytes).and_then(|value| {
        if let Some(ts) = value.get("server_ts").and_then(|v| v.as_i64()) {
            stats.server_ts.store(ts, Ordering::Relaxed);
        }
        into_feed_message(value)
    });
    match decoded {
        Ok(msg) => {
            stats.decoded.fetch_add(1, Ordering::Relaxed);
            if let FeedMessage::Unrecognized { message_name } = &msg {
                stats.unrecognized.fetch_add(1, Ordering::Relaxed);
                debug!("[FEED] Unrecognized message {:?}", message_name);
            }
            if feed_trace_enabled() {
                info!("[FEED] <- {} ({} bytes)", msg.kind(), bytes.len());
            }
            Some(msg)
        }
        Err(e) => {
            let n = stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            if n < DECODE_ERROR_LOG_LIMIT {
                let preview = String::from_utf8_lossy(&bytes[..bytes.len().min(200)]);
                error!("[FEED] Undecodable frame #{}: {} | {}", n, e, preview);
            }
            None
        }
    }
}

impl FeedClient {
    /// Currently active topics (replayed on every connect)
    pub fn topics(&self) -> &BTreeSet<String> {
        &self.topics
    }

    /// One upstream connection. Returns when the connection ends; the caller
    /// decides whether to reconnect. Errors only when the message consumer is
    /// gone or the connection could not be established.
    pub async fn run_session(&mut self) -> Result<()> {
        let url = build_connect_url(
            &self.config,
            self.encoder.peek_seq(),
            self.stats.server_ts.load(Ordering::Relaxed),
        )?;

        let (ws_stream, _) = timeout(
            Duration::from_secs(FEED_CONNECT_TIMEOUT_SECS),
            connect_async(url.as_str()),
        )
        .await
        .context("Feed connect timed out")?
        .context("Failed to connect to feed")?;

        let session_no = self.stats.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        info!("[FEED] Connected to {} (session #{}, seq={})", self.config.endpoint, session_no, self.encoder.peek_seq());

        let (mut write, mut read) = ws_stream.split();

        // Replay every remembered topic
        if !self.topics.is_empty() {
            let commands: Vec<FeedCommand> = self
                .topics
                .iter()
                .map(|topic| FeedCommand::Subscribe { topic: topic.clone() })
                .collect();
            write.send(Message::Binary(self.encoder.frame(&commands)?)).await?;
            info!("[FEED] Subscribed to {} topics", commands.len());
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_message = Instant::now();
        let stale_after = Duration::from_secs(FEED_STALE_SECS);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let beat = FeedCommand::ClientHeartbeat { active_subscriptions: self.topics.len() };
                    if let Err(e) = write.send(Message::Binary(self.encoder.frame(&[beat])?)).await {
                        error!("[FEED] Failed to send heartbeat: {}", e);
                        break;
                    }
                    debug!("[FEED] Heartbeat sent ({} topics)", self.topics.len());
                }

                cmd = self.cmd_rx.recv(), if self.commands_open => {
                    let Some(cmd) = cmd else {
                        debug!("[FEED] All handles dropped; topic set is now fixed");
                        self.commands_open = false;
                        continue;
                    };
                    if let Some(command) = apply_topic(&mut self.topics, cmd) {
                        debug!("[FEED] → {:?}", command);
                        if let Err(e) = write.send(Message::Binary(self.encoder.frame(&[command])?)).await {
                            error!("[FEED] Failed to send topic command: {}", e);
                            break;
                        }
                    }
                }

                msg = read.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Binary(bytes))) => {
                            last_message = Instant::now();
                            handle_frame(&self.stats, &bytes)
                        }
                        Some(Ok(Message::Text(text))) => {
                            last_message = Instant::now();
                            handle_frame(&self.stats, text.as_bytes())
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                            last_message = Instant::now();
                            None
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_message = Instant::now();
                            None
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!("[FEED] Server closed: {:?}", frame);
                            break;
                        }
                        Some(Err(e)) => {
                            error!("[FEED] WebSocket error: {}", e);
                            break;
                        }
                        None => {
                            warn!("[FEED] Stream ended");
                            break;
                        }
                        _ => None,
                    };

                    if let Some(decoded) = decoded {
                        if self.msg_tx.send(decoded).await.is_err() {
                            bail!("feed consumer dropped");
                        }
                    }
                }
            }

            if last_message.elapsed() > stale_after {
                warn!("[FEED] No frames for {}s, reconnecting...", stale_after.as_secs());
                break;
            }
        }

        Ok(())
    }

    /// Reconnect loop. Returns once the consumer side is gone.
    pub async fn run_forever(mut self) {
        loop {
            match self.run_session().await {
                Ok(()) if self.msg_tx.is_closed() => break,
                Ok(()) => {}
                Err(e) if self.msg_tx.is_closed() => {
                    info!("[FEED] Stopping: {}", e);
                    break;
                }
                Err(e) => error!("[FEED] Session ended: {:#} - reconnecting...", e),
            }
            tokio::time::sleep(Duration::from_secs(WS_RECONNECT_DELAY_SECS)).await;
        }
    }
}
