//! Frame codec: inflate/deflate, envelope decode, outbound command framing.

use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::Value;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::FeedConfig;
use crate::error::DecodeError;
use crate::feed::schema::into_feed_message;
use crate::types::{now_ms, FeedMessage};

/// Guard against decompression bombs (16 MiB inflated)
const MAX_INFLATED_BYTES: u64 = 16 * 1024 * 1024;

fn inflate_with<R: Read>(reader: R) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(MAX_INFLATED_BYTES).read_to_end(&mut out).ok()?;
    (!out.is_empty()).then_some(out)
}

/// Try zlib-wrapped DEFLATE, then raw DEFLATE.
fn inflate(bytes: &[u8]) -> Option<Vec<u8>> {
    inflate_with(ZlibDecoder::new(bytes)).or_else(|| inflate_with(DeflateDecoder::new(bytes)))
}

/// Decode a frame to raw JSON. Inflated output is only accepted when it
/// parses as JSON; otherwise the payload is treated as literal JSON text.
pub fn decode_value(bytes: &[u8]) -> Result<Value, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    if let Some(inflated) = inflate(bytes) {
        if let Ok(value) = serde_json::from_slice::<Value>(&inflated) {
            return Ok(value);
        }
    }

    serde_json::from_slice::<Value>(bytes).map_err(DecodeError::NotJson)
}

/// Decode a frame to a typed message.
pub fn decode(bytes: &[u8]) -> Result<FeedMessage, DecodeError> {
    into_feed_message(decode_value(bytes)?)
}

/// zlib-wrapped DEFLATE, the same encoding upstream uses.
pub fn deflate(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2 + 16), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

// === Outbound frames ===

/// Identity and ordering block carried by every outbound frame.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub device_id: String,
    pub session_id: String,
    pub app_version: String,
    pub client_ts: i64,
    pub sequence_no: u64,
}

/// Commands understood by upstream. Topics are opaque strings.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum FeedCommand {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    ClientHeartbeat { active_subscriptions: usize },
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    header: &'a FrameHeader,
    commands: &'a [FeedCommand],
}

/// Serialize and compress one outbound frame.
pub fn encode(commands: &[FeedCommand], header: &FrameHeader) -> Result<Vec<u8>, DecodeError> {
    let json = serde_json::to_vec(&OutboundFrame { header, commands }).map_err(DecodeError::NotJson)?;
    deflate(&json)
}

/// Topic carrying odds deltas for one event
pub fn event_topic(event_id: &str) -> String {
    format!("conflict_subfeeds/{event_id}")
}

/// Builds headers for one upstream identity. The sequence counter is shared
/// by every frame sent under this identity and survives reconnects.
#[derive(Debug)]
pub struct FrameEncoder {
    device_id: String,
    session_id: String,
    app_version: String,
    next_seq: AtomicU64,
}

impl FrameEncoder {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            session_id: config.session_id.clone(),
            app_version: config.app_version.clone(),
            next_seq: AtomicU64::new(config.start_seq),
        }
    }

    /// Sequence number the next frame will carry
    pub fn peek_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire)
    }

    pub fn next_header(&self) -> FrameHeader {
        FrameHeader {
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            app_version: self.app_version.clone(),
            client_ts: now_ms(),
            sequence_no: self.next_seq.fetch_add(1, Ordering::AcqRel),
        }
    }

    pub fn frame(&self, commands: &[FeedCommand]) -> Result<Vec<u8>, DecodeError> {
        encode(commands, &self.next_header())
    }
}

/// Connect URL with the identity query string upstream expects.
pub fn build_connect_url(config: &FeedConfig, seq: u64, server_ts: i64) -> anyhow::Result<reqwest::Url> {
    let client_ts = now_ms().to_string();
    let server_ts = server_ts.to_string();
    let seq = seq.to_string();
    let url = reqwest::Url::parse_with_params(
        &config.endpoint,
        &[
            ("device_id", config.device_id.as_str()),
            ("app_version", config.app_version.as_str()),
            ("install_token", config.install_token.as_str()),
            ("session_token", config.session_token.as_str()),
            ("client_ip", config.client_ip.as_str()),
            ("auth_token", config.auth_token.as_str()),
            ("client_ts", client_ts.as_str()),
            ("server_ts", server_ts.as_str()),
            ("seq", seq.as_str()),
        ],
    )?;
    Ok(url)
}
