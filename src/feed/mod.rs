//! Upstream live-odds feed: frame codec, wire schema and the WebSocket session.

pub mod client;
pub mod codec;
pub mod schema;

pub use client::{feed_channel, FeedClient, FeedHandle, FeedStats, TopicCommand};
pub use codec::{build_connect_url, decode, decode_value, encode, event_topic, FeedCommand, FrameEncoder, FrameHeader};
