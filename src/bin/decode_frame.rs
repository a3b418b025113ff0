//! Decode a captured feed frame and print what the relay would see.
//!
//! Usage: cargo run --bin decode_frame -- <frame-file|-> [--raw]
//!
//! The frame may be zlib, raw DEFLATE or plain JSON. `--raw` prints the
//! decoded JSON instead of the typed summary.

use anyhow::{bail, Context, Result};
use std::io::Read;

use odds_relay::feed::{decode, decode_value};
use odds_relay::types::FeedMessage;

fn read_input(path: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    if path == "-" {
        std::io::stdin().read_to_end(&mut bytes).context("reading stdin")?;
    } else {
        bytes = std::fs::read(path).with_context(|| format!("reading {}", path))?;
    }
    Ok(bytes)
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let raw = args.iter().any(|a| a == "--raw");
    let Some(path) = args.iter().find(|a| !a.starts_with("--")) else {
        bail!("usage: decode_frame <frame-file|-> [--raw]");
    };

    let bytes = read_input(path)?;
    println!("📦 {} bytes from {}", bytes.len(), path);

    if raw {
        let value = decode_value(&bytes)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match decode(&bytes)? {
        FeedMessage::LiveEventsUpdate(events) | FeedMessage::UpcomingEventsUpdate(events) => {
            println!("📋 {} events", events.len());
            for e in &events {
                let score = e.score.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "   {} | {} vs {} | {} | {} | {} markets{}",
                    e.id,
                    e.home,
                    e.away,
                    score,
                    e.status,
                    e.market_count,
                    if e.live { " | LIVE" } else { "" }
                );
            }
        }
        FeedMessage::OddsDelta(delta) => {
            println!("📊 Odds delta for {} ({} proposals)", delta.event_id, delta.proposal_count());
            for (market, p) in delta.proposals() {
                let param = p.param.map(|v| format!(" {:+}", v)).unwrap_or_default();
                let prev = p.previous_price.map(|v| format!(" (was {:+})", v)).unwrap_or_default();
                println!(
                    "   {} | {} | {}{} @ {:+}{}{} | {}",
                    p.key,
                    market,
                    p.selection,
                    param,
                    p.price,
                    prev,
                    if p.suspended { " [suspended]" } else { "" },
                    p.event_description
                );
            }
        }
        FeedMessage::Unrecognized { message_name } => {
            println!("❓ Unrecognized message: {}", message_name);
        }
    }

    Ok(())
}
