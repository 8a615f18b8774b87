//! # Party Game Bot Client
//!
//! Headless participant for the session server. A bot identifies itself,
//! votes when voting opens, plays every round it is handed against the
//! shared pattern, and reports its outcome, until the session ends.
//!
//! ## Module Organization
//!
//! ### Player Module (`player`)
//! Simulated input: one press per armed cue, aimed at the cue's target and
//! spread by a configurable jitter, delivered on frame boundaries. Also
//! plays whole rounds offline for tests and benchmarks.
//!
//! ### Network Module (`network`)
//! TCP connection to the server:
//! - Identity handshake and heartbeats
//! - Reacting to voting and round announcements
//! - Driving the local round each frame and reporting the result once
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{BotOptions, Client};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut options = BotOptions::new("bot-1");
//!     options.start = true;
//!     let mut client = Client::connect("127.0.0.1:8080", options).await?;
//!     let ranking = client.run().await?;
//!     println!("{:?}", ranking);
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod player;
