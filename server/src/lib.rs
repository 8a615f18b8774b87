//! # Party Game Session Server
//!
//! Authoritative host for one multiplayer party-game session. Participants
//! vote on the next mini-game, play it locally against a pattern the server
//! generates, report their outcome, and collect points round after round
//! until the session ends.
//!
//! ## Architecture
//!
//! ### Single Event Loop
//! Every session event (packets, disconnects, deadline timers) is funnelled
//! through one channel into [`network::Server::run`] and handled to
//! completion before the next one. The orchestrator never needs a lock and
//! never observes a half-applied transition.
//!
//! ### Cancellable Timers
//! Deadlines are scheduled through the [`timers::Scheduler`] trait and come
//! back as ordinary events. Each timer carries a generation; leaving a state
//! cancels its timers, and a fire that lost the race is recognised by its
//! generation and dropped.
//!
//! ### TCP Transport
//! Packets are length-prefixed bincode frames (see `shared::codec`). Each
//! connection gets a reader task and a writer task; the main loop only ever
//! touches in-memory queues.
//!
//! ## Module Organization
//!
//! - `orchestrator`: the session state machine
//! - `scoring`: ranking and point awards for a closed round
//! - `participants`: roster with liveness, scores and vote history
//! - `timers`: scheduler trait, tokio-backed and manual implementations
//! - `client_manager`: open connections and their participant bindings
//! - `network`: accept loop, per-connection tasks and the main loop
//! - `config`, `error`: session tunables and typed rejections
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::SessionConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut server = Server::new("127.0.0.1:8080", SessionConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod error;
pub mod network;
pub mod orchestrator;
pub mod participants;
pub mod scoring;
pub mod timers;
