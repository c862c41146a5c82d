//! # Session Server Library
//!
//! This library provides the coordination server for lockstep multiplayer
//! games. It authenticates players, hosts a directory of game sessions, and
//! relays ticks and actions between session members so that every client
//! advances its simulation in strict lockstep with its peers.
//!
//! ## Core Responsibilities
//!
//! ### Login and Identity
//! Players log in with a username and receive a reusable login token. The
//! server enforces one live connection per identity, validates the client's
//! protocol version and game metadata, and expires stale tokens on a
//! periodic sweep.
//!
//! ### Session Directory
//! Maintains the set of open sessions and pushes the public listing to every
//! player sitting in the lobby. Players create sessions, join them by token,
//! signal readiness, and the founding player starts the game once everyone
//! is ready.
//!
//! ### Lockstep Coordination
//! Once a game is running the server never simulates anything itself. It
//! collects tick confirmations from every member, advances the shared tick
//! limit, and relays player actions with a sequence number and the tick at
//! which every client must execute them.
//!
//! ### Clock Synchronization
//! Each connection is probed until the server has a stable estimate of its
//! ping and clock offset. Relayed actions are stamped with the pairwise
//! ping and offset between sender and receiver so clients can compensate
//! for latency differences.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! All server state is owned by one task. Connection reader tasks, timer
//! tasks, and the accept loop reduce everything they observe to [`network::Event`]
//! values on a single channel, and the event loop applies them sequentially.
//! This eliminates race conditions and keeps every state transition
//! deterministic and unit-testable without a socket in sight.
//!
//! ### TCP Framing
//! Clients speak length-prefixed bincode over TCP: a 4-byte big-endian
//! length header followed by the serialized message. Oversized frames are
//! rejected and a clean EOF simply ends the connection.
//!
//! ### Push-Based Protocol
//! Requests carry a client-chosen id and are answered with exactly one reply
//! or error. Everything else the client learns arrives as an unsolicited
//! push: roster changes, session listings, tick limits, relayed actions.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! The event loop and the TCP shell around it:
//! - Listener, per-connection reader/writer tasks, frame codec
//! - Request routing, login gating, and error replies
//! - Timer scheduling for clock probes, start polling, and token sweeps
//!
//! ### Session Module (`session`)
//! A single game session from founding to close:
//! - Seat assignment, roster pushes, and ready state
//! - Start gating on readiness and clock sync
//! - Pause holds, tick confirmation, and action relay
//!
//! ### Directory Module (`directory`)
//! The collection of live sessions:
//! - Session token minting and seed selection
//! - Join-by-token lookup and empty-session reaping
//! - The public listing pushed to lobby players
//!
//! ### Auth Module (`auth`)
//! Login validation and token accounting:
//! - Username, version, and game checks
//! - Token issue, reissue, and expiry
//!
//! ### Clock Module (`clock`)
//! The per-connection probe window and the filtered-mean estimator that
//! produces ping and offset for a connection.
//!
//! ### Connection, Player, and Lockstep Modules
//! Small state holders: the connection table with outboxes and seat links,
//! the per-seat player record, and the tick-limit arithmetic shared by a
//! session's members.
//!
//! ## Performance Characteristics
//!
//! ### Event Throughput
//! The server performs no per-tick simulation work. Cost is proportional to
//! message traffic, and a session's relay fan-out is bounded by its player
//! cap, so a single event loop comfortably hosts many concurrent sessions.
//!
//! ### Latency
//! Actions are relayed the moment they arrive; the only added delay is the
//! tick buffer the session was configured with, which exists so late
//! confirmations do not stall remote simulations.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use server::session::SessionConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Bind the listener and take the default session tuning
//!     // (100ms ticks, 3 ticks of buffer, 8 players per session).
//!     let mut server = Server::bind("127.0.0.1:8080", SessionConfig::default()).await?;
//!
//!     // Run the event loop until Ctrl+C. This:
//!     // - Accepts connections and spawns their reader/writer tasks
//!     // - Routes login, session, and in-game traffic
//!     // - Probes client clocks and schedules periodic timers
//!     // - Broadcasts a shutdown notice to every client on exit
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Security Considerations
//!
//! ### Login Gating
//! A connection that sends anything but a login request before logging in is
//! closed immediately. Notices from unauthenticated connections are dropped
//! without a reply.
//!
//! ### Request Validation
//! Session requests must name the session the player is actually seated in;
//! anything else is answered with an error and ignored. Tick confirmations
//! only ever move forward, so a client cannot rewind its own progress.
//!
//! ### Frame Limits
//! Incoming frames are capped at 64 KiB before allocation, so a hostile
//! length header cannot balloon server memory.

pub mod auth;
pub mod clock;
pub mod connection;
pub mod directory;
pub mod lockstep;
pub mod network;
pub mod player;
pub mod session;
pub mod utils;
