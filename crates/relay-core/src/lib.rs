//! # relay-core
//!
//! Client registry, broadcast fan-out and per-connection session handling
//! for the relay.
//!
//! - **ClientRegistry** - concurrency-safe set of active session handles
//! - **BroadcastEngine** - delivers a message to a snapshot of the registry,
//!   evicting sessions whose send fails
//! - **SessionHandler** - owns one connection: registers it, relays each
//!   inbound message through the engine, deregisters on exit
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  recv   ┌─────────────────┐ snapshot ┌────────────────┐
//! │ SessionHandler │────────▶│ BroadcastEngine │─────────▶│ ClientRegistry │
//! └────────────────┘         └─────────────────┘          └────────────────┘
//!         │ add/remove                │ send (one task per recipient)
//!         └──────────────▶ registry   └──────────────▶ every SessionHandle
//! ```
//!
//! The registry is an injected `Arc<ClientRegistry>` owned by whoever
//! composes the engine and the handlers; there is no global state.

pub mod broadcast;
pub mod registry;
pub mod session;

pub use broadcast::{BroadcastEngine, BroadcastReport};
pub use registry::ClientRegistry;
pub use session::{SessionError, SessionHandle, SessionHandler};
