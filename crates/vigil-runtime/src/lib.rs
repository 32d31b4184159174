//! vigil runtime - host-side state shared by every policy invocation.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  vigil-types   : Event, Filter, Decision, ErrorCode          │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Runtime Layer (THIS CRATE)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  store/      : GlobalStore, SessionStore                     │
//! │  query/      : EventQuery, EventStream, MemoryStore          │
//! │  connection/ : ConnectionContext, ConnectionSnapshot         │
//! │  config/     : VigilConfig, ConfigLoader                     │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  vigil-lua     : script cache, bridge, engine, service       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! ## [`store`] - Key/Value Side Stores
//!
//! - [`GlobalStore`]: one process-wide bag shared by every script
//! - [`SessionStore`]: one bag per open connection, dropped on disconnect
//! - [`SessionHandle`]: the bag one invocation bound when it started
//!
//! ## [`query`] - Storage Collaborator
//!
//! - [`EventQuery`]: the `query(filter) -> events` capability the relay
//!   hands to the engine
//! - [`EventStream`]: lazy, finite, single-pass result sequence
//! - [`MemoryStore`]: in-process implementation for tests and the CLI
//!
//! ## [`connection`] - Caller Identity
//!
//! - [`ConnectionContext`]: what the transport knows about the caller
//! - [`ConnectionSnapshot`]: owned, immutable copy taken per invocation
//!
//! ## [`config`] - Configuration Management
//!
//! - [`VigilConfig`](config::VigilConfig): unified settings
//! - [`ConfigLoader`](config::ConfigLoader): layered loading

pub mod config;
pub mod connection;
pub mod query;
pub mod store;

pub use connection::{ConnectionContext, ConnectionSnapshot};
pub use query::{EventQuery, EventStream, MemoryStore, QueryError};
pub use store::{GlobalStore, KvBag, SessionHandle, SessionStore};
