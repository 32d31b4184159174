//! Core types for the vigil policy engine.
//!
//! This crate holds the plain data that crosses between a relay host and
//! the script policy engine. It has no scripting or I/O dependencies.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  vigil-types    : Event, Filter, Decision, ErrorCode  ◄ HERE │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  vigil-runtime  : session/global stores, collaborators,     │
//! │                   configuration                              │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  vigil-lua      : value bridge, script cache, engine        │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  vigil-cli      : `vigil` binary                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Types
//!
//! - [`Event`]: an immutable, signed message submitted by a client
//! - [`Filter`]: a query description selecting a subset of events
//! - [`Decision`]: the accept/reject verdict of one policy invocation
//! - [`ConnectionId`]: process-unique handle for one client connection
//! - [`ErrorCode`]: machine-readable code shared by every error enum

mod connection;
mod decision;
mod error;
mod event;
mod filter;

pub use connection::ConnectionId;
pub use decision::{Decision, DEFAULT_REJECTION, FALLBACK_REJECTION};
pub use error::{assert_error_code, assert_error_codes, ErrorCode, TypeError};
pub use event::Event;
pub use filter::Filter;
