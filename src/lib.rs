//! Client for Laravel Reverb's Pusher protocol (v7).
//!
//! A long-lived, multiplexed event channel between a process and a Reverb
//! broker: connection lifecycle with keepalive and bounded-backoff
//! reconnection, channel subscription with HMAC admission for private and
//! presence channels, presence roster tracking, and event dispatch to
//! registered async handlers.
//!
//! See [`ReverbClient`] for the entry point.

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod message;
mod transport;

pub use auth::Authenticator;
pub use channel::{Channel, ChannelKind, PresenceMember};
pub use client::ReverbClient;
pub use config::ReverbConfig;
pub use connection::ConnectionState;
pub use error::{ReverbError, Result};
pub use event::{handler, ErrorReporter, Event, EventHandler, HandlerId, LogReporter};
pub use message::{events, Message};
