//! WebSocket chat over a plain-text frame protocol.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`frame`] defines the wire vocabulary: presence updates are recognised
//!   by the `"Online Users: "` prefix and the first client frame is the
//!   sender's display name.
//! - [`endpoint`] owns one client WebSocket session and turns inbound frames
//!   into an ordered stream of [`endpoint::ChatEvent`]s.
//! - [`broker`] accepts WebSocket connections, tracks who is online, and
//!   fans chat lines out over a Tokio `broadcast` channel.
//! - [`cli`] parses the command-line interface for broker and client modes.
//! - [`client`] is the terminal front-end driving an endpoint from stdin.
//!
//! Sessions are one-shot: a closed endpoint never reconnects.

pub mod broker;
pub mod cli;
pub mod client;
pub mod endpoint;
pub mod frame;
