//! Nickname-tagged chat relay over TCP.
//!
//! Clients connect, send a nickname, and from then on every message one
//! client sends is relayed to all the others as a timestamped line. Modules:
//!
//! - [`registry`] tracks which clients are connected and under which nickname.
//! - [`broadcast`] renders lines and fans them out, evicting clients whose
//!   writes fail.
//! - [`session`] drives one connection from handshake to teardown.
//! - [`server`] owns the listener, spawns a session per connection, and force
//!   closes everything on shutdown.
//! - [`framing`] decides how payloads are cut out of the byte stream.
//! - [`client`] is a terminal client for the same protocol.
//! - [`cli`] parses the command line for both modes.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod framing;
pub mod registry;
pub mod server;
pub mod session;
