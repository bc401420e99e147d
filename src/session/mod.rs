//! Conference sessions
//!
//! A session owns one control listener and two media sockets, tracks who
//! is connected on which channel, and switches between relayed and direct
//! topologies as membership changes.

pub mod client;
pub mod conference;
pub mod connection;
pub mod topology;

pub use client::{host_port, ClientSession, Outbound, TextLink};
pub use conference::{ConferenceSession, StopReason};
pub(crate) use conference::SessionState;
pub use connection::handle_connection;
pub use topology::{plan, Transition};
