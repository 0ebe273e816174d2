//! ensemble - read-only capable sessions for a replicated coordination service
//!
//! Client side: a session state machine that keeps serving reads from a
//! minority node while the ensemble has no quorum, probes for a majority node
//! in the background and migrates back once one answers.
//!
//! Server side: the gate that decides, per handshake, whether a node accepts
//! read-write, read-only, or no connections at all, and refuses writes on
//! read-only connections.

pub mod cli;
pub mod client;
pub mod observability;
pub mod protocol;
pub mod roster;
pub mod server;
pub mod transport;
