//! Gossip node for a distributed ledger
//!
//! This crate implements the peer-to-peer gossip layer of a ledger node: it
//! manages TCP connections to neighbors, frames and negotiates the wire
//! protocol, deduplicates and validates incoming transactions once, tracks
//! outstanding data requests and fans new data out to all compatible peers.
//!
//! Ledger storage, transaction validation and peer discovery are external and
//! plugged in through the traits in [`storage`] and [`node::DiscoveryEvent`].
//!
//! ## Layout
//!
//! - [`network`]: framing, handshake, peers and the connection manager
//! - [`gossip`]: request queue, work-unit processor, broadcast queue
//! - [`node`]: wiring and lifecycle of all components
//! - [`storage`]: collaborator interfaces and an in-memory store
//! - [`config`]: configuration values
//! - [`utils`]: logging, shutdown signal and small helpers

pub mod config;
pub mod gossip;
pub mod network;
pub mod node;
pub mod storage;
pub mod utils;

pub use config::GossipConfig;
pub use gossip::Collaborators;
pub use node::{DiscoveryEvent, GossipEvent, GossipNode};
