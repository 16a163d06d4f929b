//! Pairing broker: the public side of a pinhole tunnel
//!
//! Accepts relay connections from tunnel agents, authenticates and queues
//! them per tunnel identity, and pairs each inbound public connection with
//! the oldest queued relay connection for the matching identity.

mod config;
mod health;
mod queues;
mod server;

pub use config::{BrokerConfig, BrokerError, CnToTunnelKey, TunnelKey};
pub use queues::TunnelQueues;
pub use server::{BoundBroker, Broker, BrokerHandle};
