//! Tunnel agent: keeps a pool of pending relay pipes toward the broker
//!
//! The agent dials a configurable number of relay connections, replaces each
//! one the moment it pairs with public traffic, and re-dials with a fixed
//! delay when the broker drops an unpaired connection.

mod config;
mod pool;

pub use config::{AgentConfig, AgentError};
pub use pool::{Agent, AgentHandle};
