//! Socket pipe: the forwarding unit between a relay leg and a target leg
//!
//! A pipe dials the relay side of the tunnel, performs the authorization
//! handshake, buffers inbound bytes until the target leg exists, and then
//! forwards bytes unmodified in both directions until either leg closes.

mod buffer;
mod pipe;

pub use buffer::PendingBuffer;
pub use pipe::{
    forward_pair, next_pipe_id, PipeConfig, PipeEvent, PipeId, PipeRole, SocketPipe,
};
