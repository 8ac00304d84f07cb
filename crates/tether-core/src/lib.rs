//! Control-protocol multiplexer for driving an agent process over
//! line-delimited JSON.
//!
//! A [`Query`] owns one session: it correlates outbound control requests with
//! their responses, answers the agent's inbound permission, hook and tool
//! requests, and forwards everything else as data messages.

mod dispatch;
mod options;
mod pending;
mod query;
pub mod transport;

pub use options::QueryOptions;
pub use query::{DATA_CHANNEL_CAPACITY, DataMessage, MessageStream, Query};
pub use transport::SubprocessTransport;
