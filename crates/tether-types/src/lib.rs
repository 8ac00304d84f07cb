//! Shared wire types, transport trait and error hierarchy for Tether.

pub mod control;
pub mod error;
pub mod tool;
pub mod transport;

pub use control::*;
pub use error::{
    CallbackError, ConfigError, DispatchError, TetherError, ToolError, TransportError,
};
pub use tool::*;
pub use transport::{BoxFuture, Transport, TransportStream};
