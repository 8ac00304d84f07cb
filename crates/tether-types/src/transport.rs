//! Transport trait for the line-delimited JSON channel to the agent process.

use crate::TransportError;
use futures_core::Stream;
use std::future::Future;
use std::pin::Pin;

/// A boxed, sendable future borrowed from `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed stream of parsed inbound JSON objects.
///
/// An `Err` item is terminal: the transport yields nothing after it.
pub type TransportStream =
    Pin<Box<dyn Stream<Item = Result<serde_json::Value, TransportError>> + Send>>;

/// Raw I/O with the agent process.
///
/// The transport owns process lifecycle; the control protocol only writes
/// lines, reads parsed objects and asks for half-close or full close.
/// Dyn-compatible so `Query` works with `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// Write a single line (a serialized JSON object, newline appended by the caller).
    fn write<'a>(&'a self, line: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Take the ordered stream of inbound objects. Can be taken once.
    fn read_messages(&self) -> Result<TransportStream, TransportError>;

    /// Close the agent's input stream (half-close).
    fn end_input(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Close fully and release the underlying process.
    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Whether the transport can currently accept writes.
    fn is_ready(&self) -> bool;
}
