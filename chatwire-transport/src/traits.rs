// ABOUTME: Core Transport trait that all socket backends implement.
// ABOUTME: Defines open/send/close over text frames.

use crate::TransportEvent;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

/// Core trait that all socket backends implement.
///
/// Backends are driven from a single worker task (see
/// [`TransportHandle::spawn`](crate::TransportHandle::spawn)), so calls never
/// overlap. The stream returned by `open` must end once the connection
/// is gone.
pub trait Transport: Send + Sync + 'static {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Open a socket to `url` and return the stream of events it produces
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<BoxStream<'static, TransportEvent>>>;

    /// Send a single text frame on the open socket
    fn send<'a>(&'a self, frame: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Close the socket normally
    fn close<'a>(&'a self) -> BoxFuture<'a, Result<()>>;
}
