//! Packet transport seam.
//!
//! The pub/sub layer only ever talks to these traits. Two implementations
//! ship with the crate: [`memory`] for processes sharing an address space
//! (and for tests), and [`tcp`] for separate processes on one or more hosts.

pub mod memory;
pub mod tcp;

pub use memory::{BufferPool, MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use crate::error::LinkError;
use crate::protocol::{Frame, MuxKey, NodeAddress};
use async_trait::async_trait;
use std::time::Duration;

/// Bind/connect primitives of the spacecraft network.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_address(&self) -> NodeAddress;

    async fn bind(&self, key: MuxKey, backlog: usize) -> Result<Box<dyn Listener>, LinkError>;

    /// Returns `Err(NoRoute)` when the remote does not answer within `timeout`.
    async fn connect(
        &self,
        address: NodeAddress,
        key: MuxKey,
        timeout: Duration,
    ) -> Result<Box<dyn Link>, LinkError>;
}

#[async_trait]
pub trait Listener: Send {
    fn local_key(&self) -> MuxKey;

    /// `Ok(None)` when no peer connected within `timeout`.
    async fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn Link>>, LinkError>;
}

/// One established link. Frames sent on a link arrive in send order.
#[async_trait]
pub trait Link: Send {
    fn remote_address(&self) -> NodeAddress;

    async fn send(&mut self, frame: Frame, timeout: Duration) -> Result<(), LinkError>;

    /// `Ok(None)` on timeout, `Err(LinkClosed)` once the peer is gone and
    /// nothing is left to drain.
    async fn read(&mut self, timeout: Duration) -> Result<Option<Frame>, LinkError>;

    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Free transport buffers, when the transport keeps a pool.
    fn buffers_free(&self) -> Option<usize> {
        None
    }
}
