//! Event bus layer: named processes exchanging signals and method calls.
//!
//! A process builds a [`BusContext`] once at start-up, registering every
//! (interface, member) handler it needs, then pumps it with
//! [`BusContext::dispatch_once`] from its own loop. The handler set cannot
//! change after [`BusContextBuilder::connect`].

pub mod context;
pub mod interfaces;
pub mod message;
pub mod session;

pub use context::{BusContext, BusContextBuilder, BusSender, ContextState, DispatchStats};
pub use interfaces::{BusSignal, PowerStatus};
pub use message::{BusMessage, BusName, BusValue, MessageKind};
pub use session::{SessionBus, SessionConnection};

use crate::error::BusError;
use async_trait::async_trait;
use std::time::Duration;

/// A bus a process can join under a well-known name.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Fails with `NameTaken` if another connection owns `name`, and with
    /// `Unavailable` if the bus is down.
    async fn open(&self, name: &str, inbox_capacity: usize) -> Result<Box<dyn BusConnection>, BusError>;
}

#[async_trait]
pub trait BusConnection: Send {
    fn name(&self) -> &BusName;

    fn unique_name(&self) -> &BusName;

    /// Receive every signal whose interface equals `interface`.
    async fn add_match(&mut self, interface: &str) -> Result<(), BusError>;

    /// Fire-and-forget. Returns the serial the message was stamped with.
    async fn send(&mut self, message: BusMessage) -> Result<u32, BusError>;

    /// Sends a method call and waits up to `timeout` for the reply that
    /// carries its serial. `Ok(None)` if none arrived in time.
    async fn send_with_reply(
        &mut self,
        message: BusMessage,
        timeout: Duration,
    ) -> Result<Option<BusMessage>, BusError>;

    /// Waits up to `timeout` for inbound traffic and returns everything
    /// queued by then, possibly nothing.
    async fn read_write(&mut self, timeout: Duration) -> Result<Vec<BusMessage>, BusError>;

    fn close(&mut self);

    fn is_closed(&self) -> bool;
}
