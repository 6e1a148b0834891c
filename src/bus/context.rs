use super::interfaces::BusSignal;
use super::message::{BusMessage, BusName, BusValue, MessageKind, ERROR_FAILED};
use super::{BusConnection, BusTransport};
use crate::config::{BusConfig, HandlerConflict};
use crate::error::BusError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Callback run for every inbound message matching its (interface, member).
pub type Handler = Box<dyn FnMut(&BusMessage, &mut BusSender) -> Result<(), BusError> + Send>;

type HandlerKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContextState {
    Uninitialized,
    Ready,
    Listening,
    Dispatching,
    Destroyed,
}

impl ContextState {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextState::Uninitialized => "uninitialized",
            ContextState::Ready => "ready",
            ContextState::Listening => "listening",
            ContextState::Dispatching => "dispatching",
            ContextState::Destroyed => "destroyed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub received: usize,
    pub handled: usize,
    pub unmatched: usize,
    pub failed: usize,
}

/// Outgoing messages queued by a handler. They are sent once the handler
/// returns, in the order they were queued.
#[derive(Debug, Default)]
pub struct BusSender {
    outgoing: Vec<BusMessage>,
}

impl BusSender {
    pub fn reply(&mut self, call: &BusMessage, args: impl IntoIterator<Item = BusValue>) {
        self.outgoing.push(BusMessage::method_return(call).with_args(args));
    }

    pub fn reply_error(&mut self, call: &BusMessage, error_name: &str, text: &str) {
        self.outgoing.push(BusMessage::error(call, error_name, text));
    }

    pub fn broadcast(&mut self, signal: BusMessage) {
        self.outgoing.push(signal);
    }

    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }

    fn has_reply_to(&self, serial: u32) -> bool {
        self.outgoing.iter().any(|m| m.reply_serial() == Some(serial))
    }
}

fn check_member(interface: &str, member: &str) -> Result<(), BusError> {
    BusName::parse(interface)?;
    if member.is_empty() || !member.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BusError::InvalidName(format!("{interface}.{member}")));
    }
    Ok(())
}

/// Collects handlers and match rules before a context joins the bus.
pub struct BusContextBuilder {
    process_name: String,
    config: BusConfig,
    handlers: BTreeMap<HandlerKey, Handler>,
    listen: Vec<String>,
}

impl BusContextBuilder {
    pub fn new(process_name: &str) -> Self {
        Self {
            process_name: process_name.to_string(),
            config: BusConfig::default(),
            handlers: BTreeMap::new(),
            listen: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn state(&self) -> ContextState {
        ContextState::Uninitialized
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Registers `handler` for (`interface`, `member`).
    ///
    /// A second registration for the same pair is dropped with a warning
    /// under [`HandlerConflict::KeepFirst`], so the first one registered is
    /// the one that runs. Under [`HandlerConflict::Reject`] it is an error.
    pub fn handler<F>(mut self, interface: &str, member: &str, handler: F) -> Result<Self, BusError>
    where
        F: FnMut(&BusMessage, &mut BusSender) -> Result<(), BusError> + Send + 'static,
    {
        check_member(interface, member)?;
        let key = (interface.to_string(), member.to_string());

        if self.handlers.contains_key(&key) {
            match self.config.handler_conflict {
                HandlerConflict::KeepFirst => {
                    warn!(interface, member, "Handler already registered, ignoring the new one");
                    return Ok(self);
                }
                HandlerConflict::Reject => {
                    return Err(BusError::DuplicateHandler {
                        interface: key.0,
                        member: key.1,
                    })
                }
            }
        }

        self.handlers.insert(key, Box::new(handler));
        Ok(self)
    }

    /// Registers a handler that receives the signal already decoded.
    pub fn on_signal<T, F>(self, mut handler: F) -> Result<Self, BusError>
    where
        T: BusSignal + 'static,
        F: FnMut(T, &mut BusSender) -> Result<(), BusError> + Send + 'static,
    {
        self.handler(T::INTERFACE, T::MEMBER, move |message, sender| {
            handler(T::from_message(message)?, sender)
        })
    }

    /// Adds a match rule applied when the context connects.
    pub fn listen(mut self, interface: &str) -> Self {
        if !self.listen.iter().any(|i| i == interface) {
            self.listen.push(interface.to_string());
        }
        self
    }

    /// Joins the bus under the process name. The handler set is frozen from
    /// here on.
    pub async fn connect(self, transport: &dyn BusTransport) -> Result<BusContext, BusError> {
        let mut connection = transport
            .open(&self.process_name, self.config.inbox_capacity)
            .await?;
        for interface in &self.listen {
            connection.add_match(interface).await?;
        }

        let state = if self.listen.is_empty() {
            ContextState::Ready
        } else {
            ContextState::Listening
        };
        info!(
            name = %connection.name(),
            unique = %connection.unique_name(),
            handlers = self.handlers.len(),
            "Bus context ready"
        );

        Ok(BusContext {
            connection,
            handlers: self.handlers,
            state,
            config: self.config,
        })
    }
}

impl core::fmt::Debug for BusContextBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BusContextBuilder")
            .field("process_name", &self.process_name)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("listen", &self.listen)
            .finish()
    }
}

/// A process' handle on the bus: its connection plus the frozen handler set.
pub struct BusContext {
    connection: Box<dyn BusConnection>,
    handlers: BTreeMap<HandlerKey, Handler>,
    state: ContextState,
    config: BusConfig,
}

impl BusContext {
    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn name(&self) -> &BusName {
        self.connection.name()
    }

    pub fn unique_name(&self) -> &BusName {
        self.connection.unique_name()
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn has_handler(&self, interface: &str, member: &str) -> bool {
        self.handlers
            .contains_key(&(interface.to_string(), member.to_string()))
    }

    /// Starts receiving every signal on `interface`.
    pub async fn listen(&mut self, interface: &str) -> Result<(), BusError> {
        self.expect_idle()?;
        self.connection.add_match(interface).await?;
        self.state = ContextState::Listening;
        Ok(())
    }

    /// Pumps the bus once and runs the matching handler for every message
    /// that arrived within `timeout`. Messages nobody handles are dropped.
    pub async fn dispatch_once(&mut self, timeout: Duration) -> Result<DispatchStats, BusError> {
        self.expect_idle()?;
        let resume = self.state;
        self.state = ContextState::Dispatching;
        let result = self.pump(timeout).await;
        self.state = resume;
        result
    }

    /// Sends a signal without waiting for anything.
    pub async fn broadcast(&mut self, message: BusMessage) -> Result<u32, BusError> {
        self.expect_idle()?;
        self.connection.send(message).await
    }

    /// Sends a method call and waits up to `timeout` for its reply.
    ///
    /// `Ok(None)` means no reply arrived in time. An error reply becomes
    /// [`BusError::Remote`].
    pub async fn call(
        &mut self,
        message: BusMessage,
        timeout: Duration,
    ) -> Result<Option<BusMessage>, BusError> {
        self.expect_idle()?;
        let member = message.member().to_string();
        match self.connection.send_with_reply(message, timeout).await? {
            Some(reply) if reply.kind() == MessageKind::Error => Err(BusError::Remote {
                name: reply.error_name().unwrap_or(ERROR_FAILED).to_string(),
                message: reply.error_text().to_string(),
            }),
            Some(reply) => Ok(Some(reply)),
            None => {
                debug!(member = %member, timeout_ms = timeout.as_millis() as u64, "Call got no reply");
                Ok(None)
            }
        }
    }

    /// [`BusContext::call`] with the configured default timeout.
    pub async fn request(&mut self, message: BusMessage) -> Result<Option<BusMessage>, BusError> {
        let timeout = self.config.call_timeout();
        self.call(message, timeout).await
    }

    /// Drops every handler and releases the bus name.
    pub fn destroy(mut self) {
        self.release();
    }

    fn expect_idle(&self) -> Result<(), BusError> {
        match self.state {
            ContextState::Ready | ContextState::Listening => Ok(()),
            found => Err(BusError::InvalidState {
                expected: "ready or listening",
                found: found.as_str(),
            }),
        }
    }

    async fn pump(&mut self, timeout: Duration) -> Result<DispatchStats, BusError> {
        let messages = self.connection.read_write(timeout).await?;
        let mut stats = DispatchStats {
            received: messages.len(),
            ..DispatchStats::default()
        };

        // Every drained message runs its handler, even after a failed send.
        let mut first_error = None;
        for message in messages {
            let outgoing = self.invoke(&message, &mut stats);
            for reply in outgoing {
                if let Err(e) = self.connection.send(reply).await {
                    warn!(member = message.member(), error = %e, "Queued message not sent");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    fn invoke(&mut self, message: &BusMessage, stats: &mut DispatchStats) -> Vec<BusMessage> {
        if !matches!(message.kind(), MessageKind::Signal | MessageKind::MethodCall) {
            stats.unmatched += 1;
            debug!(kind = message.kind().as_str(), member = message.member(), "Stray reply dropped");
            return Vec::new();
        }

        let key = (message.interface().to_string(), message.member().to_string());
        let Some(handler) = self.handlers.get_mut(&key) else {
            stats.unmatched += 1;
            debug!(interface = message.interface(), member = message.member(), "No handler, message dropped");
            return Vec::new();
        };

        let mut sender = BusSender::default();
        match handler(message, &mut sender) {
            Ok(()) => stats.handled += 1,
            Err(e) => {
                stats.failed += 1;
                warn!(interface = message.interface(), member = message.member(), error = %e, "Handler failed");
                if message.kind() == MessageKind::MethodCall && !sender.has_reply_to(message.serial()) {
                    sender.reply_error(message, ERROR_FAILED, &e.to_string());
                }
            }
        }
        sender.outgoing
    }

    fn release(&mut self) {
        if self.state == ContextState::Destroyed {
            return;
        }
        info!(name = %self.connection.name(), "Bus context destroyed");
        self.handlers.clear();
        self.connection.close();
        self.state = ContextState::Destroyed;
    }
}

impl Drop for BusContext {
    fn drop(&mut self) {
        self.release();
    }
}

impl core::fmt::Debug for BusContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BusContext")
            .field("name", self.connection.name())
            .field("state", &self.state)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
