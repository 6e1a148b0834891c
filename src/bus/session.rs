use super::message::{BusMessage, BusName, MessageKind, ERROR_SERVICE_UNKNOWN};
use super::{BusConnection, BusTransport};
use crate::error::BusError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

type PeerId = u32;

struct Peer {
    unique: BusName,
    name: BusName,
    matches: Vec<String>,
    inbox: mpsc::Sender<BusMessage>,
}

struct SessionState {
    running: bool,
    peers: BTreeMap<PeerId, Peer>,
    owners: HashMap<BusName, PeerId>,
    pending: HashMap<(PeerId, u32), oneshot::Sender<BusMessage>>,
    next_peer: PeerId,
}

impl SessionState {
    fn lookup(&self, name: Option<&BusName>) -> Option<PeerId> {
        name.and_then(|name| self.owners.get(name).copied())
    }

    fn route(&mut self, message: BusMessage) {
        match message.kind() {
            MessageKind::Signal => {
                let target = message.destination().map(|d| self.lookup(Some(d)));
                for (id, peer) in &self.peers {
                    let addressed = target.map_or(true, |t| t == Some(*id));
                    if addressed && peer.matches.iter().any(|m| m == message.interface()) {
                        deliver(peer, message.clone());
                    }
                }
            }
            MessageKind::MethodCall => match self.lookup(message.destination()) {
                Some(id) => {
                    if let Some(peer) = self.peers.get(&id) {
                        deliver(peer, message);
                    }
                }
                None => {
                    let destination = message.destination().map(BusName::to_string).unwrap_or_default();
                    debug!(destination = %destination, member = message.member(), "No owner for method call");
                    let error = BusMessage::error(
                        &message,
                        ERROR_SERVICE_UNKNOWN,
                        &format!("The name {destination} was not provided by any service"),
                    );
                    self.route_reply(error);
                }
            },
            MessageKind::MethodReturn | MessageKind::Error => self.route_reply(message),
        }
    }

    fn route_reply(&mut self, message: BusMessage) {
        let Some(target) = self.lookup(message.destination()) else {
            trace!(member = message.member(), "Reply for a departed caller dropped");
            return;
        };
        if let Some(waiter) = message
            .reply_serial()
            .and_then(|serial| self.pending.remove(&(target, serial)))
        {
            // The caller may have timed out in the meantime.
            let _ = waiter.send(message);
            return;
        }
        if let Some(peer) = self.peers.get(&target) {
            deliver(peer, message);
        }
    }

    fn remove_peer(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.remove(&id) {
            self.owners.remove(&peer.name);
            self.owners.remove(&peer.unique);
            self.pending.retain(|(owner, _), _| *owner != id);
            debug!(name = %peer.name, unique = %peer.unique, "Bus name released");
        }
    }
}

fn deliver(peer: &Peer, message: BusMessage) {
    if let Err(e) = peer.inbox.try_send(message) {
        warn!(peer = %peer.name, error = %e, "Bus inbox full, message dropped");
    }
}

/// In-process session bus.
///
/// Cloning yields another handle to the same bus. Signals reach every
/// connection with a matching rule, method calls reach the owner of their
/// destination name, and replies go back to whoever is waiting on their
/// serial.
#[derive(Clone)]
pub struct SessionBus {
    state: Arc<Mutex<SessionState>>,
}

impl SessionBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState {
                running: true,
                peers: BTreeMap::new(),
                owners: HashMap::new(),
                pending: HashMap::new(),
                next_peer: 0,
            })),
        }
    }

    pub fn has_owner(&self, name: &str) -> bool {
        let Ok(name) = BusName::parse(name) else {
            return false;
        };
        self.lock().map(|state| state.owners.contains_key(&name)).unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().map(|state| state.peers.len()).unwrap_or(0)
    }

    /// Stops the bus. Every connection sees `Disconnected` from then on and
    /// new ones fail with `Unavailable`.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.lock() {
            state.running = false;
            state.peers.clear();
            state.owners.clear();
            state.pending.clear();
            info!("Session bus shut down");
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>, BusError> {
        self.state.lock().map_err(|_| BusError::Unavailable)
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for SessionBus {
    async fn open(&self, name: &str, inbox_capacity: usize) -> Result<Box<dyn BusConnection>, BusError> {
        let name = BusName::parse(name)?;
        let mut state = self.lock()?;
        if !state.running {
            return Err(BusError::Unavailable);
        }
        if state.owners.contains_key(&name) {
            return Err(BusError::NameTaken(name.to_string()));
        }

        // Unique names are never reused on one bus
        state.next_peer += 1;
        let id = state.next_peer;
        let unique = BusName::parse(&format!(":1.{id}"))?;
        let (tx, rx) = mpsc::channel(inbox_capacity.max(1));

        state.peers.insert(
            id,
            Peer {
                unique,
                name,
                matches: Vec::new(),
                inbox: tx,
            },
        );
        state.owners.insert(name, id);
        state.owners.insert(unique, id);
        info!(name = %name, unique = %unique, "Bus name acquired");

        Ok(Box::new(SessionConnection {
            bus: self.clone(),
            id,
            name,
            unique,
            inbox: rx,
            next_serial: 0,
            closed: false,
        }))
    }
}

/// One process' membership on a [`SessionBus`]. Dropping it releases the name.
pub struct SessionConnection {
    bus: SessionBus,
    id: PeerId,
    name: BusName,
    unique: BusName,
    inbox: mpsc::Receiver<BusMessage>,
    next_serial: u32,
    closed: bool,
}

impl SessionConnection {
    fn check_open(&self) -> Result<(), BusError> {
        if self.closed {
            Err(BusError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn stamp(&mut self, message: &mut BusMessage) -> u32 {
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        message.stamp(self.next_serial, self.unique);
        self.next_serial
    }

    fn running_state(&self) -> Result<MutexGuard<'_, SessionState>, BusError> {
        let state = self.bus.lock()?;
        if !state.running {
            return Err(BusError::Unavailable);
        }
        if !state.peers.contains_key(&self.id) {
            return Err(BusError::Disconnected);
        }
        Ok(state)
    }
}

#[async_trait]
impl BusConnection for SessionConnection {
    fn name(&self) -> &BusName {
        &self.name
    }

    fn unique_name(&self) -> &BusName {
        &self.unique
    }

    async fn add_match(&mut self, interface: &str) -> Result<(), BusError> {
        self.check_open()?;
        let mut state = self.running_state()?;
        if let Some(peer) = state.peers.get_mut(&self.id) {
            if !peer.matches.iter().any(|m| m == interface) {
                peer.matches.push(interface.to_string());
            }
        }
        debug!(name = %self.name, interface, "Match rule added");
        Ok(())
    }

    async fn send(&mut self, mut message: BusMessage) -> Result<u32, BusError> {
        self.check_open()?;
        let serial = self.stamp(&mut message);
        self.running_state()?.route(message);
        Ok(serial)
    }

    async fn send_with_reply(
        &mut self,
        mut message: BusMessage,
        timeout: Duration,
    ) -> Result<Option<BusMessage>, BusError> {
        self.check_open()?;
        if message.kind() != MessageKind::MethodCall {
            return Err(BusError::InvalidState {
                expected: MessageKind::MethodCall.as_str(),
                found: message.kind().as_str(),
            });
        }

        let serial = self.stamp(&mut message);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.running_state()?;
            state.pending.insert((self.id, serial), tx);
            state.route(message);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(BusError::Disconnected),
            Err(_) => {
                if let Ok(mut state) = self.bus.lock() {
                    state.pending.remove(&(self.id, serial));
                }
                Ok(None)
            }
        }
    }

    async fn read_write(&mut self, timeout: Duration) -> Result<Vec<BusMessage>, BusError> {
        self.check_open()?;
        let first = match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(None) => return Err(BusError::Disconnected),
            Ok(Some(message)) => message,
        };

        let mut messages = vec![first];
        while let Ok(message) = self.inbox.try_recv() {
            messages.push(message);
        }
        Ok(messages)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.inbox.close();
        if let Ok(mut state) = self.bus.lock() {
            state.remove_peer(self.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SessionConnection {
    fn drop(&mut self) {
        self.close();
    }
}
