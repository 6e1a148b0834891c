use super::{Link, Listener, Transport};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::protocol::{Frame, MuxKey, NodeAddress};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Fixed pool of transport buffers shared by every link on a network.
///
/// Each frame in flight holds one slot until the receiver takes it off the
/// link. An empty pool makes `send` fail with `BufferExhausted`.
#[derive(Debug, Clone)]
pub struct BufferPool {
    free: Arc<AtomicUsize>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Arc::new(AtomicUsize::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    pub fn try_acquire(&self) -> Option<BufferSlot> {
        let mut current = self.free.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.free.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(BufferSlot {
                        free: Arc::clone(&self.free),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug)]
pub struct BufferSlot {
    free: Arc<AtomicUsize>,
}

impl Drop for BufferSlot {
    fn drop(&mut self) {
        self.free.fetch_add(1, Ordering::AcqRel);
    }
}

type Envelope = (Frame, BufferSlot);

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<(NodeAddress, MuxKey), mpsc::Sender<MemoryLink>>,
}

/// In-process packet network: every node handed out by [`MemoryNetwork::node`]
/// can bind keys and connect to keys bound by the others.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    pool: BufferPool,
}

impl MemoryNetwork {
    pub fn new(buffer_count: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            pool: BufferPool::new(buffer_count),
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(config.buffer_count)
    }

    pub fn node(&self, address: NodeAddress) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            address,
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, NetworkState>, LinkError> {
        self.state
            .lock()
            .map_err(|_| LinkError::Io("memory network state poisoned".into()))
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    address: NodeAddress,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_address(&self) -> NodeAddress {
        self.address
    }

    async fn bind(&self, key: MuxKey, backlog: usize) -> Result<Box<dyn Listener>, LinkError> {
        let mut state = self.network.lock()?;
        if let Some(existing) = state.listeners.get(&(self.address, key)) {
            if !existing.is_closed() {
                return Err(LinkError::AddressInUse(key.value()));
            }
        }

        let (tx, rx) = mpsc::channel(backlog.max(1));
        state.listeners.insert((self.address, key), tx);
        debug!(address = %self.address, key = %key, "Memory listener bound");

        Ok(Box::new(MemoryListener {
            network: self.network.clone(),
            address: self.address,
            key,
            incoming: rx,
        }))
    }

    async fn connect(
        &self,
        address: NodeAddress,
        key: MuxKey,
        _timeout: Duration,
    ) -> Result<Box<dyn Link>, LinkError> {
        let listener = {
            let state = self.network.lock()?;
            state.listeners.get(&(address, key)).cloned()
        }
        .ok_or(LinkError::NoRoute)?;

        let (client, server) = MemoryLink::pair(self.address, address, &self.network.pool);
        // A full backlog or a listener that went away both look like an unreachable peer.
        listener.try_send(server).map_err(|_| LinkError::NoRoute)?;

        Ok(Box::new(client))
    }
}

struct MemoryListener {
    network: MemoryNetwork,
    address: NodeAddress,
    key: MuxKey,
    incoming: mpsc::Receiver<MemoryLink>,
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_key(&self) -> MuxKey {
        self.key
    }

    async fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn Link>>, LinkError> {
        match tokio::time::timeout(timeout, self.incoming.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(link)) => Ok(Some(Box::new(link))),
            Ok(None) => Err(LinkError::LinkClosed),
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.incoming.close();
        if let Ok(mut state) = self.network.state.lock() {
            let stale = state
                .listeners
                .get(&(self.address, self.key))
                .is_some_and(mpsc::Sender::is_closed);
            if stale {
                state.listeners.remove(&(self.address, self.key));
            }
        }
    }
}

pub struct MemoryLink {
    remote: NodeAddress,
    tx: Option<mpsc::UnboundedSender<Envelope>>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    pool: BufferPool,
    closed: bool,
}

impl MemoryLink {
    fn pair(a: NodeAddress, b: NodeAddress, pool: &BufferPool) -> (MemoryLink, MemoryLink) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let a_side = MemoryLink {
            remote: b,
            tx: Some(a_tx),
            rx: a_rx,
            pool: pool.clone(),
            closed: false,
        };
        let b_side = MemoryLink {
            remote: a,
            tx: Some(b_tx),
            rx: b_rx,
            pool: pool.clone(),
            closed: false,
        };
        (a_side, b_side)
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn remote_address(&self) -> NodeAddress {
        self.remote
    }

    async fn send(&mut self, frame: Frame, _timeout: Duration) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::LinkClosed);
        }
        let tx = self.tx.as_ref().ok_or(LinkError::LinkClosed)?;
        if tx.is_closed() {
            return Err(LinkError::LinkClosed);
        }

        let slot = self.pool.try_acquire().ok_or(LinkError::BufferExhausted)?;
        tx.send((frame, slot)).map_err(|_| LinkError::LinkClosed)
    }

    async fn read(&mut self, timeout: Duration) -> Result<Option<Frame>, LinkError> {
        if self.closed {
            return Err(LinkError::LinkClosed);
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some((frame, _slot))) => Ok(Some(frame)),
            Ok(None) => Err(LinkError::LinkClosed),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.tx = None;
        self.rx.close();
        // Release pool slots held by frames nobody will read.
        while self.rx.try_recv().is_ok() {}
    }

    fn is_closed(&self) -> bool {
        self.closed || self.tx.as_ref().map_or(true, mpsc::UnboundedSender::is_closed)
    }

    fn buffers_free(&self) -> Option<usize> {
        Some(self.pool.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    fn key(value: u8) -> MuxKey {
        MuxKey::new(value).unwrap()
    }

    #[test]
    fn test_pool_acquire_release() {
        let pool = BufferPool::new(2);
        let a = pool.try_acquire();
        let b = pool.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[tokio::test]
    async fn test_bind_twice_is_address_in_use() {
        let network = MemoryNetwork::new(4);
        let node = network.node(NodeAddress(1));

        let listener = node.bind(key(10), 2).await.unwrap();
        assert_eq!(listener.local_key(), key(10));
        assert!(matches!(node.bind(key(10), 2).await, Err(LinkError::AddressInUse(10))));

        drop(listener);
        assert!(node.bind(key(10), 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_without_listener_is_no_route() {
        let network = MemoryNetwork::new(4);
        let node = network.node(NodeAddress(2));
        let result = node.connect(NodeAddress(1), key(10), WAIT).await;
        assert!(matches!(result, Err(LinkError::NoRoute)));
    }

    #[tokio::test]
    async fn test_frames_hold_pool_slots_until_read() {
        let network = MemoryNetwork::new(2);
        let server = network.node(NodeAddress(1));
        let client = network.node(NodeAddress(2));

        let mut listener = server.bind(key(10), 1).await.unwrap();
        let mut outbound = client.connect(NodeAddress(1), key(10), WAIT).await.unwrap();
        let mut inbound = listener.accept(WAIT).await.unwrap().unwrap();
        assert_eq!(inbound.remote_address(), NodeAddress(2));

        let frame = Frame::new(key(10), b"abc").unwrap();
        outbound.send(frame.clone(), WAIT).await.unwrap();
        outbound.send(frame.clone(), WAIT).await.unwrap();
        assert_eq!(outbound.buffers_free(), Some(0));
        assert_eq!(outbound.send(frame.clone(), WAIT).await, Err(LinkError::BufferExhausted));

        assert_eq!(inbound.read(WAIT).await.unwrap(), Some(frame));
        assert_eq!(network.pool().available(), 1);
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() {
        let network = MemoryNetwork::new(4);
        let server = network.node(NodeAddress(1));
        let client = network.node(NodeAddress(2));

        let mut listener = server.bind(key(12), 1).await.unwrap();
        let mut outbound = client.connect(NodeAddress(1), key(12), WAIT).await.unwrap();
        let mut inbound = listener.accept(WAIT).await.unwrap().unwrap();

        inbound.close();
        inbound.close();
        assert!(inbound.is_closed());
        assert!(outbound.is_closed());

        let frame = Frame::new(key(12), b"x").unwrap();
        assert_eq!(outbound.send(frame, WAIT).await, Err(LinkError::LinkClosed));
        assert_eq!(outbound.read(WAIT).await, Err(LinkError::LinkClosed));
    }
}
