use super::{Link, Listener, Transport};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::protocol::{Frame, MuxKey, NodeAddress, MAX_FRAME_SIZE};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Length (u16 BE) plus multiplexing key.
const TCP_FRAME_HEADER_LEN: usize = 3;
const READ_CHUNK_SIZE: usize = 512;

/// Packet transport over TCP. A multiplexing key maps to
/// `tcp_base_port + key` on the host configured for a node.
pub struct TcpTransport {
    local: NodeAddress,
    config: LinkConfig,
}

impl TcpTransport {
    pub fn new(local: NodeAddress, config: LinkConfig) -> Self {
        Self { local, config }
    }

    /// Fails for a base port too close to the top of the port range.
    fn port_for(&self, key: MuxKey) -> Result<u16, LinkError> {
        self.config
            .tcp_base_port
            .checked_add(u16::from(key.value()))
            .ok_or(LinkError::InvalidKey(key.value()))
    }

    fn node_for(&self, ip: IpAddr) -> NodeAddress {
        self.config
            .nodes
            .iter()
            .find(|(_, host)| host.parse::<IpAddr>().is_ok_and(|h| h == ip))
            .map_or(NodeAddress(0), |(address, _)| NodeAddress(*address))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_address(&self) -> NodeAddress {
        self.local
    }

    async fn bind(&self, key: MuxKey, _backlog: usize) -> Result<Box<dyn Listener>, LinkError> {
        let host = self.config.host_for(self.local).to_string();
        let port = self.port_for(key)?;
        let listener = TcpListener::bind((host.as_str(), port)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                LinkError::AddressInUse(key.value())
            } else {
                LinkError::from(e)
            }
        })?;
        debug!(host = %host, port, key = %key, "TCP listener bound");

        let nodes = self
            .config
            .nodes
            .iter()
            .filter_map(|(address, host)| Some((host.parse::<IpAddr>().ok()?, NodeAddress(*address))))
            .collect();

        Ok(Box::new(TcpKeyListener { listener, key, nodes }))
    }

    async fn connect(
        &self,
        address: NodeAddress,
        key: MuxKey,
        timeout: Duration,
    ) -> Result<Box<dyn Link>, LinkError> {
        let host = self.config.host_for(address);
        let port = self.port_for(key)?;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Err(_) => return Err(LinkError::NoRoute),
            Ok(Err(e)) => {
                debug!(host = %host, port, error = %e, "TCP connect failed");
                return Err(LinkError::NoRoute);
            }
            Ok(Ok(stream)) => stream,
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Failed to set TCP_NODELAY");
        }
        if let Ok(peer) = stream.peer_addr() {
            debug!(peer = %peer, remote = %self.node_for(peer.ip()), "TCP link established");
        }

        Ok(Box::new(TcpLink::new(stream, address)))
    }
}

struct TcpKeyListener {
    listener: TcpListener,
    key: MuxKey,
    nodes: Vec<(IpAddr, NodeAddress)>,
}

#[async_trait]
impl Listener for TcpKeyListener {
    fn local_key(&self) -> MuxKey {
        self.key
    }

    async fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn Link>>, LinkError> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(LinkError::from(e)),
            Ok(Ok((stream, peer))) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(error = %e, "Failed to set TCP_NODELAY");
                }
                let remote = self
                    .nodes
                    .iter()
                    .find(|(ip, _)| *ip == peer.ip())
                    .map_or(NodeAddress(0), |(_, address)| *address);
                Ok(Some(Box::new(TcpLink::new(stream, remote))))
            }
        }
    }
}

/// Frames are `[len u16 BE][key u8][body]` on the byte stream.
struct TcpLink {
    stream: Option<TcpStream>,
    remote: NodeAddress,
    pending: Vec<u8>,
    peer_closed: bool,
}

impl TcpLink {
    fn new(stream: TcpStream, remote: NodeAddress) -> Self {
        Self {
            stream: Some(stream),
            remote,
            pending: Vec::with_capacity(MAX_FRAME_SIZE + TCP_FRAME_HEADER_LEN),
            peer_closed: false,
        }
    }

    fn take_frame(&mut self) -> Result<Option<Frame>, LinkError> {
        if self.pending.len() < TCP_FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.pending[0], self.pending[1]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(LinkError::Malformed("oversized frame on TCP link"));
        }
        let total = TCP_FRAME_HEADER_LEN + len;
        if self.pending.len() < total {
            return Ok(None);
        }

        // Full frame buffered, split it off
        let key = MuxKey::new(self.pending[2])?;
        let frame = Frame::new(key, &self.pending[TCP_FRAME_HEADER_LEN..total])?;
        self.pending.drain(..total);
        Ok(Some(frame))
    }
}

#[async_trait]
impl Link for TcpLink {
    fn remote_address(&self) -> NodeAddress {
        self.remote
    }

    async fn send(&mut self, frame: Frame, timeout: Duration) -> Result<(), LinkError> {
        if self.peer_closed {
            return Err(LinkError::LinkClosed);
        }
        let stream = self.stream.as_mut().ok_or(LinkError::LinkClosed)?;

        // Length prefix, key, body
        let mut wire = Vec::with_capacity(TCP_FRAME_HEADER_LEN + frame.len());
        wire.extend_from_slice(&(frame.len() as u16).to_be_bytes());
        wire.push(frame.key().value());
        wire.extend_from_slice(frame.body());

        match tokio::time::timeout(timeout, stream.write_all(&wire)).await {
            // The kernel send buffer stayed full for the whole bound.
            Err(_) => Err(LinkError::BufferExhausted),
            Ok(Err(e)) => {
                let err = LinkError::from(e);
                if err == LinkError::LinkClosed {
                    self.peer_closed = true;
                }
                Err(err)
            }
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn read(&mut self, timeout: Duration) -> Result<Option<Frame>, LinkError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }
            if self.peer_closed {
                return Err(LinkError::LinkClosed);
            }
            let stream = self.stream.as_mut().ok_or(LinkError::LinkClosed)?;

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    self.peer_closed = true;
                    return Err(LinkError::LinkClosed);
                }
                Ok(Ok(n)) => self.pending.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(LinkError::from(e)),
            }
        }
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            self.pending.clear();
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none() || self.peer_closed
    }
}
