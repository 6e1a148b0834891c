use crate::error::LinkError;
use crate::protocol::{Frame, MuxKey, NodeAddress};
use crate::service::{HousekeepingService, LinkStatus, ServiceHandler, PING_REPLY, PING_REQUEST};
use crate::transport::{Link, Transport};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConnectionStats {
    pub frames_sent: u32,
    pub frames_received: u32,
    pub frames_diverted: u32,
    pub send_failures: u32,
}

/// One owned link to a remote endpoint.
///
/// The multiplexing key is fixed when the connection is created: the remote
/// service key for outbound connections, the bound key for accepted ones.
pub struct Connection {
    remote_address: NodeAddress,
    key: MuxKey,
    link: Box<dyn Link>,
    service: Box<dyn ServiceHandler>,
    stats: ConnectionStats,
    next_ping: u16,
}

impl Connection {
    /// Opens an outbound link, failing with `NoRoute` if the remote does not
    /// answer within `timeout`.
    pub async fn connect(
        transport: &dyn Transport,
        address: NodeAddress,
        key: MuxKey,
        timeout: Duration,
    ) -> Result<Self, LinkError> {
        let link = transport.connect(address, key, timeout).await?;
        debug!(remote = %address, key = %key, "Connection established");
        Ok(Self::from_link(link, key))
    }

    pub(crate) fn from_link(link: Box<dyn Link>, key: MuxKey) -> Self {
        Self {
            remote_address: link.remote_address(),
            key,
            link,
            service: Box::new(HousekeepingService::new()),
            stats: ConnectionStats::default(),
            next_ping: 0,
        }
    }

    /// Replaces the handler that receives traffic on unexpected keys.
    pub fn with_service(mut self, service: Box<dyn ServiceHandler>) -> Self {
        self.service = service;
        self
    }

    pub fn remote_address(&self) -> NodeAddress {
        self.remote_address
    }

    pub fn key(&self) -> MuxKey {
        self.key
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    /// Sends `bytes` on this connection's own key.
    pub async fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), LinkError> {
        let frame = Frame::new(self.key, bytes)?;
        self.send_frame(frame, timeout).await
    }

    pub async fn send_frame(&mut self, frame: Frame, timeout: Duration) -> Result<(), LinkError> {
        match self.link.send(frame, timeout).await {
            Ok(()) => {
                self.stats.frames_sent = self.stats.frames_sent.wrapping_add(1);
                Ok(())
            }
            Err(e) => {
                self.stats.send_failures = self.stats.send_failures.wrapping_add(1);
                Err(e)
            }
        }
    }

    /// `Ok(None)` means nothing arrived within `timeout`.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, LinkError> {
        let frame = self.link.read(timeout).await?;
        if frame.is_some() {
            self.stats.frames_received = self.stats.frames_received.wrapping_add(1);
        } else {
            trace!(remote = %self.remote_address, "Receive timed out");
        }
        Ok(frame)
    }

    /// Receives one frame and returns it only if it carries `expected`.
    ///
    /// Anything else goes to the service handler and this call yields
    /// `Ok(None)`, the same as a timeout.
    pub async fn receive_keyed(
        &mut self,
        expected: MuxKey,
        timeout: Duration,
    ) -> Result<Option<Frame>, LinkError> {
        let Some(frame) = self.receive(timeout).await? else {
            return Ok(None);
        };
        if frame.key() == expected {
            return Ok(Some(frame));
        }

        self.divert(&frame, timeout).await;
        Ok(None)
    }

    /// Round-trip time of a ping answered by the remote's service handler,
    /// or `Ok(None)` if no answer came back within `timeout`.
    ///
    /// Non-ping traffic read while waiting is handed to the service handler.
    pub async fn ping(&mut self, timeout: Duration) -> Result<Option<Duration>, LinkError> {
        let seq = self.next_ping;
        self.next_ping = self.next_ping.wrapping_add(1);
        let [hi, lo] = seq.to_be_bytes();

        let started = Instant::now();
        let deadline = started + timeout;
        self.send_frame(Frame::new(MuxKey::PING, &[PING_REQUEST, hi, lo])?, timeout)
            .await?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some(frame) = self.receive_keyed(MuxKey::PING, remaining).await? else {
                continue;
            };
            // Only our own sequence number counts as an answer
            if frame.body() == &[PING_REPLY, hi, lo][..] {
                return Ok(Some(started.elapsed()));
            }
            // A ping from the other side, or a stale reply.
            self.divert(&frame, remaining).await;
        }
    }

    /// Releases the link. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.link.is_closed() {
            debug!(remote = %self.remote_address, key = %self.key, "Closing connection");
        }
        self.link.close();
    }

    async fn divert(&mut self, frame: &Frame, timeout: Duration) {
        self.stats.frames_diverted = self.stats.frames_diverted.wrapping_add(1);
        let status = LinkStatus {
            buffers_free: self.link.buffers_free(),
        };
        if let Some(reply) = self.service.handle(frame, status) {
            if let Err(e) = self.link.send(reply, timeout).await {
                debug!(error = %e, "Service reply not sent");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.link.close();
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_address", &self.remote_address)
            .field("key", &self.key)
            .field("closed", &self.link.is_closed())
            .field("stats", &self.stats)
            .finish()
    }
}
