use crate::config::LinkConfig;
use crate::connection::Connection;
use crate::error::LinkError;
use crate::fanout::TopicFilter;
use crate::protocol::{MuxKey, NodeAddress, TelemetryPacket, TelemetryRequest, TopicMask};
use crate::transport::Transport;
use std::time::Duration;
use tracing::{debug, info};

/// Client side of a telemetry stream.
///
/// Requests are fire-and-forget: the publisher never acknowledges them, so
/// the mask kept here is what this side asked for, not what the publisher
/// necessarily applied.
pub struct Subscriber {
    connection: Connection,
    control_key: MuxKey,
    send_timeout: Duration,
    filter: TopicFilter,
}

impl Subscriber {
    /// Connects to the publisher at `address`/`key` and declares `topic_mask`.
    pub async fn subscribe(
        transport: &dyn Transport,
        address: NodeAddress,
        key: MuxKey,
        topic_mask: TopicMask,
        config: &LinkConfig,
    ) -> Result<Self, LinkError> {
        if key == config.control_key || key.is_service() {
            return Err(LinkError::InvalidKey(key.value()));
        }
        let connection = Connection::connect(transport, address, key, config.connect_timeout()).await?;
        let mut subscriber = Self {
            connection,
            control_key: config.control_key,
            send_timeout: config.send_timeout(),
            filter: TopicFilter::default(),
        };
        subscriber.add_topics(topic_mask).await?;
        info!(publisher = %address, key = %key, mask = topic_mask, "Subscribed");
        Ok(subscriber)
    }

    pub fn key(&self) -> MuxKey {
        self.connection.key()
    }

    pub fn publisher(&self) -> NodeAddress {
        self.connection.remote_address()
    }

    /// The mask requested so far, `None` after a full unsubscribe.
    pub fn mask(&self) -> Option<TopicMask> {
        self.filter.is_active().then(|| self.filter.mask())
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Waits up to `timeout` for the next telemetry packet.
    ///
    /// `Ok(None)` covers both a timeout and a frame on another key, which
    /// went to the connection's service handler instead.
    pub async fn read(&mut self, timeout: Duration) -> Result<Option<TelemetryPacket>, LinkError> {
        let key = self.connection.key();
        match self.connection.receive_keyed(key, timeout).await? {
            Some(frame) => TelemetryPacket::from_frame(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Asks for more topics on top of the current ones.
    pub async fn add_topics(&mut self, topic_mask: TopicMask) -> Result<(), LinkError> {
        self.request(TelemetryRequest::subscribe(topic_mask)).await?;
        self.filter.subscribe(topic_mask);
        Ok(())
    }

    /// Stops some topics, or all of them with `ALL_TOPICS`.
    ///
    /// The connection stays open; the publisher keeps it on its fan-out
    /// list until it is closed.
    pub async fn unsubscribe(&mut self, topic_mask: TopicMask) -> Result<(), LinkError> {
        self.request(TelemetryRequest::unsubscribe(topic_mask)).await?;
        self.filter.unsubscribe(topic_mask);
        Ok(())
    }

    /// Asks the publisher to resend its latest packet from every matching
    /// source. `ALL_TOPICS` means "whatever I am subscribed to".
    pub async fn request_snapshot(&mut self, topic_mask: TopicMask) -> Result<(), LinkError> {
        self.request(TelemetryRequest::snapshot(topic_mask)).await
    }

    /// Tells the publisher to drop this subscriber, then closes the link.
    pub async fn disconnect(mut self) -> Result<(), LinkError> {
        let result = self.request(TelemetryRequest::disconnect()).await;
        self.connection.close();
        result
    }

    pub fn close(&mut self) {
        self.connection.close();
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    async fn request(&mut self, request: TelemetryRequest) -> Result<(), LinkError> {
        let frame = request.to_frame(self.control_key)?;
        debug!(kind = ?request.kind, mask = request.topic_mask, "Sending request");
        self.connection.send_frame(frame, self.send_timeout).await
    }
}

impl core::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscriber")
            .field("connection", &self.connection)
            .field("control_key", &self.control_key)
            .field("mask", &self.mask())
            .finish()
    }
}
