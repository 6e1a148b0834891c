use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::fanout::{should_deliver, FanOut, PublishReport, SubscriberId, Subscription};
use crate::protocol::{Frame, MuxKey, RequestKind, TelemetryPacket, TelemetryRequest, ALL_TOPICS};
use crate::server::Endpoint;
use crate::transport::Transport;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requests taken from one subscriber per poll, so a chatty subscriber
/// cannot starve the others.
const MAX_REQUESTS_PER_POLL: usize = 8;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PublisherStats {
    pub packets_published: u32,
    pub deliveries: u64,
    pub evictions: u32,
    pub requests_handled: u32,
    pub malformed_requests: u32,
    pub rejected_subscribers: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceReport {
    pub accepted: Option<SubscriberId>,
    pub requests: usize,
    pub evicted: Vec<SubscriberId>,
}

/// Producer side of a telemetry stream: an endpoint, its fan-out list, and
/// the latest packet seen from every source for snapshot requests.
pub struct Publisher {
    endpoint: Endpoint,
    fanout: FanOut,
    latest: BTreeMap<u16, TelemetryPacket>,
    config: LinkConfig,
    stats: PublisherStats,
}

impl Publisher {
    pub async fn bind(
        transport: &dyn Transport,
        key: MuxKey,
        config: LinkConfig,
    ) -> Result<Self, LinkError> {
        // Data never shares a key with requests or housekeeping replies.
        if key == config.control_key || key.is_service() {
            return Err(LinkError::InvalidKey(key.value()));
        }
        let endpoint = Endpoint::bind(transport, key, config.max_subscribers).await?;
        Ok(Self {
            fanout: FanOut::new(endpoint.max_connections()),
            endpoint,
            latest: BTreeMap::new(),
            config,
            stats: PublisherStats::default(),
        })
    }

    pub fn key(&self) -> MuxKey {
        self.endpoint.local_key()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
    }

    pub fn num_subscribers(&self) -> usize {
        self.fanout.len()
    }

    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.fanout.ids()
    }

    pub fn subscription(&self, id: SubscriberId) -> Option<&Subscription> {
        self.fanout.get(id)
    }

    pub fn is_subscribed(&self, id: SubscriberId, topic: u16) -> bool {
        self.fanout.get(id).is_some_and(|s| s.filter().accepts(topic))
    }

    pub fn latest(&self, source_id: u16) -> Option<&TelemetryPacket> {
        self.latest.get(&source_id)
    }

    /// Accepts at most one subscriber. Past capacity the new connection is
    /// closed and `CapacityExceeded` is returned.
    pub async fn accept(&mut self, timeout: Duration) -> Result<Option<SubscriberId>, LinkError> {
        let Some(connection) = self.endpoint.accept(timeout).await? else {
            return Ok(None);
        };
        let remote = connection.remote_address();
        match self.fanout.insert(connection) {
            Ok(id) => {
                info!(subscriber = %id, remote = %remote, "Subscriber connected");
                Ok(Some(id))
            }
            Err(e) => {
                self.stats.rejected_subscribers = self.stats.rejected_subscribers.wrapping_add(1);
                warn!(remote = %remote, error = %e, "Subscriber refused");
                Err(e)
            }
        }
    }

    /// Reads pending requests from every subscriber, waiting at most
    /// `timeout` on each. Returns how many requests were applied.
    pub async fn poll_requests(&mut self, timeout: Duration) -> usize {
        let control_key = self.config.control_key;
        let mut handled = 0;

        for id in self.fanout.ids() {
            for _ in 0..MAX_REQUESTS_PER_POLL {
                let Some(subscription) = self.fanout.get_mut(id) else {
                    break;
                };
                // Anything off the control key goes to housekeeping
                let frame = match subscription.connection_mut().receive_keyed(control_key, timeout).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        self.evict(id, &e);
                        break;
                    }
                };

                match TelemetryRequest::from_frame(&frame) {
                    Ok(request) => {
                        self.handle_request(id, request).await;
                        handled += 1;
                    }
                    Err(e) => {
                        self.stats.malformed_requests = self.stats.malformed_requests.wrapping_add(1);
                        warn!(subscriber = %id, error = %e, "Ignoring malformed request");
                    }
                }
            }
        }

        handled
    }

    /// Applies one request from subscriber `id`.
    pub async fn handle_request(&mut self, id: SubscriberId, request: TelemetryRequest) {
        self.stats.requests_handled = self.stats.requests_handled.wrapping_add(1);
        debug!(subscriber = %id, kind = ?request.kind, mask = request.topic_mask, "Request");

        match request.kind {
            RequestKind::Subscribe => {
                if let Some(subscription) = self.fanout.get_mut(id) {
                    subscription.filter_mut().subscribe(request.topic_mask);
                }
            }
            RequestKind::Unsubscribe => {
                if let Some(subscription) = self.fanout.get_mut(id) {
                    subscription.filter_mut().unsubscribe(request.topic_mask);
                }
            }
            RequestKind::Snapshot => self.send_snapshot(id, request.topic_mask).await,
            RequestKind::Disconnect => {
                if self.fanout.remove(id).is_some() {
                    info!(subscriber = %id, "Subscriber disconnected");
                }
            }
        }
    }

    /// Fans `packet` out to every matching subscriber and remembers it as the
    /// latest sample from its source.
    pub async fn publish(&mut self, packet: TelemetryPacket) -> Result<PublishReport, LinkError> {
        let key = self.endpoint.local_key();
        let report = self
            .fanout
            .publish(&packet, key, self.config.send_timeout())
            .await?;

        // Update statistics and the snapshot cache
        self.stats.packets_published = self.stats.packets_published.wrapping_add(1);
        self.stats.deliveries += report.delivered as u64;
        self.stats.evictions = self.stats.evictions.wrapping_add(report.evicted.len() as u32);
        self.latest.insert(packet.source_id(), packet);
        Ok(report)
    }

    /// Explicit liveness pass: drops subscribers whose link already closed.
    pub fn sweep(&mut self) -> Vec<SubscriberId> {
        let evicted = self.fanout.sweep();
        self.stats.evictions = self.stats.evictions.wrapping_add(evicted.len() as u32);
        evicted
    }

    /// One turn of a cooperative server loop: accept, drain requests, sweep.
    pub async fn service_once(&mut self, accept_timeout: Duration) -> Result<ServiceReport, LinkError> {
        let accepted = match self.accept(accept_timeout).await {
            Ok(accepted) => accepted,
            Err(LinkError::CapacityExceeded { .. }) => None,
            Err(e) => return Err(e),
        };
        let requests = self.poll_requests(Duration::ZERO).await;
        let evicted = self.sweep();
        Ok(ServiceReport {
            accepted,
            requests,
            evicted,
        })
    }

    /// Closes every subscriber connection.
    pub fn shutdown(mut self) {
        info!(key = %self.key(), subscribers = self.fanout.len(), "Publisher shutting down");
        self.fanout.clear();
    }

    async fn send_snapshot(&mut self, id: SubscriberId, requested: u16) {
        let key = self.endpoint.local_key();
        let timeout = self.config.send_timeout();
        let Some(subscription) = self.fanout.get_mut(id) else {
            return;
        };

        // Wildcard request falls back to what the subscriber already follows
        let filter = subscription.filter();
        let mask = if requested == ALL_TOPICS && filter.is_active() {
            filter.mask()
        } else {
            requested
        };
        // Encode up front so the cache borrow ends before sending
        let frames: Vec<Frame> = self
            .latest
            .values()
            .filter(|packet| should_deliver(mask, packet.source_id()))
            .filter_map(|packet| packet.to_frame(key).ok())
            .collect();

        let mut sent = 0;
        for frame in frames {
            if let Err(e) = subscription.connection_mut().send_frame(frame, timeout).await {
                self.evict(id, &e);
                return;
            }
            sent += 1;
        }
        debug!(subscriber = %id, sent, mask, "Snapshot delivered");
    }

    fn evict(&mut self, id: SubscriberId, reason: &LinkError) {
        if self.fanout.remove(id).is_some() {
            self.stats.evictions = self.stats.evictions.wrapping_add(1);
            warn!(subscriber = %id, error = %reason, "Evicting subscriber");
        }
    }
}

impl core::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Publisher")
            .field("endpoint", &self.endpoint)
            .field("subscribers", &self.fanout.len())
            .field("cached_sources", &self.latest.len())
            .field("stats", &self.stats)
            .finish()
    }
}
