//! Topic fan-out: who gets which published packet.
//!
//! Subscribers are kept in insertion order and served in that order. A
//! subscriber whose link died is only noticed when a send to it fails (or
//! when [`FanOut::sweep`] is run); at that point it is closed and removed.

use crate::connection::Connection;
use crate::error::LinkError;
use crate::protocol::{MuxKey, TelemetryPacket, TopicMask, ALL_TOPICS};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriberId(pub u32);

impl core::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "sub{}", self.0)
    }
}

/// Delivery rule: a zero mask takes everything, otherwise any shared bit.
pub fn should_deliver(topic_mask: TopicMask, source_id: u16) -> bool {
    topic_mask == ALL_TOPICS || (topic_mask & source_id) != 0
}

/// Topic interest declared by one subscriber.
///
/// A freshly accepted subscriber has declared nothing and receives nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TopicFilter {
    mask: TopicMask,
    active: bool,
}

impl TopicFilter {
    pub fn mask(&self) -> TopicMask {
        self.mask
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Adds topics. The wildcard absorbs any other mask.
    pub fn subscribe(&mut self, mask: TopicMask) {
        if !self.active {
            self.mask = mask;
            self.active = true;
        } else if mask == ALL_TOPICS || self.mask == ALL_TOPICS {
            self.mask = ALL_TOPICS;
        } else {
            self.mask |= mask;
        }
    }

    /// Removes topics. A zero mask, or removing the last bit, stops delivery.
    ///
    /// Removing bits from a wildcard leaves every other bit subscribed.
    pub fn unsubscribe(&mut self, mask: TopicMask) {
        if !self.active {
            return;
        }
        if mask == ALL_TOPICS {
            *self = TopicFilter::default();
            return;
        }

        let remaining = if self.mask == ALL_TOPICS { !mask } else { self.mask & !mask };
        if remaining == 0 {
            *self = TopicFilter::default();
        } else {
            self.mask = remaining;
        }
    }

    pub fn accepts(&self, source_id: u16) -> bool {
        self.active && should_deliver(self.mask, source_id)
    }
}

/// A connection on the fan-out list together with its topic interest.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    connection: Connection,
    filter: TopicFilter,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn filter(&self) -> TopicFilter {
        self.filter
    }

    pub fn filter_mut(&mut self) -> &mut TopicFilter {
        &mut self.filter
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn close(&mut self) {
        self.connection.close();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub delivered: usize,
    pub filtered: usize,
    pub evicted: Vec<SubscriberId>,
}

#[derive(Debug)]
pub struct FanOut {
    subscribers: Vec<Subscription>,
    capacity: usize,
    next_id: u32,
}

impl FanOut {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Vec::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Appends a connection. Past capacity the connection is closed and the
    /// call fails; this is a configuration problem, not a transient one.
    pub fn insert(&mut self, mut connection: Connection) -> Result<SubscriberId, LinkError> {
        if self.subscribers.len() >= self.capacity {
            connection.close();
            return Err(LinkError::CapacityExceeded { capacity: self.capacity });
        }

        let id = SubscriberId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.subscribers.push(Subscription {
            id,
            connection,
            filter: TopicFilter::default(),
        });
        debug!(subscriber = %id, count = self.subscribers.len(), "Subscriber added");
        Ok(id)
    }

    pub fn get(&self, id: SubscriberId) -> Option<&Subscription> {
        self.subscribers.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SubscriberId) -> Option<&mut Subscription> {
        self.subscribers.iter_mut().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscribers.iter()
    }

    pub fn ids(&self) -> Vec<SubscriberId> {
        self.subscribers.iter().map(Subscription::id).collect()
    }

    /// Removes and closes a subscriber.
    pub fn remove(&mut self, id: SubscriberId) -> Option<Subscription> {
        let index = self.subscribers.iter().position(|s| s.id == id)?;
        let mut subscription = self.subscribers.remove(index);
        subscription.close();
        Some(subscription)
    }

    /// Sends `packet` to every matching subscriber, in insertion order.
    ///
    /// A failed send evicts that subscriber and delivery carries on with the
    /// rest; it is not an error for the publish as a whole.
    pub async fn publish(
        &mut self,
        packet: &TelemetryPacket,
        key: MuxKey,
        timeout: Duration,
    ) -> Result<PublishReport, LinkError> {
        let frame = packet.to_frame(key)?;
        let mut report = PublishReport::default();

        let mut index = 0;
        while index < self.subscribers.len() {
            let subscription = &mut self.subscribers[index];
            // Skip subscribers not interested in this source
            if !subscription.filter.accepts(packet.source_id()) {
                report.filtered += 1;
                index += 1;
                continue;
            }

            match subscription.connection.send_frame(frame.clone(), timeout).await {
                Ok(()) => {
                    report.delivered += 1;
                    index += 1;
                }
                Err(e) => {
                    // Dead link: drop it in place, the next subscriber shifts into `index`
                    let mut evicted = self.subscribers.remove(index);
                    warn!(subscriber = %evicted.id, error = %e, "Evicting subscriber after failed send");
                    evicted.close();
                    report.evicted.push(evicted.id);
                }
            }
        }

        Ok(report)
    }

    /// Evicts subscribers whose link already reports closed, without sending.
    pub fn sweep(&mut self) -> Vec<SubscriberId> {
        let mut evicted = Vec::new();
        self.subscribers.retain_mut(|subscription| {
            if subscription.connection.is_closed() {
                subscription.close();
                evicted.push(subscription.id);
                false
            } else {
                true
            }
        });
        for id in &evicted {
            debug!(subscriber = %id, "Swept closed subscriber");
        }
        evicted
    }

    /// Closes and drops every subscriber.
    pub fn clear(&mut self) {
        for subscription in &mut self.subscribers {
            subscription.close();
        }
        self.subscribers.clear();
    }
}
