use crate::connection::Connection;
use crate::error::LinkError;
use crate::protocol::MuxKey;
use crate::transport::{Listener, Transport};
use std::time::Duration;
use tracing::{debug, info};

/// A bound, listening service identity.
///
/// The endpoint only hands out connections. Deciding who receives what, and
/// refusing subscribers past capacity, is the caller's job.
pub struct Endpoint {
    listener: Box<dyn Listener>,
    local_key: MuxKey,
    max_connections: usize,
    accepted: u32,
}

impl Endpoint {
    pub async fn bind(
        transport: &dyn Transport,
        local_key: MuxKey,
        max_connections: usize,
    ) -> Result<Self, LinkError> {
        if max_connections == 0 {
            return Err(LinkError::CapacityExceeded { capacity: 0 });
        }
        let listener = transport.bind(local_key, max_connections).await?;
        info!(address = %transport.local_address(), key = %local_key, max_connections, "Endpoint bound");

        Ok(Self {
            listener,
            local_key,
            max_connections,
            accepted: 0,
        })
    }

    pub fn local_key(&self) -> MuxKey {
        self.local_key
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn accepted(&self) -> u32 {
        self.accepted
    }

    /// One accepted connection per call, `Ok(None)` if nobody connected
    /// within `timeout`.
    pub async fn accept(&mut self, timeout: Duration) -> Result<Option<Connection>, LinkError> {
        let Some(link) = self.listener.accept(timeout).await? else {
            return Ok(None);
        };
        self.accepted = self.accepted.wrapping_add(1);
        debug!(remote = %link.remote_address(), key = %self.local_key, "Accepted connection");
        Ok(Some(Connection::from_link(link, self.local_key)))
    }
}

impl core::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_key", &self.local_key)
            .field("max_connections", &self.max_connections)
            .field("accepted", &self.accepted)
            .finish()
    }
}
