//! Housekeeping traffic that shares a link with telemetry.
//!
//! A frame arriving on a key the reader did not ask for is handed to a
//! [`ServiceHandler`] instead of the caller. Requests carry an empty body
//! (or a leading [`PING_REQUEST`] marker); replies never do, so two
//! services on either end of a link cannot bounce a reply between them.

use crate::protocol::{Frame, MuxKey};
use std::time::Instant;
use tracing::{debug, trace};

pub const PING_REQUEST: u8 = 0x00;
pub const PING_REPLY: u8 = 0x01;

/// State of the link the frame arrived on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkStatus {
    pub buffers_free: Option<usize>,
}

pub trait ServiceHandler: Send {
    /// Returns a frame to send back on the same link, if any.
    fn handle(&mut self, frame: &Frame, status: LinkStatus) -> Option<Frame>;
}

/// Answers ping, free-buffer and uptime queries; logs everything else.
#[derive(Debug)]
pub struct HousekeepingService {
    started: Instant,
    handled: u32,
}

impl HousekeepingService {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            handled: 0,
        }
    }

    pub fn handled(&self) -> u32 {
        self.handled
    }

    fn reply_u32(key: MuxKey, value: u32) -> Option<Frame> {
        Frame::new(key, &value.to_be_bytes()).ok()
    }
}

impl Default for HousekeepingService {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHandler for HousekeepingService {
    fn handle(&mut self, frame: &Frame, status: LinkStatus) -> Option<Frame> {
        self.handled = self.handled.wrapping_add(1);
        let body = frame.body();

        match frame.key() {
            MuxKey::PING if body.first() == Some(&PING_REQUEST) => {
                let mut echo = body.to_vec();
                echo[0] = PING_REPLY;
                trace!(len = body.len(), "Answering ping");
                Frame::new(MuxKey::PING, &echo).ok()
            }
            MuxKey::BUF_FREE if body.is_empty() => {
                let free = status
                    .buffers_free
                    .map_or(u32::MAX, |n| u32::try_from(n).unwrap_or(u32::MAX));
                Self::reply_u32(MuxKey::BUF_FREE, free)
            }
            MuxKey::UPTIME if body.is_empty() => {
                let uptime = u32::try_from(self.started.elapsed().as_secs()).unwrap_or(u32::MAX);
                Self::reply_u32(MuxKey::UPTIME, uptime)
            }
            key => {
                debug!(key = %key, len = body.len(), "Dropping frame with no service");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_is_echoed_once() {
        let mut service = HousekeepingService::new();
        let request = Frame::new(MuxKey::PING, &[PING_REQUEST, 0x12, 0x34]).unwrap();

        let reply = service.handle(&request, LinkStatus::default()).unwrap();
        assert_eq!(reply.key(), MuxKey::PING);
        assert_eq!(reply.body(), &[PING_REPLY, 0x12, 0x34]);

        // A reply reaching a service is not answered again.
        assert!(service.handle(&reply, LinkStatus::default()).is_none());
        assert_eq!(service.handled(), 2);
    }

    #[test]
    fn test_buffer_free_report() {
        let mut service = HousekeepingService::new();
        let request = Frame::new(MuxKey::BUF_FREE, &[]).unwrap();
        let status = LinkStatus { buffers_free: Some(7) };

        let reply = service.handle(&request, status).unwrap();
        assert_eq!(reply.body(), &7u32.to_be_bytes());

        let unknown = service.handle(&request, LinkStatus::default()).unwrap();
        assert_eq!(unknown.body(), &u32::MAX.to_be_bytes());
    }

    #[test]
    fn test_uptime_report() {
        let mut service = HousekeepingService::new();
        let request = Frame::new(MuxKey::UPTIME, &[]).unwrap();
        let reply = service.handle(&request, LinkStatus::default()).unwrap();
        assert_eq!(reply.len(), 4);
    }

    #[test]
    fn test_unknown_key_dropped() {
        let mut service = HousekeepingService::new();
        let frame = Frame::new(MuxKey::new(9).unwrap(), b"stray").unwrap();
        assert!(service.handle(&frame, LinkStatus::default()).is_none());
    }
}
