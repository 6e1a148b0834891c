//! # satlink
//!
//! Onboard inter-process plumbing for small-satellite flight software: a
//! publish/subscribe telemetry layer over a keyed packet transport, and an
//! event bus for signals and method calls between named processes.
//!
//! ## Features
//!
//! - **Connections**: owned, keyed links with bounded sends and timeout-bounded reads
//! - **Publisher endpoints**: bounded subscriber sets with topic-mask fan-out
//! - **Subscriber clients**: fire-and-forget subscription, snapshot and disconnect requests
//! - **Housekeeping traffic**: ping, free-buffer and uptime answered on the same link
//! - **Event bus**: frozen (interface, member) handler tables, broadcast and call-with-reply
//! - **Bounded frames**: every frame fits the 256-byte link MTU, checked at construction
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use satlink::{LinkConfig, MemoryNetwork, MuxKey, NodeAddress, Publisher, Subscriber, TelemetryPacket};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), satlink::LinkError> {
//! let config = LinkConfig::default();
//! let network = MemoryNetwork::from_config(&config);
//! let key = MuxKey::new(5)?;
//!
//! let mut publisher = Publisher::bind(&network.node(NodeAddress(1)), key, config.clone()).await?;
//! let mut subscriber =
//!     Subscriber::subscribe(&network.node(NodeAddress(2)), NodeAddress(1), key, 0x01, &config).await?;
//!
//! publisher.accept(Duration::from_millis(100)).await?;
//! publisher.poll_requests(Duration::from_millis(100)).await;
//! publisher.publish(TelemetryPacket::new(0x01, b"x")?).await?;
//!
//! if let Some(packet) = subscriber.read(Duration::from_millis(100)).await? {
//!     println!("source {} sent {:?}", packet.source_id(), packet.payload());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`] - keyed packet transport traits, in-memory and TCP implementations
//! - [`connection`] - one owned link and its housekeeping diversion
//! - [`server`] - bound endpoints handing out accepted connections
//! - [`fanout`] - topic filters and delivery to subscribers
//! - [`publisher`] / [`subscriber`] - the two ends of a telemetry stream
//! - [`bus`] - event bus context, messages and the in-process session bus

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod protocol;
pub mod publisher;
pub mod server;
pub mod service;
pub mod subscriber;
pub mod transport;

// Re-export main public types for convenience
pub use bus::{BusContext, BusContextBuilder, BusMessage, BusSignal, SessionBus};
pub use config::{BusConfig, ConfigError, LinkConfig};
pub use connection::Connection;
pub use error::{BusError, LinkError};
pub use fanout::{should_deliver, FanOut, PublishReport, SubscriberId};
pub use protocol::{Frame, MuxKey, NodeAddress, TelemetryPacket, TelemetryRequest, ALL_TOPICS};
pub use publisher::Publisher;
pub use server::Endpoint;
pub use subscriber::Subscriber;
pub use transport::{MemoryNetwork, TcpTransport, Transport};
