use thiserror::Error;

/// Failures surfaced by connections, endpoints, publishers and subscribers.
///
/// Timeouts are not represented here. Blocking operations return
/// `Ok(None)` when their bound expires without data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("No route to remote endpoint")]
    NoRoute,
    #[error("Link closed")]
    LinkClosed,
    #[error("Transport buffer pool exhausted")]
    BufferExhausted,
    #[error("Multiplexing key {0} already bound")]
    AddressInUse(u8),
    #[error("Subscriber capacity of {capacity} exceeded")]
    CapacityExceeded { capacity: usize },
    #[error("Multiplexing key {0} outside 0..=31")]
    InvalidKey(u8),
    #[error("Payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Malformed message: {0}")]
    Malformed(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
}

impl LinkError {
    /// Configuration-class failures are never worth retrying.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            LinkError::CapacityExceeded { .. }
                | LinkError::InvalidKey(_)
                | LinkError::PayloadTooLarge { .. }
                | LinkError::AddressInUse(_)
        )
    }

    /// Hard link failures: the remote is gone or was never reachable.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, LinkError::NoRoute | LinkError::LinkClosed | LinkError::Io(_))
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable => {
                LinkError::NoRoute
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotConnected => LinkError::LinkClosed,
            _ => LinkError::Io(err.to_string()),
        }
    }
}

/// Failures surfaced by the event bus layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Bus unavailable")]
    Unavailable,
    #[error("Bus name {0} already owned")]
    NameTaken(String),
    #[error("Invalid bus name: {0}")]
    InvalidName(String),
    #[error("Context in state {found}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },
    #[error("Handler for {interface}.{member} already registered")]
    DuplicateHandler { interface: String, member: String },
    #[error("Bus connection closed")]
    Disconnected,
    #[error("Handler failed: {0}")]
    Handler(String),
    #[error("Remote error {name}: {message}")]
    Remote { name: String, message: String },
}
