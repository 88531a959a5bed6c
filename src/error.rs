use std::fmt;

/// Connection-establishment failures, split by retryability.
///
/// `Auth` means the exchange rejected the credentials: propagated out of
/// `start()` and never retried. `Transient` covers network-level failures
/// and drives the reconnection supervisor.
#[derive(Debug, Clone)]
pub enum ConnectError {
    Auth(String),
    Transient(String),
}

impl ConnectError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::Transient(_))
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Auth(msg) => write!(f, "authentication rejected: {}", msg),
            ConnectError::Transient(msg) => write!(f, "transient transport failure: {}", msg),
        }
    }
}

impl std::error::Error for ConnectError {}
