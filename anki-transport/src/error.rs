//! Transport error types

use thiserror::Error;

/// Errors raised while establishing or driving a vehicle link.
///
/// The connection engine decides retry versus give-up from
/// [`LinkError::is_recoverable`]: transient transport conditions are
/// retried up to the attempt budget, everything else tears the vehicle
/// down for good.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The kernel refused the connect with EBUSY; usually an alien
    /// connection to the same address holds the adapter.
    #[error("device or resource busy")]
    Busy,

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// The L2CAP connect did not complete within the attempt timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    #[error("ATT transport error: {0}")]
    Att(String),

    #[error("failed to create GATT client: {0}")]
    GattInit(String),

    /// The vendor service or one of its two characteristics is absent.
    #[error("vehicle service characteristics not found")]
    MissingCharacteristics,

    #[error("failed to enable notifications: {0}")]
    CccdWrite(String),

    #[error("failed to register notify handler: {0}")]
    NotifySubscribe(String),

    /// Alien-connection preemption failed; the address stays unusable.
    #[error("failed to disrupt alien connection: {0}")]
    PreemptFailed(String),

    #[error("link disconnected")]
    Disconnected,

    /// Write attempted while the GATT client is not ready.
    #[error("link not ready")]
    NotReady,
}

impl LinkError {
    /// Whether the failure is worth another connection attempt.
    pub fn is_recoverable(&self) -> bool {
        match self {
            LinkError::Busy
            | LinkError::Socket(_)
            | LinkError::ConnectTimeout
            | LinkError::Att(_)
            | LinkError::Disconnected => true,
            LinkError::GattInit(_)
            | LinkError::MissingCharacteristics
            | LinkError::CccdWrite(_)
            | LinkError::NotifySubscribe(_)
            | LinkError::PreemptFailed(_)
            | LinkError::NotReady => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(LinkError::Busy.is_recoverable());
        assert!(LinkError::ConnectTimeout.is_recoverable());
        assert!(LinkError::Att("reset".into()).is_recoverable());
        assert!(!LinkError::GattInit("no database".into()).is_recoverable());
        assert!(!LinkError::MissingCharacteristics.is_recoverable());
        assert!(!LinkError::PreemptFailed("no handle".into()).is_recoverable());
        assert!(!LinkError::CccdWrite("rejected".into()).is_recoverable());
    }
}
