use std::time::Duration;

use btleplug::api::BDAddr;
use thiserror::Error;

/// Errors raised by the bridge. The supervisor owns all retry and backoff
/// decisions; the adapter, codec, and client layers only classify.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// No usable BLE adapter on this host.
    #[error("BLE adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// The BLE stack refused access (missing capabilities, bluetoothd policy).
    #[error("BLE permission denied: {0}")]
    PermissionDenied(String),

    /// The adapter cannot hold the central and peripheral roles at once.
    #[error("adapter cannot take the peripheral role: {0}")]
    RoleConflict(String),

    /// A scan window ended without a matching treadmill.
    #[error("no treadmill found")]
    ScanEmpty,

    /// Central connection to the treadmill failed.
    #[error("failed to connect to {address}: {reason}")]
    ConnectFail { address: BDAddr, reason: String },

    /// The connected device does not expose the WalkingPad service layout.
    #[error("device {0} does not speak the WalkingPad protocol")]
    ProtocolMismatch(BDAddr),

    /// The poll watchdog saw no stats reply within its window.
    #[error("no stats reply within {0:?}")]
    LinkStale(Duration),

    /// The BLE stack reported the treadmill link as gone.
    #[error("treadmill link lost: {0}")]
    LinkLost(String),

    /// A facade operation is not valid in the current bridge state.
    #[error("operation not valid while {state}")]
    InvalidState { state: &'static str },

    /// Configuration failed validation at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The supervisor is gone; no further commands are accepted.
    #[error("bridge is shutting down")]
    Shutdown,

    /// Unclassified error from the central-role stack.
    #[error("BLE central error: {0}")]
    Central(#[from] btleplug::Error),

    /// Unclassified error from the peripheral-role stack.
    #[error("BLE peripheral error: {0}")]
    Peripheral(#[from] bluer::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Fatal errors stop the supervisor instead of being absorbed into a
    /// state transition.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AdapterUnavailable(_) | Self::PermissionDenied(_) | Self::InvalidConfig(_)
        )
    }

    /// Errors that quarantine the peer address before the next scan pass.
    #[must_use]
    pub const fn is_protocol_mismatch(&self) -> bool {
        matches!(self, Self::ProtocolMismatch(_))
    }
}

/// Classify a central-stack error into the bridge taxonomy.
pub(crate) fn from_central(e: btleplug::Error) -> BridgeError {
    match e {
        btleplug::Error::PermissionDenied => {
            BridgeError::PermissionDenied("bluetooth access denied".into())
        }
        btleplug::Error::DeviceNotFound => {
            BridgeError::AdapterUnavailable("no BLE adapter found".into())
        }
        other => BridgeError::Central(other),
    }
}

/// Classify a peripheral-stack error into the bridge taxonomy.
pub(crate) fn from_peripheral(e: bluer::Error) -> BridgeError {
    use bluer::ErrorKind;
    match e.kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => {
            BridgeError::PermissionDenied(e.to_string())
        }
        ErrorKind::NotSupported
        | ErrorKind::NotReady
        | ErrorKind::InProgress
        | ErrorKind::AlreadyExists => BridgeError::RoleConflict(e.to_string()),
        _ => BridgeError::Peripheral(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(BridgeError::AdapterUnavailable("gone".into()).is_fatal());
        assert!(BridgeError::PermissionDenied("no caps".into()).is_fatal());
        assert!(!BridgeError::ScanEmpty.is_fatal());
        assert!(!BridgeError::RoleConflict("busy".into()).is_fatal());
        assert!(!BridgeError::LinkStale(Duration::from_secs(3)).is_fatal());
    }

    #[test]
    fn central_errors_map_to_kinds() {
        assert!(matches!(
            from_central(btleplug::Error::PermissionDenied),
            BridgeError::PermissionDenied(_)
        ));
        assert!(matches!(
            from_central(btleplug::Error::DeviceNotFound),
            BridgeError::AdapterUnavailable(_)
        ));
        assert!(matches!(
            from_central(btleplug::Error::NotConnected),
            BridgeError::Central(_)
        ));
    }
}
