//! Error types and result definitions for the tuyabell crate.
//! Frame-level errors are recovered locally by the read loop; connection-level
//! errors propagate to the reconnection supervisor.

use thiserror::Error;

/// Represents all possible errors that can occur when communicating with a Tuya device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TuyaError {
    /// Standard IO error (network, timeout, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Frame shape was invalid (bad prefix, impossible length, truncated header)
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// CRC32 check failed for the received frame
    #[error("CRC mismatch")]
    CrcMismatch,

    /// HMAC signature verification failed (v3.4)
    #[error("HMAC mismatch")]
    HmacMismatch,

    /// Failed to decrypt a payload from the device (wrong key or version)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a payload for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Request timed out waiting for the device
    #[error("Timeout waiting for device")]
    Timeout,

    /// A send was attempted while no connection is in the Ready state
    #[error("Not connected")]
    NotConnected,

    /// Session key negotiation failed (v3.4); fatal to the connection attempt
    #[error("Handshake failed")]
    HandshakeFailed,

    /// A decrypted payload could not be decoded into datapoints
    #[error("Unparseable payload: {0}")]
    Unparseable(String),

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// Device is unreachable and no address could be resolved
    #[error("Device offline")]
    Offline,
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    /// Whether this error is recovered inside the read loop (frame dropped,
    /// stream continues) rather than escalated to the supervisor.
    pub fn is_frame_level(&self) -> bool {
        matches!(
            self,
            TuyaError::Malformed(_)
                | TuyaError::CrcMismatch
                | TuyaError::HmacMismatch
                | TuyaError::DecryptionFailed
                | TuyaError::Unparseable(_)
        )
    }
}
