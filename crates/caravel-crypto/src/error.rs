//! Handshake error types.

/// Errors from the secrets handshake.
///
/// Every variant is fatal for the deployment request that triggered it;
/// secrets are never submitted partially encrypted.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Invalid provider public key hex: {0}")]
    InvalidKeyHex(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
}
