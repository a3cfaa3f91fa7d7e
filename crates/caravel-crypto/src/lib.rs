//! Caravel TEE Secrets Handshake Library
//!
//! Seals deployment secrets for a remote confidential-VM provider so that
//! only the target enclave can read them; the control plane relaying the
//! creation request never sees plaintext.
//!
//! ## Crypto primitives
//!
//! - **Key agreement**: ephemeral X25519 ECDH against the provider's
//!   configuration-bound public key, one keypair per deployment
//! - **Key derivation**: HKDF-SHA256 over the shared secret
//! - **Encryption**: AES-256-GCM AEAD, fresh random 12-byte nonce
//! - **Envelope**: `hex(ephemeral_pub ‖ nonce ‖ ciphertext+tag)`

pub mod error;
pub mod handshake;

pub use error::HandshakeError;
pub use handshake::{ENVELOPE_OVERHEAD, EnvVar, NONCE_SIZE, PUBKEY_SIZE, seal_env_vars};
#[cfg(any(test, feature = "test-utils"))]
pub use handshake::{open_env_vars, provider_test_keypair};
