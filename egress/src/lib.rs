//! Egress sanitization: deterministic, keyed PII tokenization over
//! detected entities, exact detokenization, leak checking, and the
//! reasoning-packet schema for sanitized egress payloads.

/// HMAC entity hasher.
pub mod hasher;
/// Reasoning packet schema.
pub mod packet;
/// Entity recognizers and overlap resolution.
pub mod recognizers;
/// The sanitizer pipeline.
pub mod sanitizer;

pub use hasher::EntityHasher;
pub use packet::{validate_packet, ReasoningPacket};
pub use recognizers::{find_entities, Entity, EntityKind, RecognizerConfig};
pub use sanitizer::{EgressSanitizer, SanitizedText};

use thiserror::Error;

/// Errors raised during sanitization.
#[derive(Debug, Error)]
pub enum EgressError {
    /// Key derivation failed.
    #[error(transparent)]
    Vault(#[from] autocap_vault::VaultError),
    /// A custom recognizer pattern failed to compile.
    #[error("recognizer pattern invalid: {0}")]
    Pattern(String),
    /// Reasoning packet failed schema validation.
    #[error("packet invalid: {0}")]
    Packet(String),
}
