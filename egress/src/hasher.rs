//! Keyed entity tokenization: `token = base32(HMAC_SHA256(key,
//! value|kind|scope))` truncated to 16 characters, lengthened by 4 on a
//! collision across distinct values.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// Token → `(value, kind)` map accumulated during sanitization.
#[derive(Debug, Default, Clone)]
pub struct EntityMap {
    tokens: HashMap<String, (String, String)>,
}

impl EntityMap {
    /// Record a token binding.
    pub fn put(&mut self, token: &str, value: &str, kind: &str) {
        self.tokens
            .insert(token.to_string(), (value.to_string(), kind.to_string()));
    }

    /// Look up a token.
    pub fn get(&self, token: &str) -> Option<&(String, String)> {
        self.tokens.get(token)
    }

    /// All bindings.
    pub fn all(&self) -> &HashMap<String, (String, String)> {
        &self.tokens
    }
}

/// The keyed hasher.
pub struct EntityHasher {
    key: [u8; 32],
}

impl EntityHasher {
    /// Hasher over a purpose-derived key.
    pub fn new(key: [u8; 32]) -> Self {
        EntityHasher { key }
    }

    /// Deterministic token for `(value, kind, scope)`. A collision with
    /// a different value already in `existing` lengthens the token by 4
    /// characters until distinct.
    pub fn token_for(&self, value: &str, kind: &str, scope: &str, existing: &EntityMap) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("32-byte key is valid for hmac"));
        mac.update(format!("{value}|{kind}|{scope}").as_bytes());
        let digest = mac.finalize().into_bytes();
        let encoded = data_encoding::BASE32_NOPAD.encode(&digest);
        let mut length = 16usize;
        loop {
            let candidate = &encoded[..length.min(encoded.len())];
            match existing.get(candidate) {
                Some((known_value, _)) if known_value != value => {
                    length += 4;
                    if length >= encoded.len() {
                        return encoded;
                    }
                }
                _ => return candidate.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> EntityHasher {
        EntityHasher::new([7u8; 32])
    }

    #[test]
    fn tokens_are_deterministic_per_scope() {
        let map = EntityMap::default();
        let first = hasher().token_for("john@example.com", "EMAIL", "default", &map);
        let second = hasher().token_for("john@example.com", "EMAIL", "default", &map);
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        let scoped = hasher().token_for("john@example.com", "EMAIL", "other", &map);
        assert_ne!(first, scoped);
    }

    #[test]
    fn distinct_values_produce_distinct_tokens() {
        let map = EntityMap::default();
        let a = hasher().token_for("a@example.com", "EMAIL", "default", &map);
        let b = hasher().token_for("b@example.com", "EMAIL", "default", &map);
        assert_ne!(a, b);
    }

    #[test]
    fn collision_with_different_value_lengthens_token() {
        let hasher = hasher();
        let mut map = EntityMap::default();
        let token = hasher.token_for("a@example.com", "EMAIL", "default", &map);
        // Poison the map: same token bound to a different value.
        map.put(&token, "other@example.com", "EMAIL");
        let next = hasher.token_for("a@example.com", "EMAIL", "default", &map);
        assert_eq!(next.len(), 20);
        assert!(next.starts_with(&token));
    }

    #[test]
    fn different_keys_produce_different_tokens() {
        let map = EntityMap::default();
        let a = EntityHasher::new([1u8; 32]).token_for("v", "EMAIL", "s", &map);
        let b = EntityHasher::new([2u8; 32]).token_for("v", "EMAIL", "s", &map);
        assert_ne!(a, b);
    }
}
