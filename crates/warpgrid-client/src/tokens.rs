//! Migrate tokens authorizing allocation snapshots.

use sha2::{Digest, Sha256};

/// Derives and checks per-allocation migrate tokens from a node secret.
///
/// A token is `hex(sha256(secret ":" alloc_id))`. Without a secret no
/// token validates.
#[derive(Clone)]
pub struct MigrateTokens {
    secret: String,
}

impl MigrateTokens {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Token a peer must present to snapshot `alloc_id`.
    pub fn generate(&self, alloc_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(alloc_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn validate(&self, alloc_id: &str, token: &str) -> bool {
        if self.secret.is_empty() || token.is_empty() {
            return false;
        }
        constant_time_eq(self.generate(alloc_id).as_bytes(), token.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&x, &y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_validates() {
        let tokens = MigrateTokens::new("s3cret");
        let token = tokens.generate("a1");
        assert_eq!(token.len(), 64);
        assert!(tokens.validate("a1", &token));
    }

    #[test]
    fn token_is_bound_to_alloc_and_secret() {
        let tokens = MigrateTokens::new("s3cret");
        let token = tokens.generate("a1");
        assert!(!tokens.validate("a2", &token));
        assert!(!MigrateTokens::new("other").validate("a1", &token));
    }

    #[test]
    fn empty_secret_or_token_never_validates() {
        let tokens = MigrateTokens::new("");
        let token = tokens.generate("a1");
        assert!(!tokens.validate("a1", &token));
        assert!(!MigrateTokens::new("s3cret").validate("a1", ""));
    }
}
