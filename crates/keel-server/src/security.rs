//! Password hashing capability.

use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use keel_common::{KeelError, Result};
use rand_core::OsRng;

#[async_trait]
pub trait Hashing: Send + Sync {
    /// Hashes `secret` into a self-describing string.
    async fn hash(&self, secret: &str) -> Result<String>;

    /// Verifies `secret` against `hash` in constant time. A malformed hash
    /// verifies as `false`.
    async fn verify(&self, secret: &str, hash: &str) -> Result<bool>;

    /// A valid hash of an unguessable secret, verified against when a user
    /// does not exist so both failure paths cost the same.
    fn dummy_hash(&self) -> &str;
}

/// Argon2id producing PHC strings.
#[derive(Clone)]
pub struct Argon2Hasher {
    argon2: Arc<Argon2<'static>>,
    dummy: String,
}

impl Argon2Hasher {
    /// Argon2id with the crate's default cost parameters.
    pub fn new() -> Result<Self> {
        Self::with_argon2(Argon2::default())
    }

    /// Argon2id with explicit costs. Memory cost is in KiB.
    pub fn with_params(memory_cost: u32, time_cost: u32, parallelism: u32) -> Result<Self> {
        let params = Params::new(memory_cost, time_cost, parallelism, None)
            .map_err(|e| KeelError::Internal(format!("Invalid argon2 params: {}", e)))?;
        Self::with_argon2(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    fn with_argon2(argon2: Argon2<'static>) -> Result<Self> {
        let mut secret = [0u8; 32];
        rand_core::RngCore::fill_bytes(&mut OsRng, &mut secret);
        let dummy = hash_with(&argon2, &secret)?;
        Ok(Self {
            argon2: Arc::new(argon2),
            dummy,
        })
    }
}

fn hash_with(argon2: &Argon2<'_>, secret: &[u8]) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(secret, &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| KeelError::Internal(format!("Password hashing failed: {}", e)))
}

#[async_trait]
impl Hashing for Argon2Hasher {
    async fn hash(&self, secret: &str) -> Result<String> {
        let argon2 = self.argon2.clone();
        let secret = secret.to_owned();
        tokio::task::spawn_blocking(move || hash_with(&argon2, secret.as_bytes()))
            .await
            .map_err(|e| KeelError::Internal(format!("Hashing task failed: {}", e)))?
    }

    async fn verify(&self, secret: &str, hash: &str) -> Result<bool> {
        let argon2 = self.argon2.clone();
        let secret = secret.to_owned();
        let hash = hash.to_owned();
        tokio::task::spawn_blocking(move || match PasswordHash::new(&hash) {
            Ok(parsed) => argon2.verify_password(secret.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        })
        .await
        .map_err(|e| KeelError::Internal(format!("Verification task failed: {}", e)))
    }

    fn dummy_hash(&self) -> &str {
        &self.dummy
    }
}
