//! Per-actor RSA key management
//!
//! Every local actor gets exactly one keypair, generated the first time its
//! actor document is resolved. Keys are never rotated.

use std::sync::Arc;

use chrono::Utc;

use crate::data::{ActorKeyPair, Database};
use crate::error::AppError;

/// Owns actor keypairs
pub struct KeyManager {
    db: Arc<Database>,
    key_bits: usize,
}

impl KeyManager {
    pub fn new(db: Arc<Database>, key_bits: usize) -> Self {
        Self { db, key_bits }
    }

    /// Return the public key PEM for `uid`, generating a keypair on first use.
    ///
    /// Concurrent first calls may each generate a key; the insert is
    /// `ON CONFLICT DO NOTHING`, and every caller re-reads the stored row,
    /// so all of them return the single persisted winner.
    pub async fn get_or_create_key_pair(&self, uid: &str) -> Result<String, AppError> {
        if let Some(existing) = self.db.get_actor_key_pair(uid).await? {
            return Ok(existing.public_key_pem);
        }

        let (private_key_pem, public_key_pem) = generate_key_pair(self.key_bits).await?;
        let inserted = self
            .db
            .insert_actor_key_pair_if_absent(&ActorKeyPair {
                owner_uid: uid.to_string(),
                public_key_pem,
                private_key_pem,
                created_at: Utc::now(),
            })
            .await?;

        if inserted {
            tracing::info!(uid = %uid, bits = self.key_bits, "Generated actor keypair");
        } else {
            tracing::debug!(uid = %uid, "Lost keypair creation race, using stored key");
        }

        let stored = self.db.get_actor_key_pair(uid).await?.ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("Keypair for {} vanished after insert", uid))
        })?;
        Ok(stored.public_key_pem)
    }

    /// Private key PEM for signing on behalf of `uid`
    ///
    /// # Errors
    /// `KeyNotFound` if no keypair was ever created for this actor
    pub async fn get_private_key(&self, uid: &str) -> Result<String, AppError> {
        self.db
            .get_actor_key_pair(uid)
            .await?
            .map(|pair| pair.private_key_pem)
            .ok_or_else(|| AppError::KeyNotFound(uid.to_string()))
    }
}

/// Generate an RSA keypair off the async runtime.
///
/// # Returns
/// `(private_key_pem, public_key_pem)` as PKCS#8 / SPKI PEM
pub async fn generate_key_pair(bits: usize) -> Result<(String, String), AppError> {
    tokio::task::spawn_blocking(move || -> Result<(String, String), anyhow::Error> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)?;
        let public_key = RsaPublicKey::from(&private_key);
        let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
        let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?;
        Ok((private_key_pem, public_key_pem))
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))?
    .map_err(AppError::Internal)
}
