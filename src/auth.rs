use std::sync::Arc;

use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::SaltString,
};

/// Hashed server password that websocket clients authenticate against.
#[derive(Clone)]
pub struct Credential {
    phc: Arc<str>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(..)")
    }
}

impl Credential {
    /// Accept either a PHC string produced by argon2 or a plain password to hash.
    pub fn from_config(configured: &str) -> anyhow::Result<Self> {
        if configured.starts_with("$argon2") {
            PasswordHash::new(configured)
                .map_err(|e| anyhow::anyhow!("invalid argon2 hash in SERVER_PASSWORD: {}", e))?;
            return Ok(Self {
                phc: Arc::from(configured),
            });
        }
        Self::from_password(configured)
    }

    pub fn from_password(password: &str) -> anyhow::Result<Self> {
        if password.is_empty() {
            anyhow::bail!("server password must not be empty");
        }
        let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
            .map_err(|e| anyhow::anyhow!("encode salt: {}", e))?;
        let phc = hasher()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("hash server password: {}", e))?
            .to_string();
        Ok(Self {
            phc: Arc::from(phc),
        })
    }

    /// CPU-bound; call from a blocking context.
    pub fn verify(&self, candidate: &str) -> bool {
        let Ok(hash) = PasswordHash::new(&self.phc) else {
            return false;
        };
        Argon2::default()
            .verify_password(candidate.as_bytes(), &hash)
            .is_ok()
    }
}

// 8 MiB, single pass: this runs once per websocket handshake
fn hasher() -> anyhow::Result<Argon2<'static>> {
    let params = Params::new(8 * 1024, 1, 1, None)
        .map_err(|e| anyhow::anyhow!("argon2 params: {}", e))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod auth_test;
