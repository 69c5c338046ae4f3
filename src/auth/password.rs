//! Credential hashing with in-place migration from the legacy format.
//!
//! Stored values are self-describing. The tag is parsed once and verification
//! dispatches on it:
//! - `$argon2id$…` (any `$argon2…` PHC string): current format.
//! - `$2a$`, `$2b$`, `$2y$`: legacy bcrypt.
//! - `$sha256$<hex>` or a bare 64-char hex digest: legacy unsalted SHA-256.
//!
//! Anything else never matches. Both legacy formats report `needs_rehash` on
//! a match. Formats cheaper than Argon2 also pay one dummy Argon2 verification
//! so response time does not reveal which accounts are still unmigrated.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use crate::auth::tokens::sha256;
use crate::config::PasswordConfig;

const LEGACY_SHA256_TAG: &str = "$sha256$";

/// Parsed form of a stored credential hash.
#[derive(Debug)]
pub enum StoredHash<'a> {
    Argon2(PasswordHash<'a>),
    LegacyBcrypt(&'a str),
    LegacySha256([u8; 32]),
}

impl<'a> StoredHash<'a> {
    pub fn parse(stored: &'a str) -> Option<Self> {
        if stored.starts_with("$argon2") {
            return PasswordHash::new(stored).ok().map(StoredHash::Argon2);
        }
        if ["$2a$", "$2b$", "$2y$"].iter().any(|tag| stored.starts_with(tag)) {
            return Some(StoredHash::LegacyBcrypt(stored));
        }
        let hex_digest = stored.strip_prefix(LEGACY_SHA256_TAG).unwrap_or(stored);
        if hex_digest.len() != 64 {
            return None;
        }
        let mut digest = [0u8; 32];
        hex::decode_to_slice(hex_digest, &mut digest).ok()?;
        Some(StoredHash::LegacySha256(digest))
    }
}

/// Outcome of checking a plaintext against a stored hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub matched: bool,
    /// Only ever true together with `matched`.
    pub needs_rehash: bool,
}

impl Verification {
    const NO_MATCH: Self = Self {
        matched: false,
        needs_rehash: false,
    };
}

pub struct CredentialHasher {
    argon2: Argon2<'static>,
    params: Params,
    dummy_hash: String,
}

impl CredentialHasher {
    pub fn new(config: &PasswordConfig) -> anyhow::Result<Self> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| anyhow::anyhow!("invalid argon2 parameters: {e}"))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone());
        let mut hasher = Self {
            argon2,
            params,
            dummy_hash: String::new(),
        };
        // Verified against when the account does not exist, so an unknown
        // identifier costs the same as a wrong password.
        hasher.dummy_hash = hasher.hash("ledgerkeep-dummy-credential")?;
        Ok(hasher)
    }

    /// Hash a plaintext with the current algorithm and parameters.
    pub fn hash(&self, plain: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(plain.as_bytes(), &salt)
            .map_err(|e| {
                error!(error = %e, "argon2 hash_password error");
                anyhow::anyhow!(e.to_string())
            })?
            .to_string();
        Ok(hash)
    }

    pub fn verify(&self, plain: &str, stored: &str) -> Verification {
        match StoredHash::parse(stored) {
            Some(StoredHash::Argon2(parsed)) => {
                // Parameters come from the stored string, not from self.
                let matched = self
                    .argon2
                    .verify_password(plain.as_bytes(), &parsed)
                    .is_ok();
                Verification {
                    matched,
                    needs_rehash: matched && !self.is_current(&parsed),
                }
            }
            Some(StoredHash::LegacyBcrypt(hash)) => {
                let matched = bcrypt::verify(plain, hash).unwrap_or_else(|e| {
                    warn!(error = %e, "malformed bcrypt hash");
                    false
                });
                Verification {
                    matched,
                    needs_rehash: matched,
                }
            }
            Some(StoredHash::LegacySha256(expected)) => {
                let matched: bool = sha256(plain.as_bytes()).as_slice().ct_eq(&expected[..]).into();
                self.verify_dummy(plain);
                Verification {
                    matched,
                    needs_rehash: matched,
                }
            }
            None => {
                warn!("stored credential hash has an unrecognized format");
                self.verify_dummy(plain);
                Verification::NO_MATCH
            }
        }
    }

    /// Burn one verification's worth of work against a fixed hash.
    pub fn verify_dummy(&self, plain: &str) {
        if let Ok(parsed) = PasswordHash::new(&self.dummy_hash) {
            let _ = self.argon2.verify_password(plain.as_bytes(), &parsed);
        }
    }

    fn is_current(&self, parsed: &PasswordHash<'_>) -> bool {
        if parsed.algorithm != Algorithm::Argon2id.ident() {
            return false;
        }
        if parsed.version != Some(Version::V0x13.into()) {
            return false;
        }
        match Params::try_from(parsed) {
            Ok(p) => {
                p.m_cost() == self.params.m_cost()
                    && p.t_cost() == self.params.t_cost()
                    && p.p_cost() == self.params.p_cost()
            }
            Err(_) => false,
        }
    }
}

/// The historic unsalted format, kept for migration tests and imports.
pub fn legacy_sha256_hash(plain: &str) -> String {
    format!("{LEGACY_SHA256_TAG}{}", hex::encode(sha256(plain.as_bytes())))
}
