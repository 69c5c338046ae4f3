//! Random secrets, their digests and the bearer wire format.

use std::fmt;

use anyhow::Context;
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

const TOKEN_BYTES: usize = 48;

/// Raw secret handed to a client exactly once. `Debug` never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct RawToken(String);

impl RawToken {
    pub fn generate() -> anyhow::Result<Self> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate token")?;
        Ok(Self(Base64UrlUnpadded::encode_string(&bytes)))
    }

    pub fn from_client(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Only this digest is ever persisted.
    pub fn digest(&self) -> Vec<u8> {
        sha256(self.0.as_bytes())
    }
}

impl fmt::Debug for RawToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawToken(..)")
    }
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Constant-time comparison of two digests.
pub fn digests_match(a: &[u8], b: &[u8]) -> bool {
    // Length is not secret for fixed-size digests.
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// `<session_id>.<token>` as carried in the Authorization header or cookie.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerValue {
    pub session_id: Uuid,
    pub token: RawToken,
}

impl BearerValue {
    pub fn parse(value: &str) -> Option<Self> {
        let (id, token) = value.trim().split_once('.')?;
        let session_id = Uuid::parse_str(id).ok()?;
        if token.is_empty() {
            return None;
        }
        Some(Self {
            session_id,
            token: RawToken::from_client(token),
        })
    }

    pub fn encode(&self) -> String {
        format!("{}.{}", self.session_id, self.token.expose())
    }
}

impl fmt::Debug for BearerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerValue")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
