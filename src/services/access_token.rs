//! Stateless signed download links.
//!
//! A token is `base64url("<fileId>:<userId>:<exp>:<hmacHex>")` where the HMAC
//! covers `"<fileId>:<userId>:<exp>"`. Expiry is the only way to invalidate
//! one.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use hmac::{Hmac, Mac, digest::InvalidLength};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_LINK_TTL_SECS: u64 = 900;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed access token")]
    Malformed,
    #[error("access token signature mismatch")]
    BadSignature,
    #[error("access token expired")]
    Expired,
    #[error("cannot sign {0}: it must be non-empty and free of ':'")]
    InvalidClaim(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub file_id: String,
    pub user_id: String,
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct AccessTokenSigner {
    keyed: HmacSha256,
    default_ttl_secs: u64,
}

impl AccessTokenSigner {
    pub fn new(secret: &[u8], default_ttl_secs: u64) -> Result<Self, InvalidLength> {
        Ok(Self {
            keyed: HmacSha256::new_from_slice(secret)?,
            default_ttl_secs,
        })
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    pub fn issue(
        &self,
        file_id: &str,
        user_id: &str,
        ttl_secs: u64,
    ) -> Result<IssuedToken, TokenError> {
        self.issue_at(file_id, user_id, ttl_secs, Utc::now().timestamp())
    }

    pub fn issue_at(
        &self,
        file_id: &str,
        user_id: &str,
        ttl_secs: u64,
        now: i64,
    ) -> Result<IssuedToken, TokenError> {
        check_claim("file id", file_id)?;
        check_claim("user id", user_id)?;

        let expires_at = now.saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
        let data = format!("{file_id}:{user_id}:{expires_at}");
        let signature = hex::encode(self.sign(&data));
        let token = URL_SAFE_NO_PAD.encode(format!("{data}:{signature}"));

        Ok(IssuedToken { token, expires_at })
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Checks run in order: shape, signature, expiry.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<TokenClaims, TokenError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| TokenError::Malformed)?;
        let decoded = String::from_utf8(raw).map_err(|_| TokenError::Malformed)?;

        let parts: Vec<&str> = decoded.split(':').collect();
        let [file_id, user_id, exp, signature] = parts.as_slice() else {
            return Err(TokenError::Malformed);
        };
        if file_id.is_empty() || user_id.is_empty() {
            return Err(TokenError::Malformed);
        }
        let expires_at = parse_expiry(exp)?;

        let expected = hex::encode(self.sign(&format!("{file_id}:{user_id}:{exp}")));
        if !bool::from(signature.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(TokenError::BadSignature);
        }

        if expires_at <= now {
            return Err(TokenError::Expired);
        }

        Ok(TokenClaims {
            file_id: file_id.to_string(),
            user_id: user_id.to_string(),
            expires_at,
        })
    }

    fn sign(&self, data: &str) -> Vec<u8> {
        let mut mac = self.keyed.clone();
        mac.update(data.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

/// Expiry must be written exactly as `issue` writes it: plain digits, no
/// sign, no leading zeros.
fn parse_expiry(exp: &str) -> Result<i64, TokenError> {
    if exp.is_empty() || !exp.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TokenError::Malformed);
    }
    let expires_at: i64 = exp.parse().map_err(|_| TokenError::Malformed)?;
    if expires_at.to_string() != exp {
        return Err(TokenError::Malformed);
    }
    Ok(expires_at)
}

fn check_claim(name: &'static str, value: &str) -> Result<(), TokenError> {
    if value.is_empty() || value.contains(':') {
        return Err(TokenError::InvalidClaim(name));
    }
    Ok(())
}

/// Absolute link for capability downloads.
pub fn signed_stream_url(public_base_url: &str, file_id: &str, token: &str) -> String {
    format!(
        "{}/api/v1/files/{file_id}/stream-signed?token={token}",
        public_base_url.trim_end_matches('/')
    )
}
