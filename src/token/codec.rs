//! Compact HS256 token encoding: `base64url(header).base64url(claims).base64url(mac)`.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "HS256";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub alg: String,
    pub typ: String,
}

impl Header {
    fn hs256() -> Self {
        Self {
            alg: ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub sub: String,
    pub user_id: i64,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Absent on access tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<TokenType>,
}

impl Claims {
    #[must_use]
    pub fn kind(&self) -> TokenType {
        self.token_type.unwrap_or(TokenType::Access)
    }

    #[must_use]
    pub fn is_refresh(&self) -> bool {
        self.kind() == TokenType::Refresh
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid token format")]
    Format,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid signing key")]
    Key,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, CodecError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| CodecError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn mac(secret: &[u8], signing_input: &str) -> Result<HmacSha256, CodecError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| CodecError::Key)?;
    mac.update(signing_input.as_bytes());
    Ok(mac)
}

/// Sign `claims` with HMAC-SHA256.
///
/// # Errors
/// Returns an error if the claims cannot be encoded.
pub fn sign(secret: &[u8], claims: &Claims) -> Result<String, CodecError> {
    let header_b64 = b64e_json(&Header::hs256())?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");

    let tag = mac(secret, &signing_input)?.finalize().into_bytes();
    let signature_b64 = Base64UrlUnpadded::encode_string(&tag);

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Verify the signature and decode the claims. Expiry is not checked here.
///
/// # Errors
/// Returns an error if the token is malformed, uses another algorithm, or the
/// signature does not match.
pub fn verify(secret: &[u8], token: &str) -> Result<Claims, CodecError> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(CodecError::Format)?;
    let claims_b64 = parts.next().ok_or(CodecError::Format)?;
    let sig_b64 = parts.next().ok_or(CodecError::Format)?;
    if parts.next().is_some() || header_b64.is_empty() || claims_b64.is_empty() {
        return Err(CodecError::Format);
    }

    let header: Header = b64d_json(header_b64)?;
    if header.alg != ALGORITHM {
        return Err(CodecError::UnsupportedAlg(header.alg));
    }

    let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| CodecError::Base64)?;
    let signing_input = format!("{header_b64}.{claims_b64}");
    mac(secret, &signing_input)?
        .verify_slice(&signature)
        .map_err(|_| CodecError::InvalidSignature)?;

    b64d_json(claims_b64)
}
