//! Bearer token issuance, validation, rotation, and revocation.

pub mod codec;

pub use self::codec::{Claims, TokenType};

use crate::audit;
use crate::clock::Clock;
use crate::store::{keys, RevocationStore, StoreError};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

pub const MIN_SECRET_BYTES: usize = 32;
pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(86_400);
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(7 * 86_400);

const REASON_LOGOUT: &str = "logout";
const REASON_ROTATED: &str = "rotated";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token expired")]
    Expired,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token revoked")]
    Revoked,
    #[error("invalid refresh token")]
    Invalid,
    #[error("refresh tokens cannot be used as bearer credentials")]
    WrongTokenType,
    #[error("revocation store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("failed to sign token: {0}")]
    Signing(String),
    #[error("token secret must be at least {MIN_SECRET_BYTES} bytes")]
    WeakSecret,
}

impl From<codec::CodecError> for TokenError {
    fn from(err: codec::CodecError) -> Self {
        match err {
            codec::CodecError::InvalidSignature => Self::BadSignature,
            codec::CodecError::Key => Self::Signing(err.to_string()),
            codec::CodecError::Format
            | codec::CodecError::Base64
            | codec::CodecError::Json(_)
            | codec::CodecError::UnsupportedAlg(_) => Self::Malformed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: SecretString,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl TokenConfig {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub refresh_expires_in: u64,
}

#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    secret: Arc<SecretString>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    store: Arc<dyn RevocationStore>,
    clock: Arc<dyn Clock>,
}

impl CredentialIssuer {
    /// # Errors
    /// Returns [`TokenError::WeakSecret`] if the secret is shorter than [`MIN_SECRET_BYTES`].
    pub fn new(
        config: TokenConfig,
        store: Arc<dyn RevocationStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TokenError> {
        if config.secret.expose_secret().len() < MIN_SECRET_BYTES {
            return Err(TokenError::WeakSecret);
        }

        Ok(Self {
            secret: Arc::new(config.secret),
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
            store,
            clock,
        })
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    fn claims(
        &self,
        user_id: i64,
        username: &str,
        roles: &[String],
        kind: TokenType,
    ) -> Claims {
        let iat = self.clock.now_seconds();
        let ttl = match kind {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        Claims {
            sub: username.to_string(),
            user_id,
            iat,
            exp: iat.saturating_add(ttl_secs),
            jti: Ulid::new().to_string(),
            roles: match kind {
                TokenType::Access => roles.to_vec(),
                TokenType::Refresh => Vec::new(),
            },
            token_type: match kind {
                TokenType::Access => None,
                TokenType::Refresh => Some(TokenType::Refresh),
            },
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        Ok(codec::sign(self.secret.expose_secret().as_bytes(), claims)?)
    }

    /// # Errors
    /// Returns [`TokenError::Signing`] if the token cannot be encoded.
    pub fn issue_access_token(
        &self,
        user_id: i64,
        username: &str,
        roles: &[String],
    ) -> Result<String, TokenError> {
        let claims = self.claims(user_id, username, roles, TokenType::Access);
        let token = self.sign(&claims)?;
        debug!(user_id, jti = %claims.jti, "issued access token");
        Ok(token)
    }

    /// Issue a refresh token and register its session mapping.
    ///
    /// # Errors
    /// Returns [`TokenError::StoreUnavailable`] if the mapping cannot be written.
    pub async fn issue_refresh_token(
        &self,
        user_id: i64,
        username: &str,
    ) -> Result<String, TokenError> {
        let claims = self.claims(user_id, username, &[], TokenType::Refresh);
        let token = self.sign(&claims)?;
        self.store
            .set_with_ttl(&keys::session(&token), &user_id.to_string(), self.refresh_ttl)
            .await?;
        debug!(user_id, jti = %claims.jti, "issued refresh token");
        Ok(token)
    }

    /// Issue an access/refresh pair and link them so logout with either revokes both.
    ///
    /// # Errors
    /// Returns an error if signing fails or the store cannot be written.
    pub async fn issue_pair(
        &self,
        user_id: i64,
        username: &str,
        roles: &[String],
    ) -> Result<TokenPair, TokenError> {
        let refresh_token = self.issue_refresh_token(user_id, username).await?;

        let access_claims = self.claims(user_id, username, roles, TokenType::Access);
        let access_token = self.sign(&access_claims)?;
        self.store
            .set_with_ttl(
                &keys::access_link(&access_claims.jti),
                &refresh_token,
                self.access_ttl,
            )
            .await?;

        info!(
            target: audit::TARGET,
            event = "token.issued",
            user_id,
            access = %audit::fingerprint(&access_token),
            refresh = %audit::fingerprint(&refresh_token),
            "token pair issued"
        );

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.access_ttl.as_secs(),
            refresh_expires_in: self.refresh_ttl.as_secs(),
        })
    }

    fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        Ok(codec::verify(self.secret.expose_secret().as_bytes(), token)?)
    }

    /// Verify signature and expiry, then check revocation.
    ///
    /// # Errors
    /// Returns the first failing check. Store failures are reported as
    /// [`TokenError::StoreUnavailable`], never as a valid token.
    pub async fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.decode(token)?;
        if claims.exp <= self.clock.now_seconds() {
            return Err(TokenError::Expired);
        }
        if self.store.exists(&keys::revoked(token)).await? {
            return Err(TokenError::Revoked);
        }
        Ok(claims)
    }

    /// [`validate`](Self::validate), additionally refusing refresh tokens.
    ///
    /// # Errors
    /// Returns [`TokenError::WrongTokenType`] for refresh tokens.
    pub async fn validate_access(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.validate(token).await?;
        if claims.is_refresh() {
            return Err(TokenError::WrongTokenType);
        }
        Ok(claims)
    }

    /// Rotate a refresh token. Of concurrent callers presenting the same token,
    /// exactly one receives a new pair.
    ///
    /// # Errors
    /// Returns [`TokenError::Invalid`] if the token is not a live refresh token
    /// owned by its subject.
    pub async fn refresh(&self, old: &str) -> Result<TokenPair, TokenError> {
        let claims = self.validate(old).await?;
        if !claims.is_refresh() {
            return Err(TokenError::Invalid);
        }

        let owner = self.store.get_and_delete(&keys::session(old)).await?;
        if owner.as_deref() != Some(claims.user_id.to_string().as_str()) {
            warn!(
                target: audit::TARGET,
                event = "token.refresh_rejected",
                user_id = claims.user_id,
                token = %audit::fingerprint(old),
                "refresh token rejected"
            );
            return Err(TokenError::Invalid);
        }

        self.revoke(old, &claims, REASON_ROTATED).await?;
        let pair = self
            .issue_pair(claims.user_id, &claims.sub, &[])
            .await?;

        info!(
            target: audit::TARGET,
            event = "token.rotated",
            user_id = claims.user_id,
            previous = %audit::fingerprint(old),
            "refresh token rotated"
        );
        Ok(pair)
    }

    /// Revoke the presented token and whatever session it belongs to.
    /// Expired tokens are accepted and ignored.
    ///
    /// # Errors
    /// Returns [`TokenError::Malformed`] or [`TokenError::BadSignature`] for tokens
    /// this issuer did not sign.
    pub async fn logout(&self, token: &str) -> Result<(), TokenError> {
        let claims = self.decode(token)?;
        if claims.exp <= self.clock.now_seconds() {
            debug!(user_id = claims.user_id, "ignoring logout with expired token");
            return Ok(());
        }

        self.revoke(token, &claims, REASON_LOGOUT).await?;

        if claims.is_refresh() {
            self.store.delete(&keys::session(token)).await?;
        } else if let Some(refresh) = self
            .store
            .get_and_delete(&keys::access_link(&claims.jti))
            .await?
        {
            if let Ok(refresh_claims) = self.decode(&refresh) {
                self.revoke(&refresh, &refresh_claims, REASON_LOGOUT).await?;
            }
            self.store.delete(&keys::session(&refresh)).await?;
        }

        info!(
            target: audit::TARGET,
            event = "token.logout",
            user_id = claims.user_id,
            token = %audit::fingerprint(token),
            "session logged out"
        );
        Ok(())
    }

    async fn revoke(&self, token: &str, claims: &Claims, reason: &str) -> Result<(), TokenError> {
        let remaining = claims.exp.saturating_sub(self.clock.now_seconds());
        let Ok(remaining) = u64::try_from(remaining) else {
            return Ok(());
        };
        if remaining == 0 {
            return Ok(());
        }

        self.store
            .set_with_ttl(&keys::revoked(token), reason, Duration::from_secs(remaining))
            .await?;
        Ok(())
    }
}
