//! User directory collaborator: verifies credentials and returns the account.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

const VERIFY_PATH: &str = "internal/users/verify";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    pub user_id: i64,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("directory returned unexpected status {0}")]
    Status(StatusCode),
    #[error("invalid directory url: {0}")]
    Url(#[from] url::ParseError),
}

#[async_trait]
pub trait UserDirectory: Send + Sync + std::fmt::Debug {
    /// `Ok(None)` for unknown users and wrong passwords alike.
    async fn verify(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<Option<DirectoryUser>, DirectoryError>;
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Directory reached over HTTP at `{base}/internal/users/verify`.
#[derive(Debug, Clone)]
pub struct RemoteDirectory {
    client: reqwest::Client,
    verify_url: Url,
}

impl RemoteDirectory {
    /// # Errors
    /// Returns an error if the url cannot be joined or the client cannot be built.
    pub fn new(base: &Url, timeout: Duration) -> Result<Self, DirectoryError> {
        let mut base = base.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            verify_url: base.join(VERIFY_PATH)?,
        })
    }

    #[must_use]
    pub fn verify_url(&self) -> &Url {
        &self.verify_url
    }
}

#[async_trait]
impl UserDirectory for RemoteDirectory {
    async fn verify(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<Option<DirectoryUser>, DirectoryError> {
        let response = self
            .client
            .post(self.verify_url.clone())
            .json(&VerifyRequest {
                username,
                password: password.expose_secret(),
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json::<DirectoryUser>().await?)),
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => {
                debug!(username, "directory rejected credentials");
                Ok(None)
            }
            status => {
                error!(username, %status, "unexpected directory response");
                Err(DirectoryError::Status(status))
            }
        }
    }
}

/// In-process directory for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: HashMap<String, (SecretString, DirectoryUser)>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user(mut self, user: DirectoryUser, password: &str) -> Self {
        self.users.insert(
            user.username.clone(),
            (SecretString::from(password.to_string()), user),
        );
        self
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn verify(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<Option<DirectoryUser>, DirectoryError> {
        Ok(self.users.get(username).and_then(|(stored, user)| {
            (digest(stored.expose_secret()) == digest(password.expose_secret()))
                .then(|| user.clone())
        }))
    }
}
