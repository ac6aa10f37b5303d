use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use pggate_protocol::{Message, Transport};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::AuthConfig;
use crate::errors::PgError;

/// Provides the reference password for a user, against which the client's
/// response is checked.
#[async_trait]
pub trait PasswordProvider: Send + Sync {
    async fn password(&self, user: &str) -> Result<Vec<u8>, PgError>;
}

/// A password provider that always returns the same password, regardless
/// of the user name.
pub struct ConstantPasswordProvider {
    password: Vec<u8>,
}

impl ConstantPasswordProvider {
    pub fn new(password: impl Into<Vec<u8>>) -> Self {
        ConstantPasswordProvider {
            password: password.into(),
        }
    }
}

#[async_trait]
impl PasswordProvider for ConstantPasswordProvider {
    async fn password(&self, _user: &str) -> Result<Vec<u8>, PgError> {
        Ok(self.password.clone())
    }
}

/// Password lookup backed by a fixed user table, as loaded from the
/// configuration file. Unknown users fail the same way as a wrong
/// password.
pub struct MapPasswordProvider {
    users: HashMap<String, Vec<u8>>,
}

impl MapPasswordProvider {
    pub fn new(users: HashMap<String, Vec<u8>>) -> Self {
        MapPasswordProvider { users }
    }
}

#[async_trait]
impl PasswordProvider for MapPasswordProvider {
    async fn password(&self, user: &str) -> Result<Vec<u8>, PgError> {
        self.users
            .get(user)
            .cloned()
            .ok_or_else(|| PgError::auth_failed(password_mismatch(user)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Trust,
    Cleartext,
    Md5,
}

/// Runs the authentication exchange at the start of a session. Trust
/// accepts immediately; cleartext and MD5 request a password message and
/// verify it against the provider.
pub struct Authenticator {
    method: AuthMethod,
    provider: Option<Arc<dyn PasswordProvider>>,
}

impl Authenticator {
    pub fn trust() -> Self {
        Authenticator {
            method: AuthMethod::Trust,
            provider: None,
        }
    }

    pub fn cleartext(provider: Arc<dyn PasswordProvider>) -> Self {
        Authenticator {
            method: AuthMethod::Cleartext,
            provider: Some(provider),
        }
    }

    pub fn md5(provider: Arc<dyn PasswordProvider>) -> Self {
        Authenticator {
            method: AuthMethod::Md5,
            provider: Some(provider),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| (u.username.clone(), u.password.clone().into_bytes()))
            .collect();
        let provider = Arc::new(MapPasswordProvider::new(users));
        match config.method {
            AuthMethod::Trust => Authenticator::trust(),
            AuthMethod::Cleartext => Authenticator::cleartext(provider),
            AuthMethod::Md5 => Authenticator::md5(provider),
        }
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Performs the exchange for the configured method. Returns false when
    /// the client failed to authenticate, in which case a FATAL
    /// ErrorResponse has already been written and the caller must drop the
    /// connection without further traffic. IO failures are returned as
    /// errors.
    pub async fn authenticate<S>(&self, transport: &mut Transport<S>, user: &str) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let outcome = match self.method {
            AuthMethod::Trust => Ok(()),
            AuthMethod::Cleartext => self.verify_cleartext(transport, user).await?,
            AuthMethod::Md5 => self.verify_md5(transport, user).await?,
        };
        match outcome {
            Ok(()) => {
                transport.write_message(Message::authentication_ok()).await?;
                Ok(true)
            }
            Err(err) => {
                transport.write_message(err.to_message()).await?;
                Ok(false)
            }
        }
    }

    async fn verify_cleartext<S>(
        &self,
        transport: &mut Transport<S>,
        user: &str,
    ) -> Result<Result<(), PgError>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        transport
            .write_message(Message::authentication_cleartext())
            .await?;
        let response = transport.read_message().await?;
        if response.message_type() != b'p' {
            return Ok(Err(unexpected_response(&response)));
        }
        let expected = match self.provider_password(user).await {
            Ok(p) => p,
            Err(err) => return Ok(Err(err)),
        };
        if extract_password(&response) != expected {
            return Ok(Err(PgError::auth_failed(password_mismatch(user))));
        }
        Ok(Ok(()))
    }

    async fn verify_md5<S>(
        &self,
        transport: &mut Transport<S>,
        user: &str,
    ) -> Result<Result<(), PgError>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let salt = random_salt();
        transport
            .write_message(Message::authentication_md5(salt))
            .await?;
        let response = transport.read_message().await?;
        if response.message_type() != b'p' {
            return Ok(Err(unexpected_response(&response)));
        }
        let expected = match self.provider_password(user).await {
            Ok(p) => p,
            Err(err) => return Ok(Err(err)),
        };
        let expected_hash = hash_user_password(user, &expected, &salt);
        if extract_password(&response) != expected_hash {
            return Ok(Err(PgError::auth_failed(password_mismatch(user))));
        }
        Ok(Ok(()))
    }

    async fn provider_password(&self, user: &str) -> Result<Vec<u8>, PgError> {
        match self.provider.as_ref() {
            Some(provider) => provider.password(user).await,
            None => Err(PgError::auth_failed(password_mismatch(user))),
        }
    }
}

fn password_mismatch(user: &str) -> String {
    format!("Password does not match for user \"{}\"", user)
}

fn unexpected_response(msg: &Message) -> PgError {
    PgError::auth_failed(format!(
        "expected password response, got message type '{}'",
        msg.message_type() as char
    ))
}

/// The password bytes of a 'p' message: everything between the length
/// prefix and the trailing NUL.
fn extract_password(msg: &Message) -> Vec<u8> {
    let bytes = msg.as_bytes();
    if bytes.len() < 6 {
        return Vec::new();
    }
    bytes[5..bytes.len() - 1].to_vec()
}

/// A cryptographically random 4-byte salt for the MD5 exchange.
pub(crate) fn random_salt() -> [u8; 4] {
    let mut salt = [0u8; 4];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// The PostgreSQL MD5 password scheme:
/// concat("md5", md5(concat(md5(concat(password, user)), salt))), with both
/// digests rendered as lowercase hex.
pub(crate) fn hash_user_password(user: &str, password: &[u8], salt: &[u8; 4]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(password.len() + user.len());
    inner.extend_from_slice(password);
    inner.extend_from_slice(user.as_bytes());
    let inner_hex = format!("{:x}", md5::compute(&inner));

    let mut salted = Vec::with_capacity(inner_hex.len() + salt.len());
    salted.extend_from_slice(inner_hex.as_bytes());
    salted.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&salted)).into_bytes()
}
