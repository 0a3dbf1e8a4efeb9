use std::{fmt, fs, path::PathBuf, sync::Arc};

use russh_keys::key::KeyPair;
use serde::{Deserialize, Serialize};

use crate::error::CredentialError;

/// A transport-ready credential, consumed once when a session is opened.
#[derive(Clone)]
pub enum Credential {
    Password { username: String, password: String },
    KeyPair { username: String, key_pair: Arc<KeyPair> },
}

impl Credential {
    pub fn username(&self) -> &str {
        match self {
            Credential::Password { username, .. } => username,
            Credential::KeyPair { username, .. } => username,
        }
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            Credential::Password { .. } => "password",
            Credential::KeyPair { .. } => "publickey",
        }
    }
}

// secrets never reach logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("method", &self.method_name())
            .field("username", &self.username())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(flatten)]
    pub method: AuthMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum AuthMethod {
    Password {
        #[serde(default)]
        password: String,
    },
    KeyPair {
        /// Inline key material (OpenSSH, PKCS#8 or PKCS#1 PEM).
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        key_path: Option<PathBuf>,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            username: String::new(),
            method: AuthMethod::Password {
                password: String::new(),
            },
        }
    }
}

/// Where private key material is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Inline(String),
    File(PathBuf),
}

impl KeySource {
    fn read(&self) -> Result<String, CredentialError> {
        match self {
            KeySource::Inline(material) => Ok(material.clone()),
            KeySource::File(path) => fs::read_to_string(path).map_err(CredentialError::KeyUnreadable),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CredentialProvider {
    require_password: bool,
}

impl CredentialProvider {
    pub fn new() -> CredentialProvider {
        CredentialProvider::default()
    }

    /// Rejects empty passwords during [`CredentialProvider::resolve`].
    pub fn require_password(&mut self) -> &mut Self {
        self.require_password = true;
        self
    }

    pub fn resolve(&self, config: &AuthConfig) -> Result<Credential, CredentialError> {
        match &config.method {
            AuthMethod::Password { password } => self.password(&config.username, password),
            AuthMethod::KeyPair {
                key,
                key_path,
                passphrase,
            } => {
                let source = match (key, key_path) {
                    (Some(_), Some(_)) => return Err(CredentialError::ConflictingKeySources),
                    (Some(material), None) => KeySource::Inline(material.clone()),
                    (None, Some(path)) => KeySource::File(path.clone()),
                    (None, None) => return Err(CredentialError::MissingKeyMaterial),
                };
                self.key_pair(&config.username, &source, passphrase.as_deref())
            }
        }
    }

    pub fn password(&self, username: &str, password: &str) -> Result<Credential, CredentialError> {
        if self.require_password && password.is_empty() {
            return Err(CredentialError::EmptyPassword);
        }
        Ok(Credential::Password {
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn key_pair(
        &self,
        username: &str,
        source: &KeySource,
        passphrase: Option<&str>,
    ) -> Result<Credential, CredentialError> {
        let material = source.read()?;
        let key_pair =
            russh_keys::decode_secret_key(&material, passphrase).map_err(CredentialError::MalformedKey)?;
        Ok(Credential::KeyPair {
            username: username.into(),
            key_pair: Arc::new(key_pair),
        })
    }
}
