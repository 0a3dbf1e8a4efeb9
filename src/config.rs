//! Plain-data client configuration, layered from a TOML file and `SFTPUSH_*`
//! environment variables (nested keys split on `__`).

use std::{io::Cursor, path::Path, sync::Arc, time::Duration};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    credential::AuthConfig,
    session::{SessionOptions, WriteStrategy, DEFAULT_MAX_OUTSTANDING_WRITES},
    transport::{OpenMode, RemoteAddress},
    trust::{TrustConfig, TrustPolicy},
    upload::{UploadExecutor, UploadSpec, DEFAULT_CHUNK_SIZE},
};

pub const ENV_PREFIX: &str = "SFTPUSH_";
/// Largest write payload OpenSSH's sftp-server accepts (`max-write-length`).
pub const MAX_CHUNK_SIZE: usize = 255 * 1024;
const MAX_OUTSTANDING_WRITES: usize = 64;

/// Keys whose environment values are taken verbatim. `Env` parses `0123`
/// into the number 123, which loses data for passwords and payloads.
const STRING_KEYS: &[&str] = &[
    "host",
    "auth.username",
    "auth.password",
    "auth.key",
    "auth.key_path",
    "auth.passphrase",
    "upload.remote_directory",
    "upload.remote_file_name",
    "upload.content",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub remote_directory: String,
    pub remote_file_name: String,
    pub content: String,
    pub open_mode: OpenMode,
    pub concurrent_writes: bool,
    pub max_outstanding_writes: usize,
    pub chunk_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            remote_directory: String::new(),
            remote_file_name: String::new(),
            content: String::new(),
            open_mode: OpenMode::CreateTruncate,
            concurrent_writes: false,
            max_outstanding_writes: DEFAULT_MAX_OUTSTANDING_WRITES,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub auth: AuthConfig,
    pub trust: TrustConfig,
    pub upload: UploadConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: String::new(),
            port: 22,
            connect_timeout_secs: 30,
            auth: AuthConfig::default(),
            trust: TrustConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Loads `path` (if present) under the environment, then validates.
    pub fn load(path: &Path) -> Result<ClientConfig, ConfigError> {
        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    pub fn from_toml_str(toml: &str) -> Result<ClientConfig, ConfigError> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<ClientConfig, ConfigError> {
        let mut figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        for key in STRING_KEYS {
            let var = format!("{ENV_PREFIX}{}", key.replace('.', "__").to_uppercase());
            if let Ok(value) = std::env::var(&var) {
                figment = figment.merge(Serialized::default(key, value));
            }
        }
        let config: ClientConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(!self.host.trim().is_empty(), "host must not be empty")?;
        ensure(self.port != 0, "port must be > 0")?;
        ensure(!self.auth.username.is_empty(), "auth.username must not be empty")?;
        ensure(self.connect_timeout_secs > 0, "connect_timeout_secs must be > 0")?;
        ensure(
            (1..=MAX_CHUNK_SIZE).contains(&self.upload.chunk_size),
            &format!("upload.chunk_size must be between 1 and {MAX_CHUNK_SIZE}"),
        )?;
        ensure(
            (1..=MAX_OUTSTANDING_WRITES).contains(&self.upload.max_outstanding_writes),
            &format!("upload.max_outstanding_writes must be between 1 and {MAX_OUTSTANDING_WRITES}"),
        )?;
        Ok(())
    }

    pub fn address(&self) -> RemoteAddress {
        RemoteAddress::new(self.host.clone(), self.port)
    }

    pub fn session_options(&self) -> SessionOptions {
        let write_strategy = if self.upload.concurrent_writes {
            WriteStrategy::concurrent(self.upload.max_outstanding_writes)
        } else {
            WriteStrategy::Sequential
        };
        SessionOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            write_strategy,
        }
    }

    pub fn trust_policy(&self) -> Arc<dyn TrustPolicy> {
        self.trust.build()
    }

    pub fn upload_executor(&self) -> UploadExecutor {
        let mut executor = UploadExecutor::new();
        executor.chunk_size(self.upload.chunk_size);
        executor
    }

    pub fn upload_spec(&self) -> UploadSpec<Cursor<Vec<u8>>> {
        UploadSpec::from_bytes(
            self.upload.remote_directory.clone(),
            self.upload.remote_file_name.clone(),
            self.upload.content.clone(),
        )
        .open_mode(self.upload.open_mode)
    }
}

fn ensure(condition: bool, message: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Invalid(message.into()))
    }
}
