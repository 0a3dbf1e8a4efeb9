use std::{error::Error, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{credential::Credential, trust::TrustPolicy};

pub type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    pub host: String,
    pub port: u16,
}

impl RemoteAddress {
    pub fn new(host: impl Into<String>, port: u16) -> RemoteAddress {
        RemoteAddress {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection could not be established: {0}")]
    Unreachable(#[source] BoxError),
    #[error("dial did not complete within {0:?}")]
    TimedOut(Duration),
    #[error("host key of {0} was rejected by the trust policy")]
    HostKeyRejected(RemoteAddress),
    #[error("server rejected the offered credential")]
    CredentialRejected,
    #[error("connection is already closed")]
    Closed,
    #[error(transparent)]
    Other(BoxError),
}

#[derive(Debug, Error)]
pub enum FileServiceError {
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("file service session is closed")]
    SessionClosed,
    #[error("server acknowledged zero bytes")]
    ZeroLengthAck,
    #[error("server acknowledged {acknowledged} of {sent} bytes")]
    ShortWrite { sent: u64, acknowledged: u64 },
    #[error(transparent)]
    Other(BoxError),
}

impl FileServiceError {
    pub fn other(err: impl Into<BoxError>) -> FileServiceError {
        FileServiceError::Other(err.into())
    }
}

/// How a remote file handle is created or opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpenMode {
    /// Create the file, or reset an existing one to zero length as part of the open.
    #[default]
    CreateTruncate,
    /// Create the file, failing if it already exists.
    CreateExclusive,
    /// Create the file if missing; every write lands at its end.
    AppendOrCreate,
}

/// Raw attributes reported by the file service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteMetadata {
    pub size: Option<u64>,
    /// Full POSIX mode, including the file type bits.
    pub permissions: Option<u32>,
    /// Seconds since the unix epoch.
    pub modified: Option<u32>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    type Connection: Connection;

    /// Dials `address` and runs the key exchange. `trust` must be consulted
    /// for the server's host key before the handshake completes.
    async fn dial(
        &self,
        address: &RemoteAddress,
        trust: Arc<dyn TrustPolicy>,
    ) -> Result<Self::Connection, TransportError>;
}

#[async_trait]
pub trait Connection: Send {
    type FileService: FileService;

    async fn authenticate(&mut self, credential: &Credential) -> Result<(), TransportError>;

    async fn open_file_service(&mut self) -> Result<Self::FileService, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait FileService: Send + Sync {
    type File: RemoteFile;

    /// Reports `FileServiceError::NotFound` when the path does not exist.
    async fn stat(&self, path: &str) -> Result<RemoteMetadata, FileServiceError>;

    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<Self::File, FileServiceError>;

    /// Largest payload the server accepts in a single write, if it advertises one.
    fn max_write_len(&self) -> Option<u64> {
        None
    }

    async fn close(&mut self) -> Result<(), FileServiceError>;
}

#[async_trait]
pub trait RemoteFile: Send + Sync {
    /// Returns the number of bytes acknowledged by the server. Several calls
    /// may be in flight at once for different offsets.
    async fn write_at(&self, offset: u64, data: Vec<u8>) -> Result<u64, FileServiceError>;

    async fn truncate(&self, length: u64) -> Result<(), FileServiceError>;

    async fn close(self) -> Result<(), FileServiceError>;
}
