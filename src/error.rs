use std::io;

use thiserror::Error;

use crate::transport::{FileServiceError, RemoteAddress, TransportError};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("private key could not be decoded: {0}")]
    MalformedKey(#[source] russh_keys::Error),
    #[error("private key file could not be read: {0}")]
    KeyUnreadable(#[source] io::Error),
    #[error("key-pair authentication needs either `key` or `key_path`")]
    MissingKeyMaterial,
    #[error("both `key` and `key_path` are set; choose one")]
    ConflictingKeySources,
    #[error("password authentication requires a non-empty password")]
    EmptyPassword,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport endpoint {address} is unreachable")]
    TransportUnreachable {
        address: RemoteAddress,
        #[source]
        source: TransportError,
    },
    #[error("authentication with {address} was rejected")]
    AuthenticationRejected {
        address: RemoteAddress,
        #[source]
        source: TransportError,
    },
    #[error("file service on {address} is unavailable")]
    ServiceUnavailable {
        address: RemoteAddress,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not query metadata of {path}")]
    CommunicationFailure {
        path: String,
        #[source]
        source: FileServiceError,
    },
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("could not open remote file {path}")]
    OpenFailed {
        path: String,
        #[source]
        source: FileServiceError,
    },
    #[error("write at offset {offset} failed")]
    WriteFailed {
        offset: u64,
        #[source]
        source: FileServiceError,
    },
    #[error("could not truncate remote file to {length} bytes")]
    TruncateFailed {
        length: u64,
        #[source]
        source: FileServiceError,
    },
    #[error("reading the content source failed")]
    SourceFailed(#[source] io::Error),
    #[error("closing remote file {path} failed")]
    CloseFailed {
        path: String,
        #[source]
        source: FileServiceError,
    },
}

/// Failures collected while tearing a session down.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("closing the file service failed")]
    FileService(#[source] FileServiceError),
    #[error("closing the transport failed")]
    Transport(#[source] TransportError),
}
