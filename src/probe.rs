use tracing::debug;

use crate::{
    error::ProbeError,
    session::Session,
    transport::{Connection, FileService, FileServiceError, RemoteMetadata},
};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// What a path on the server turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEntry {
    NotFound,
    File(RemoteMetadata),
    Directory(RemoteMetadata),
    /// Symlinks, devices, sockets, or anything without a reported type.
    Other(RemoteMetadata),
}

impl RemoteEntry {
    pub fn classify(metadata: RemoteMetadata) -> RemoteEntry {
        match metadata.permissions.map(|mode| mode & S_IFMT) {
            Some(S_IFDIR) => RemoteEntry::Directory(metadata),
            Some(S_IFREG) => RemoteEntry::File(metadata),
            _ => RemoteEntry::Other(metadata),
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, RemoteEntry::NotFound)
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, RemoteEntry::Directory(_))
    }

    pub fn metadata(&self) -> Option<&RemoteMetadata> {
        match self {
            RemoteEntry::NotFound => None,
            RemoteEntry::File(metadata) | RemoteEntry::Directory(metadata) | RemoteEntry::Other(metadata) => {
                Some(metadata)
            }
        }
    }
}

/// Absence is a result, not an error: only communication problems fail.
pub async fn probe<C>(session: &Session<C>, path: &str) -> Result<RemoteEntry, ProbeError>
where
    C: Connection,
{
    let failure = |source| ProbeError::CommunicationFailure {
        path: path.into(),
        source,
    };

    let file_service = session.file_service().map_err(failure)?;
    let entry = match file_service.stat(path).await {
        Ok(metadata) => RemoteEntry::classify(metadata),
        Err(FileServiceError::NotFound(_)) => RemoteEntry::NotFound,
        Err(err) => return Err(failure(err)),
    };

    debug!(path, ?entry, "probed remote path");
    Ok(entry)
}
