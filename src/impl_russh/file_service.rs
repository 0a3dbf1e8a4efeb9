use std::sync::Arc;

use async_trait::async_trait;
use russh_sftp::{
    client::{error::Error, rawsession::Limits, RawSftpSession},
    protocol::{FileAttributes, OpenFlags, StatusCode},
};

use crate::transport::{FileService, FileServiceError, OpenMode, RemoteFile, RemoteMetadata};

pub struct RusshFileService {
    sftp: Option<Arc<RawSftpSession>>,
    limits: Limits,
}

impl RusshFileService {
    /// `limits` must already be applied to `sftp` with `set_limits`.
    pub(super) fn new(sftp: RawSftpSession, limits: Limits) -> RusshFileService {
        RusshFileService {
            sftp: Some(Arc::new(sftp)),
            limits,
        }
    }

    fn sftp(&self) -> Result<&Arc<RawSftpSession>, FileServiceError> {
        self.sftp.as_ref().ok_or(FileServiceError::SessionClosed)
    }
}

#[async_trait]
impl FileService for RusshFileService {
    type File = RusshRemoteFile;

    async fn stat(&self, path: &str) -> Result<RemoteMetadata, FileServiceError> {
        let attrs = self.sftp()?.stat(path).await.map_err(|err| wrap_err(path, err))?;
        Ok(RemoteMetadata {
            size: attrs.attrs.size,
            permissions: attrs.attrs.permissions,
            modified: attrs.attrs.mtime,
        })
    }

    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<RusshRemoteFile, FileServiceError> {
        let flags = match mode {
            OpenMode::CreateTruncate => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            OpenMode::CreateExclusive => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUDE,
            OpenMode::AppendOrCreate => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
        };
        let sftp = self.sftp()?;
        let handle = sftp
            .open(path, flags, empty_attributes())
            .await
            .map_err(|err| wrap_err(path, err))?;

        Ok(RusshRemoteFile {
            sftp: sftp.clone(),
            handle: handle.handle,
        })
    }

    fn max_write_len(&self) -> Option<u64> {
        self.limits.write_len
    }

    /// Closes the subsystem channel. Open remote files fail with an error afterwards.
    async fn close(&mut self) -> Result<(), FileServiceError> {
        match self.sftp.take() {
            Some(sftp) => sftp.close_session().map_err(FileServiceError::other),
            None => Ok(()),
        }
    }
}

pub struct RusshRemoteFile {
    sftp: Arc<RawSftpSession>,
    handle: String,
}

#[async_trait]
impl RemoteFile for RusshRemoteFile {
    async fn write_at(&self, offset: u64, data: Vec<u8>) -> Result<u64, FileServiceError> {
        let length = data.len() as u64;
        self.sftp
            .write(self.handle.as_str(), offset, data)
            .await
            .map_err(FileServiceError::other)?;
        Ok(length)
    }

    async fn truncate(&self, length: u64) -> Result<(), FileServiceError> {
        let mut attributes = empty_attributes();
        attributes.size = Some(length);
        self.sftp
            .fsetstat(self.handle.as_str(), attributes)
            .await
            .map_err(FileServiceError::other)?;
        Ok(())
    }

    async fn close(self) -> Result<(), FileServiceError> {
        self.sftp.close(self.handle).await.map_err(FileServiceError::other)?;
        Ok(())
    }
}

fn empty_attributes() -> FileAttributes {
    FileAttributes {
        size: None,
        uid: None,
        user: None,
        gid: None,
        group: None,
        permissions: None,
        atime: None,
        mtime: None,
    }
}

fn wrap_err(path: &str, err: Error) -> FileServiceError {
    match err {
        Error::Status(status) if status.status_code == StatusCode::NoSuchFile => {
            FileServiceError::NotFound(path.into())
        }
        err => FileServiceError::other(err),
    }
}
