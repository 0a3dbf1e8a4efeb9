use std::{collections::BTreeMap, io::Cursor};

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};

use crate::{
    error::UploadError,
    session::{Session, WriteStrategy},
    transport::{Connection, FileService, FileServiceError, OpenMode, RemoteFile},
};

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Content destined for `remote_directory/remote_file_name`.
#[derive(Debug, Clone)]
pub struct UploadSpec<R> {
    pub remote_directory: String,
    pub remote_file_name: String,
    pub content: R,
    pub open_mode: OpenMode,
}

impl<R> UploadSpec<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(
        remote_directory: impl Into<String>,
        remote_file_name: impl Into<String>,
        content: R,
    ) -> UploadSpec<R> {
        UploadSpec {
            remote_directory: remote_directory.into(),
            remote_file_name: remote_file_name.into(),
            content,
            open_mode: OpenMode::default(),
        }
    }

    pub fn open_mode(mut self, open_mode: OpenMode) -> Self {
        self.open_mode = open_mode;
        self
    }

    pub fn remote_path(&self) -> String {
        join_remote_path(&self.remote_directory, &self.remote_file_name)
    }
}

impl UploadSpec<Cursor<Vec<u8>>> {
    pub fn from_bytes(
        remote_directory: impl Into<String>,
        remote_file_name: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> UploadSpec<Cursor<Vec<u8>>> {
        UploadSpec::new(remote_directory, remote_file_name, Cursor::new(content.into()))
    }
}

#[derive(Debug)]
pub struct UploadResult {
    /// Bytes acknowledged by the server, contiguous from the start of the upload.
    pub bytes_written: u64,
    pub completed: bool,
    /// Why an incomplete upload stopped.
    pub interruption: Option<UploadError>,
}

#[derive(Debug, Clone)]
pub struct UploadExecutor {
    chunk_size: usize,
}

impl Default for UploadExecutor {
    fn default() -> Self {
        UploadExecutor {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl UploadExecutor {
    pub fn new() -> UploadExecutor {
        UploadExecutor::default()
    }

    pub fn chunk_size(&mut self, chunk_size: usize) -> &mut Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Copies `spec.content` to the remote path. The remote handle is closed
    /// on every path out of this function.
    pub async fn upload<C, R>(
        &self,
        session: &Session<C>,
        mut spec: UploadSpec<R>,
    ) -> Result<UploadResult, UploadError>
    where
        C: Connection,
        R: AsyncRead + Unpin + Send,
    {
        let path = spec.remote_path();
        let file_service = session.file_service().map_err(|source| UploadError::OpenFailed {
            path: path.clone(),
            source,
        })?;
        let file = file_service
            .open_file(&path, spec.open_mode)
            .await
            .map_err(|source| UploadError::OpenFailed {
                path: path.clone(),
                source,
            })?;

        let chunk_size = match file_service.max_write_len() {
            Some(limit) => {
                let limit = usize::try_from(limit).unwrap_or(usize::MAX);
                self.chunk_size.min(limit).max(1)
            }
            None => self.chunk_size,
        };
        if chunk_size < self.chunk_size {
            debug!(path = %path, chunk_size, "chunk size clamped to the server write limit");
        }

        let source = &mut spec.content;
        let outcome = match (session.write_strategy(), spec.open_mode) {
            (WriteStrategy::Concurrent { .. }, OpenMode::AppendOrCreate) => {
                debug!(path = %path, "append uploads are always sequential");
                write_sequential(&file, source, chunk_size).await
            }
            (WriteStrategy::Concurrent { max_outstanding }, _) => {
                write_concurrent(&file, source, chunk_size, max_outstanding.get()).await
            }
            (WriteStrategy::Sequential, _) => write_sequential(&file, source, chunk_size).await,
        };

        let closed = file.close().await;
        match (outcome, closed) {
            (Err(err), Err(close_err)) => {
                warn!(path = %path, error = %close_err, "closing remote file failed after an upload error");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(result), Err(source)) if result.completed => Err(UploadError::CloseFailed { path, source }),
            (Ok(result), Err(close_err)) => {
                warn!(path = %path, error = %close_err, "closing remote file failed after a partial upload");
                Ok(result)
            }
            (Ok(result), Ok(())) => {
                if result.completed {
                    info!(path = %path, bytes = result.bytes_written, "upload completed");
                } else {
                    warn!(path = %path, bytes = result.bytes_written, "upload stopped early");
                }
                Ok(result)
            }
        }
    }
}

async fn write_sequential<F, R>(
    file: &F,
    source: &mut R,
    chunk_size: usize,
) -> Result<UploadResult, UploadError>
where
    F: RemoteFile,
    R: AsyncRead + Unpin + Send,
{
    let mut buffer = vec![0u8; chunk_size];
    let mut offset = 0u64;

    loop {
        let filled = match read_chunk(source, &mut buffer).await {
            Ok(0) => break,
            Ok(filled) => filled,
            Err(err) => return Ok(interrupted(offset, UploadError::SourceFailed(err))),
        };

        let mut sent = 0;
        while sent < filled {
            let pending = &buffer[sent..filled];
            match file.write_at(offset, pending.to_vec()).await {
                Ok(0) => {
                    let cause = UploadError::WriteFailed {
                        offset,
                        source: FileServiceError::ZeroLengthAck,
                    };
                    return Ok(interrupted(offset, cause));
                }
                Ok(acknowledged) => {
                    let acknowledged = acknowledged.min(pending.len() as u64);
                    debug!(offset, acknowledged, "write acknowledged");
                    offset += acknowledged;
                    sent += acknowledged as usize;
                }
                Err(source) => return Ok(interrupted(offset, UploadError::WriteFailed { offset, source })),
            }
        }
    }

    Ok(UploadResult {
        bytes_written: offset,
        completed: true,
        interruption: None,
    })
}

/// Keeps up to `max_outstanding` writes in flight. After the first failure no
/// new writes are issued, the in-flight ones are drained, and the file is cut
/// back to the prefix that was fully acknowledged so it never holds a hole.
async fn write_concurrent<F, R>(
    file: &F,
    source: &mut R,
    chunk_size: usize,
    max_outstanding: usize,
) -> Result<UploadResult, UploadError>
where
    F: RemoteFile,
    R: AsyncRead + Unpin + Send,
{
    let mut in_flight = FuturesUnordered::new();
    let mut acknowledged = AcknowledgedRanges::default();
    let mut next_offset = 0u64;
    let mut exhausted = false;
    let mut interruption: Option<UploadError> = None;

    loop {
        while interruption.is_none() && !exhausted && in_flight.len() < max_outstanding {
            let mut buffer = vec![0u8; chunk_size];
            match read_chunk(source, &mut buffer).await {
                Ok(0) => exhausted = true,
                Ok(filled) => {
                    buffer.truncate(filled);
                    let offset = next_offset;
                    let length = filled as u64;
                    next_offset += length;
                    in_flight.push(async move { (offset, length, file.write_at(offset, buffer).await) });
                }
                Err(err) => interruption = Some(UploadError::SourceFailed(err)),
            }
        }

        let Some((offset, length, result)) = in_flight.next().await else {
            break;
        };
        match result {
            Ok(ack) if ack >= length => {
                debug!(offset, length, "write acknowledged");
                acknowledged.insert(offset, length);
            }
            Ok(ack) => {
                acknowledged.insert(offset, ack);
                let source = FileServiceError::ShortWrite {
                    sent: length,
                    acknowledged: ack,
                };
                interruption.get_or_insert(UploadError::WriteFailed {
                    offset: offset + ack,
                    source,
                });
            }
            Err(source) => {
                debug!(offset, length, error = %source, "write failed");
                interruption.get_or_insert(UploadError::WriteFailed { offset, source });
            }
        }
    }

    let Some(interruption) = interruption else {
        return Ok(UploadResult {
            bytes_written: next_offset,
            completed: true,
            interruption: None,
        });
    };

    let contiguous = acknowledged.contiguous_prefix();
    if let Err(source) = file.truncate(contiguous).await {
        error!(length = contiguous, error = %source, "truncate after a failed write failed");
        return Err(UploadError::TruncateFailed {
            length: contiguous,
            source,
        });
    }
    debug!(length = contiguous, "truncated to the acknowledged prefix");
    Ok(interrupted(contiguous, interruption))
}

fn interrupted(bytes_written: u64, cause: UploadError) -> UploadResult {
    UploadResult {
        bytes_written,
        completed: false,
        interruption: Some(cause),
    }
}

/// Fills `buffer` unless the source ends first. Returns 0 once the source is exhausted.
async fn read_chunk<R>(source: &mut R, buffer: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + Send,
{
    let mut filled = 0;
    while filled < buffer.len() {
        match source.read(&mut buffer[filled..]).await? {
            0 => break,
            read => filled += read,
        }
    }
    Ok(filled)
}

#[derive(Debug, Default)]
struct AcknowledgedRanges {
    ends_by_start: BTreeMap<u64, u64>,
}

impl AcknowledgedRanges {
    fn insert(&mut self, offset: u64, length: u64) {
        if length > 0 {
            self.ends_by_start.insert(offset, offset + length);
        }
    }

    fn contiguous_prefix(&self) -> u64 {
        let mut end = 0;
        while let Some(next) = self.ends_by_start.get(&end) {
            end = *next;
        }
        end
    }
}

fn join_remote_path(directory: &str, file_name: &str) -> String {
    let file_name = file_name.trim_start_matches('/');
    if directory.is_empty() {
        return file_name.into();
    }
    format!("{}/{}", directory.trim_end_matches('/'), file_name)
}
