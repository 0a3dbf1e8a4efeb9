#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use sftpush::{
    credential::{Credential, CredentialProvider},
    session::{Session, SessionManager, SessionOptions, WriteStrategy},
    transport::{
        Connection, FileService, FileServiceError, OpenMode, RemoteAddress, RemoteFile, RemoteMetadata, Transport,
        TransportError,
    },
    trust::{AcceptAny, HostIdentity, TrustDecision, TrustPolicy},
};
use tokio::sync::Notify;

pub const HOST_FINGERPRINT: &str = "SHA256:QfqW77LoZtj5R+vuG8BnThsnz2niYxePfHGsPImMS7M";

pub fn address() -> RemoteAddress {
    RemoteAddress::new("sftp.test", 22)
}

pub fn password() -> Credential {
    CredentialProvider::new()
        .password("uploader", "secret")
        .expect("password credential")
}

pub fn accept_any() -> Arc<dyn TrustPolicy> {
    Arc::new(AcceptAny)
}

#[derive(Debug, Default)]
pub struct Counters {
    pub dials: AtomicUsize,
    pub transport_closes: AtomicUsize,
    pub service_opens: AtomicUsize,
    pub service_closes: AtomicUsize,
}

impl Counters {
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn transport_closes(&self) -> usize {
        self.transport_closes.load(Ordering::SeqCst)
    }

    pub fn service_opens(&self) -> usize {
        self.service_opens.load(Ordering::SeqCst)
    }

    pub fn service_closes(&self) -> usize {
        self.service_closes.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum WriteFault {
    Fail,
    /// Fails only after a write at a later offset has been acknowledged.
    FailAfterLaterWrite,
    /// Acknowledges only this many bytes.
    ShortAck(u64),
}

#[derive(Debug, Default)]
pub struct FakeFs {
    pub files: HashMap<String, Vec<u8>>,
    pub directories: HashSet<String>,
    pub symlinks: HashSet<String>,
    pub unreadable: HashSet<String>,
    pub write_faults: HashMap<u64, WriteFault>,
    pub fail_writes_from: Option<u64>,
    pub fail_open: bool,
    pub max_write_len: Option<u64>,
    pub fail_truncate: bool,
    pub fail_file_close: bool,
    pub writes: Vec<(u64, usize)>,
    pub truncations: Vec<u64>,
    pub open_handles: usize,
    pub file_closes: usize,
}

impl FakeFs {
    pub fn seed(&mut self, path: &str, content: &[u8]) {
        self.files.insert(path.into(), content.to_vec());
    }

    fn fault_at(&self, offset: u64) -> Option<WriteFault> {
        if let Some(fault) = self.write_faults.get(&offset) {
            return Some(*fault);
        }
        match self.fail_writes_from {
            Some(from) if offset >= from => Some(WriteFault::Fail),
            _ => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct Fake {
    pub counters: Arc<Counters>,
    pub fs: Arc<Mutex<FakeFs>>,
    pub later_write_done: Arc<Notify>,
    pub fail_dial: bool,
    pub stall_dial: bool,
    pub stall_auth: bool,
    pub reject_auth: bool,
    pub stall_service: bool,
    pub fail_service: bool,
    pub fail_transport_close: bool,
    pub fail_service_close: bool,
    pub seen_hosts: Arc<Mutex<Vec<HostIdentity>>>,
}

impl Fake {
    pub fn new() -> Fake {
        Fake::default()
    }

    pub fn fs(&self) -> std::sync::MutexGuard<'_, FakeFs> {
        self.fs.lock().unwrap()
    }

    pub fn stored(&self, path: &str) -> Option<Vec<u8>> {
        self.fs().files.get(path).cloned()
    }

    pub fn manager(&self) -> SessionManager<Fake> {
        self.manager_with(WriteStrategy::Sequential)
    }

    pub fn manager_with(&self, write_strategy: WriteStrategy) -> SessionManager<Fake> {
        SessionManager::new(
            self.clone(),
            SessionOptions {
                connect_timeout: Duration::from_millis(200),
                write_strategy,
            },
        )
    }

    pub async fn open(&self, write_strategy: WriteStrategy) -> Session<FakeConnection> {
        self.manager_with(write_strategy)
            .open(&address(), password(), accept_any())
            .await
            .expect("session opens")
    }
}

#[async_trait]
impl Transport for Fake {
    type Connection = FakeConnection;

    async fn dial(
        &self,
        address: &RemoteAddress,
        trust: Arc<dyn TrustPolicy>,
    ) -> Result<FakeConnection, TransportError> {
        if self.stall_dial {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.fail_dial {
            return Err(TransportError::Unreachable("connection refused".into()));
        }
        let identity = HostIdentity {
            host: address.host.clone(),
            port: address.port,
            key_algorithm: "ssh-ed25519".into(),
            fingerprint: HOST_FINGERPRINT.into(),
        };
        self.seen_hosts.lock().unwrap().push(identity.clone());
        if trust.evaluate(&identity) == TrustDecision::Reject {
            return Err(TransportError::HostKeyRejected(address.clone()));
        }
        self.counters.dials.fetch_add(1, Ordering::SeqCst);
        Ok(FakeConnection {
            fake: self.clone(),
            open: true,
        })
    }
}

pub struct FakeConnection {
    fake: Fake,
    open: bool,
}

#[async_trait]
impl Connection for FakeConnection {
    type FileService = FakeFileService;

    async fn authenticate(&mut self, _credential: &Credential) -> Result<(), TransportError> {
        if self.fake.stall_auth {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.fake.reject_auth {
            return Err(TransportError::CredentialRejected);
        }
        Ok(())
    }

    async fn open_file_service(&mut self) -> Result<FakeFileService, TransportError> {
        if self.fake.stall_service {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.fake.fail_service {
            return Err(TransportError::Other("subsystem request failed".into()));
        }
        self.fake.counters.service_opens.fetch_add(1, Ordering::SeqCst);
        Ok(FakeFileService {
            fake: self.fake.clone(),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            panic!("transport closed twice");
        }
        self.open = false;
        self.fake.counters.transport_closes.fetch_add(1, Ordering::SeqCst);
        if self.fake.fail_transport_close {
            return Err(TransportError::Other("disconnect failed".into()));
        }
        Ok(())
    }
}

pub struct FakeFileService {
    fake: Fake,
}

#[async_trait]
impl FileService for FakeFileService {
    type File = FakeFile;

    async fn stat(&self, path: &str) -> Result<RemoteMetadata, FileServiceError> {
        let fs = self.fake.fs();
        if fs.unreadable.contains(path) {
            return Err(FileServiceError::other("permission denied"));
        }
        let (mode, size) = if fs.directories.contains(path) {
            (0o040755, 4096)
        } else if fs.symlinks.contains(path) {
            (0o120777, 11)
        } else if let Some(content) = fs.files.get(path) {
            (0o100644, content.len() as u64)
        } else {
            return Err(FileServiceError::NotFound(path.into()));
        };
        Ok(RemoteMetadata {
            size: Some(size),
            permissions: Some(mode),
            modified: Some(1_700_000_000),
        })
    }

    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<FakeFile, FileServiceError> {
        let mut fs = self.fake.fs();
        if fs.fail_open {
            return Err(FileServiceError::other("permission denied"));
        }
        match mode {
            OpenMode::CreateTruncate => {
                fs.files.insert(path.into(), Vec::new());
            }
            OpenMode::CreateExclusive => {
                if fs.files.contains_key(path) {
                    return Err(FileServiceError::other("file exists"));
                }
                fs.files.insert(path.into(), Vec::new());
            }
            OpenMode::AppendOrCreate => {
                fs.files.entry(path.into()).or_default();
            }
        }
        fs.open_handles += 1;
        Ok(FakeFile {
            fake: self.fake.clone(),
            path: path.into(),
            append: mode == OpenMode::AppendOrCreate,
        })
    }

    fn max_write_len(&self) -> Option<u64> {
        self.fake.fs().max_write_len
    }

    async fn close(&mut self) -> Result<(), FileServiceError> {
        self.fake.counters.service_closes.fetch_add(1, Ordering::SeqCst);
        if self.fake.fail_service_close {
            return Err(FileServiceError::other("channel already gone"));
        }
        Ok(())
    }
}

pub struct FakeFile {
    fake: Fake,
    path: String,
    append: bool,
}

impl FakeFile {
    fn store(&self, offset: u64, data: &[u8]) {
        let mut fs = self.fake.fs();
        fs.writes.push((offset, data.len()));
        let content = fs.files.entry(self.path.clone()).or_default();
        if self.append {
            content.extend_from_slice(data);
            return;
        }
        let start = offset as usize;
        let end = start + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
    }
}

#[async_trait]
impl RemoteFile for FakeFile {
    async fn write_at(&self, offset: u64, data: Vec<u8>) -> Result<u64, FileServiceError> {
        let limit = self.fake.fs().max_write_len;
        if limit.is_some_and(|limit| data.len() as u64 > limit) {
            return Err(FileServiceError::other("write limit reached"));
        }
        let fault = self.fake.fs().fault_at(offset);
        match fault {
            None => {
                self.store(offset, &data);
                self.fake.later_write_done.notify_one();
                Ok(data.len() as u64)
            }
            Some(WriteFault::Fail) => {
                self.fake.fs().writes.push((offset, 0));
                Err(FileServiceError::other("write rejected"))
            }
            Some(WriteFault::FailAfterLaterWrite) => {
                self.fake.later_write_done.notified().await;
                self.fake.fs().writes.push((offset, 0));
                Err(FileServiceError::other("write rejected"))
            }
            Some(WriteFault::ShortAck(acknowledged)) => {
                self.store(offset, &data[..acknowledged as usize]);
                Ok(acknowledged)
            }
        }
    }

    async fn truncate(&self, length: u64) -> Result<(), FileServiceError> {
        let mut fs = self.fake.fs();
        if fs.fail_truncate {
            return Err(FileServiceError::other("setstat failed"));
        }
        fs.truncations.push(length);
        if let Some(content) = fs.files.get_mut(&self.path) {
            content.truncate(length as usize);
        }
        Ok(())
    }

    async fn close(self) -> Result<(), FileServiceError> {
        let mut fs = self.fake.fs();
        fs.open_handles -= 1;
        fs.file_closes += 1;
        if fs.fail_file_close {
            return Err(FileServiceError::other("close failed"));
        }
        Ok(())
    }
}
