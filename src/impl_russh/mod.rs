mod file_service;

use std::sync::Arc;

use async_trait::async_trait;
use russh::{
    client::{self, Handle},
    Disconnect,
};
use russh_keys::key::PublicKey;
use russh_sftp::{
    client::{rawsession::Limits, RawSftpSession},
    extensions,
};
use tracing::{debug, warn};

pub use file_service::{RusshFileService, RusshRemoteFile};

use crate::{
    credential::Credential,
    transport::{Connection, RemoteAddress, Transport, TransportError},
    trust::{HostIdentity, TrustDecision, TrustPolicy},
};

/// SSH transport backed by `russh`, with the file service on the `sftp` subsystem.
#[derive(Clone)]
pub struct RusshTransport {
    config: Arc<client::Config>,
}

impl RusshTransport {
    pub fn new(config: client::Config) -> RusshTransport {
        RusshTransport {
            config: Arc::new(config),
        }
    }
}

impl Default for RusshTransport {
    fn default() -> Self {
        RusshTransport::new(client::Config::default())
    }
}

#[async_trait]
impl Transport for RusshTransport {
    type Connection = RusshConnection;

    async fn dial(
        &self,
        address: &RemoteAddress,
        trust: Arc<dyn TrustPolicy>,
    ) -> Result<RusshConnection, TransportError> {
        let handler = TrustHandler {
            address: address.clone(),
            trust,
        };
        let target = (address.host.as_str(), address.port);
        let handle = match client::connect(self.config.clone(), target, handler).await {
            Ok(handle) => handle,
            Err(russh::Error::UnknownKey) => return Err(TransportError::HostKeyRejected(address.clone())),
            Err(err) => return Err(TransportError::Unreachable(err.into())),
        };
        debug!(%address, "ssh handshake completed");

        Ok(RusshConnection { handle: Some(handle) })
    }
}

pub struct RusshConnection {
    handle: Option<Handle<TrustHandler>>,
}

impl RusshConnection {
    fn handle(&mut self) -> Result<&mut Handle<TrustHandler>, TransportError> {
        self.handle.as_mut().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Connection for RusshConnection {
    type FileService = RusshFileService;

    async fn authenticate(&mut self, credential: &Credential) -> Result<(), TransportError> {
        let handle = self.handle()?;
        let result = match credential {
            Credential::Password { username, password } => {
                handle.authenticate_password(username.as_str(), password.as_str()).await
            }
            Credential::KeyPair { username, key_pair } => {
                handle.authenticate_publickey(username.as_str(), key_pair.clone()).await
            }
        };
        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::CredentialRejected),
            Err(err) => Err(TransportError::Other(err.into())),
        }
    }

    async fn open_file_service(&mut self) -> Result<RusshFileService, TransportError> {
        let handle = self.handle()?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|err| TransportError::Other(err.into()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|err| TransportError::Other(err.into()))?;

        let mut sftp = RawSftpSession::new(channel.into_stream());
        let version = sftp.init().await.map_err(|err| TransportError::Other(err.into()))?;
        debug!(version = version.version, "sftp subsystem ready");

        let mut limits = Limits::default();
        if version.extensions.contains_key(extensions::LIMITS) {
            match sftp.limits().await {
                Ok(advertised) => {
                    limits = Limits::from(advertised);
                    sftp.set_limits(limits);
                    debug!(write_len = ?limits.write_len, "server limits applied");
                }
                Err(err) => warn!(error = %err, "could not query server limits"),
            }
        }

        Ok(RusshFileService::new(sftp, limits))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.handle.take() {
            Some(handle) => handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(|err| TransportError::Other(err.into())),
            None => Ok(()),
        }
    }
}

/// Routes the server's host key through the session's trust policy.
struct TrustHandler {
    address: RemoteAddress,
    trust: Arc<dyn TrustPolicy>,
}

#[async_trait]
impl client::Handler for TrustHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let identity = HostIdentity {
            host: self.address.host.clone(),
            port: self.address.port,
            key_algorithm: server_public_key.name().into(),
            fingerprint: format!("SHA256:{}", server_public_key.fingerprint()),
        };
        Ok(self.trust.evaluate(&identity) == TrustDecision::Accept)
    }
}
