use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::{
    credential::Credential,
    error::{CleanupError, ProbeError, SessionError},
    probe::{self, RemoteEntry},
    transport::{Connection, FileService, FileServiceError, RemoteAddress, Transport, TransportError},
    trust::TrustPolicy,
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_OUTSTANDING_WRITES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteStrategy {
    /// One outstanding write at a time, in source order.
    #[default]
    Sequential,
    /// Up to `max_outstanding` writes in flight for different offsets of one upload.
    Concurrent { max_outstanding: NonZeroUsize },
}

impl WriteStrategy {
    pub fn concurrent(max_outstanding: usize) -> WriteStrategy {
        match NonZeroUsize::new(max_outstanding) {
            Some(max_outstanding) => WriteStrategy::Concurrent { max_outstanding },
            None => WriteStrategy::Sequential,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub write_strategy: WriteStrategy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_strategy: WriteStrategy::Sequential,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Active,
    Closed,
}

pub struct SessionManager<T>
where
    T: Transport,
{
    transport: T,
    options: SessionOptions,
}

impl<T> SessionManager<T>
where
    T: Transport,
{
    pub fn new(transport: T, options: SessionOptions) -> SessionManager<T> {
        SessionManager { transport, options }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Dials, authenticates and opens the file service. Nothing is retried, and
    /// the transport is closed again on every failure after the dial.
    /// `connect_timeout` bounds all three steps together.
    pub async fn open(
        &self,
        address: &RemoteAddress,
        credential: Credential,
        trust: Arc<dyn TrustPolicy>,
    ) -> Result<Session<T::Connection>, SessionError> {
        if trust.is_insecure() {
            warn!(%address, "opening session with an insecure trust policy; host keys are not verified");
        }

        let timeout = self.options.connect_timeout;
        let deadline = Instant::now() + timeout;
        let timed_out = || SessionError::TransportUnreachable {
            address: address.clone(),
            source: TransportError::TimedOut(timeout),
        };

        let connection = match timeout_at(deadline, self.transport.dial(address, trust)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(err @ TransportError::HostKeyRejected(_))) => {
                error!(%address, "host key rejected during handshake");
                return Err(SessionError::AuthenticationRejected {
                    address: address.clone(),
                    source: err,
                });
            }
            Ok(Err(err)) => {
                return Err(SessionError::TransportUnreachable {
                    address: address.clone(),
                    source: err,
                })
            }
            Err(_) => return Err(timed_out()),
        };

        let mut session = Session {
            address: address.clone(),
            state: SessionState::Opening,
            connection: Some(connection),
            file_service: None,
            write_strategy: self.options.write_strategy,
        };

        match timeout_at(deadline, session.authenticate(&credential)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                session.close().await;
                return Err(SessionError::AuthenticationRejected {
                    address: address.clone(),
                    source: err,
                });
            }
            Err(_) => {
                warn!(%address, "authentication did not finish before the deadline");
                session.close().await;
                return Err(timed_out());
            }
        }

        match timeout_at(deadline, session.open_file_service()).await {
            Ok(Ok(file_service)) => {
                session.file_service = Some(file_service);
                session.state = SessionState::Active;
            }
            Ok(Err(err)) => {
                session.close().await;
                return Err(SessionError::ServiceUnavailable {
                    address: address.clone(),
                    source: err,
                });
            }
            Err(_) => {
                warn!(%address, "file service did not open before the deadline");
                session.close().await;
                return Err(timed_out());
            }
        }

        info!(
            %address,
            username = credential.username(),
            method = credential.method_name(),
            "session opened"
        );
        Ok(session)
    }
}

/// One transport connection and the file service multiplexed on it.
pub struct Session<C>
where
    C: Connection,
{
    address: RemoteAddress,
    state: SessionState,
    connection: Option<C>,
    file_service: Option<C::FileService>,
    write_strategy: WriteStrategy,
}

impl<C> Session<C>
where
    C: Connection,
{
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn address(&self) -> &RemoteAddress {
        &self.address
    }

    pub fn write_strategy(&self) -> WriteStrategy {
        self.write_strategy
    }

    pub fn set_write_strategy(&mut self, write_strategy: WriteStrategy) {
        self.write_strategy = write_strategy;
    }

    pub(crate) fn file_service(&self) -> Result<&C::FileService, FileServiceError> {
        match (self.state, &self.file_service) {
            (SessionState::Active, Some(file_service)) => Ok(file_service),
            _ => Err(FileServiceError::SessionClosed),
        }
    }

    pub async fn probe(&self, path: &str) -> Result<RemoteEntry, ProbeError> {
        probe::probe(self, path).await
    }

    /// Closes the file service and then the transport. Both are attempted even
    /// if one fails; failures are logged and returned, never raised. Closing a
    /// closed session does nothing.
    pub async fn close(&mut self) -> Vec<CleanupError> {
        let mut failures = Vec::new();
        if self.state == SessionState::Closed {
            return failures;
        }

        if let Some(mut file_service) = self.file_service.take() {
            if let Err(err) = file_service.close().await {
                warn!(address = %self.address, error = %err, "closing file service failed");
                failures.push(CleanupError::FileService(err));
            }
        }
        if let Some(mut connection) = self.connection.take() {
            if let Err(err) = connection.close().await {
                warn!(address = %self.address, error = %err, "closing transport failed");
                failures.push(CleanupError::Transport(err));
            }
        }

        self.state = SessionState::Closed;
        info!(address = %self.address, failures = failures.len(), "session closed");
        failures
    }

    async fn authenticate(&mut self, credential: &Credential) -> Result<(), TransportError> {
        let connection = self.connection.as_mut().ok_or(TransportError::Closed)?;
        debug!(address = %self.address, method = credential.method_name(), "authenticating");
        connection.authenticate(credential).await
    }

    async fn open_file_service(&mut self) -> Result<C::FileService, TransportError> {
        let connection = self.connection.as_mut().ok_or(TransportError::Closed)?;
        connection.open_file_service().await
    }
}

impl<C> Drop for Session<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            warn!(address = %self.address, "session dropped without close()");
        }
    }
}
