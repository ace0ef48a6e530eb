//! Automatic reconnection of management connections.

use futures::Future;
use std::pin::Pin;
use tokio::{
    select,
    sync::{oneshot, watch},
    task::JoinHandle,
    time::sleep,
};

use crate::{Connection, ConnectionConfig, Error, ReconnectPolicy, Result};

/// Function establishing a new management connection.
pub type ConnectFn = Box<dyn (Fn() -> ConnectFuture) + Send + Sync>;

/// Future returned by a [ConnectFn].
pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Connection>> + Send>>;

/// Keeps a management connection open.
///
/// When the current connection closes, for example because the socket failed,
/// a replacement is established according to the [ReconnectPolicy].
/// Once all attempts have failed the supervisor gives up and
/// [connection](Self::connection) returns [ErrorKind::Closed](crate::ErrorKind::Closed).
///
/// Dropping the supervisor closes the current connection.
#[derive(custom_debug::Debug)]
pub struct Supervisor {
    policy: ReconnectPolicy,
    #[debug(skip)]
    current_rx: watch::Receiver<Option<Connection>>,
    #[debug(skip)]
    stop_tx: oneshot::Sender<()>,
    #[debug(skip)]
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Opens a management connection with the specified options and supervises it.
    pub async fn new(policy: ReconnectPolicy, config: ConnectionConfig) -> Result<Self> {
        Self::with_connect_fn(policy, move || {
            let config = config.clone();
            async move { Connection::with_config(config).await }
        })
        .await
    }

    /// Establishes a connection using the specified function and supervises it.
    ///
    /// The function is also used to establish replacement connections.
    /// Fails if the initial connection cannot be established.
    pub async fn with_connect_fn<F, Fut>(policy: ReconnectPolicy, connect: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Connection>> + Send + 'static,
    {
        let connect: ConnectFn = Box::new(move || -> ConnectFuture { Box::pin(connect()) });
        let first = connect().await?;
        let (current_tx, current_rx) = watch::channel(Some(first.clone()));
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(policy.clone(), connect, first, current_tx, stop_rx));
        Ok(Self { policy, current_rx, stop_tx, task })
    }

    /// Reconnection policy.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// The current connection.
    ///
    /// Fails with [ErrorKind::Closed](crate::ErrorKind::Closed) once reconnection has been given up.
    pub fn connection(&self) -> Result<Connection> {
        self.current_rx.borrow().clone().ok_or_else(Error::closed)
    }

    /// Waits until the current connection has been replaced and returns the replacement.
    ///
    /// Fails with [ErrorKind::Closed](crate::ErrorKind::Closed) when reconnection has been given up.
    pub async fn next_connection(&mut self) -> Result<Connection> {
        self.current_rx.changed().await.map_err(|_| Error::closed())?;
        self.connection()
    }

    /// Sends a command over the current connection and waits for its result.
    ///
    /// See [Connection::run_command].
    pub async fn run_command(&self, index: u16, opcode: impl Into<u16>, params: &[u8]) -> Result<Vec<u8>> {
        self.connection()?.run_command(index, opcode, params).await
    }

    /// Stops supervision and closes the current connection.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop_tx.send(());
        self.task.await?;
        Ok(())
    }
}

async fn supervise(
    policy: ReconnectPolicy, connect: ConnectFn, mut current: Connection,
    current_tx: watch::Sender<Option<Connection>>, mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        select! {
            () = current.closed() => (),
            _ = &mut stop_rx => break,
        }
        log::warn!("Management connection closed, reconnecting");

        match reconnect(&policy, &connect, &mut stop_rx).await {
            Some(conn) => {
                current = conn.clone();
                current_tx.send_replace(Some(conn));
            }
            None => {
                current_tx.send_replace(None);
                break;
            }
        }
    }

    let _ = current.close();
    log::trace!("Terminated management connection supervisor");
}

/// Attempts to establish a replacement connection.
///
/// Returns `None` when all attempts failed or supervision was stopped.
async fn reconnect(
    policy: &ReconnectPolicy, connect: &ConnectFn, stop_rx: &mut oneshot::Receiver<()>,
) -> Option<Connection> {
    for attempt in 0..policy.max_attempts {
        let delay = policy.delay(attempt);
        log::debug!("Reconnect attempt {}/{} in {:?}", attempt + 1, policy.max_attempts, delay);
        select! {
            () = sleep(delay) => (),
            _ = &mut *stop_rx => return None,
        }

        match connect().await {
            Ok(conn) => {
                log::debug!("Reconnected management connection after {} attempts", attempt + 1);
                return Some(conn);
            }
            Err(err) => {
                log::warn!("Reconnect attempt {}/{} failed: {}", attempt + 1, policy.max_attempts, &err)
            }
        }
    }

    log::error!("Giving up reconnecting management connection after {} attempts", policy.max_attempts);
    None
}
