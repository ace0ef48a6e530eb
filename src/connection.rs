//! Management connection.

use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, OwnedMutexGuard},
    time::{timeout_at, Instant},
};

use crate::{
    command::{opcode_name, HEADER_LEN},
    listener::timed_out,
    socket::wait_closed,
    Command, CommandListener, ConnectionConfig, Error, ErrorKind, Event, EventFilter, EventStream,
    EventSubscriber, Listener, ListenerId, PendingCommand, Result, Socket, SocketState,
};

/// Listener registration request.
struct AddReq {
    id: ListenerId,
    listener: Box<dyn Listener>,
    ready_tx: oneshot::Sender<()>,
}

#[derive(custom_debug::Debug)]
struct ConnectionInner {
    socket: Arc<Socket>,
    config: ConnectionConfig,
    #[debug(skip)]
    add_tx: mpsc::Sender<AddReq>,
    #[debug(skip)]
    remove_tx: mpsc::UnboundedSender<ListenerId>,
    #[debug(skip)]
    shutdown_tx: Arc<watch::Sender<bool>>,
    #[debug(skip)]
    in_flight: Mutex<HashMap<(u16, u16), Arc<AsyncMutex<()>>>>,
}

impl ConnectionInner {
    fn close(&self) -> Result<()> {
        let res = self.socket.close();
        if !self.shutdown_tx.send_replace(true) {
            log::debug!("Closing management connection");
        }
        res
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Connection to the Bluetooth management interface of the kernel.
///
/// Owns the management socket, a task reading frames from it and a task
/// dispatching the decoded events to registered [listeners](Listener).
/// Clones share the same connection, which is closed when
/// [close](Self::close) is called, the socket fails or the last clone is dropped.
#[derive(Clone, Debug)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Opens a management connection with default options.
    pub async fn new() -> Result<Self> {
        Self::with_config(ConnectionConfig::default()).await
    }

    /// Opens a management connection with the specified options.
    pub async fn with_config(config: ConnectionConfig) -> Result<Self> {
        let socket = Socket::open()?;
        Self::from_socket(socket, config)
    }

    /// Creates a connection over an already bound socket.
    ///
    /// Must be called from a Tokio runtime.
    pub fn from_socket(socket: Socket, config: ConnectionConfig) -> Result<Self> {
        match socket.state() {
            SocketState::Bound => (),
            SocketState::Closed => return Err(Error::closed()),
            state => return Err(Error::with_message(ErrorKind::NotConnected, format!("socket is {state}"))),
        }
        if config.read_buffer_size < HEADER_LEN {
            return Err(Error::invalid_format(format!(
                "read buffer of {} bytes cannot hold a {HEADER_LEN} byte frame header",
                config.read_buffer_size
            )));
        }

        let socket = Arc::new(socket);
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (add_tx, add_rx) = mpsc::channel(1);
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        tokio::spawn(read_frames(socket.clone(), config.read_buffer_size, frame_tx, shutdown_tx.clone()));
        tokio::spawn(dispatch_events(frame_rx, add_rx, remove_rx, shutdown_tx.clone()));
        log::debug!("Started management connection");

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                socket,
                config,
                add_tx,
                remove_tx,
                shutdown_tx,
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Options of this connection.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.shutdown_tx.subscribe();
        wait_closed(&mut rx).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed());
        }
        Ok(())
    }

    /// Closes the connection.
    ///
    /// Pending commands fail with [ErrorKind::Closed] and event streams end.
    /// Closing an already closed connection succeeds.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Registers a listener.
    ///
    /// When this returns the listener will see every event received afterwards.
    pub async fn add_listener(&self, listener: impl Listener) -> Result<ListenerId> {
        let id = ListenerId::next();
        self.add_listener_with_id(id, Box::new(listener)).await?;
        Ok(id)
    }

    async fn add_listener_with_id(&self, id: ListenerId, listener: Box<dyn Listener>) -> Result<()> {
        self.ensure_open()?;
        let (ready_tx, ready_rx) = oneshot::channel();
        self.inner.add_tx.send(AddReq { id, listener, ready_tx }).await.map_err(|_| Error::closed())?;
        ready_rx.await.map_err(|_| Error::closed())
    }

    /// Removes a listener.
    ///
    /// Removing a listener that has already finished has no effect.
    pub fn remove_listener(&self, id: ListenerId) {
        let _ = self.inner.remove_tx.send(id);
    }

    /// Subscribes to events matching the filter.
    pub async fn events(&self, filter: EventFilter) -> Result<EventStream> {
        let (subscriber, rx) = EventSubscriber::new(filter);
        let id = self.add_listener(subscriber).await?;
        Ok(EventStream::new(id, rx, self.inner.remove_tx.clone()))
    }

    /// Sends a command and returns a handle for waiting on its result.
    ///
    /// The result listener is registered before the command is written.
    /// Commands sent this way bypass serialization by opcode.
    pub async fn send_command(&self, command: &Command) -> Result<PendingCommand> {
        let (listener, rx) = CommandListener::new(command);
        let id = ListenerId::next();
        self.add_listener_with_id(id, Box::new(listener)).await?;

        log::trace!("Sending {:?}", command);
        if let Err(err) = self.inner.socket.write_all(&command.encode()).await {
            self.remove_listener(id);
            return Err(err);
        }
        Ok(PendingCommand::new(id, command, rx, self.inner.remove_tx.clone()))
    }

    /// Sends a command to the controller with the specified index and waits for its result.
    ///
    /// Returns the return parameters of the command complete event, which are
    /// empty if the kernel answered with a command status event.
    /// A failure status is returned as [ErrorKind::Status] or [ErrorKind::UnknownStatus].
    /// If no result arrives within the configured command timeout, [ErrorKind::Timeout] is returned.
    /// The timeout includes the time spent waiting for an earlier command with
    /// the same opcode to the same controller.
    pub async fn run_command(&self, index: u16, opcode: impl Into<u16>, params: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let command = Command::new(opcode, index, params)?;
        let deadline = Instant::now() + self.inner.config.command_timeout;

        let _in_flight = timeout_at(deadline, self.lock_in_flight(&command))
            .await
            .map_err(|_| timed_out(command.opcode()))?;
        let pending =
            timeout_at(deadline, self.send_command(&command)).await.map_err(|_| timed_out(command.opcode()))??;
        pending.wait_until(deadline).await
    }

    async fn lock_in_flight(&self, command: &Command) -> Option<InFlight<'_>> {
        if !self.inner.config.serialize_opcodes {
            return None;
        }
        let key = (command.index(), command.opcode());
        let lock = self.inner.in_flight.lock().entry(key).or_default().clone();
        if lock.try_lock().is_err() {
            log::trace!("Waiting for {} on index {} in flight", opcode_name(command.opcode()), command.index());
        }
        let mut in_flight = InFlight { inner: &self.inner, key, lock: Some(lock.clone()), guard: None };
        in_flight.guard = Some(lock.lock_owned().await);
        Some(in_flight)
    }
}

/// Exclusive use of an (index, opcode) pair.
///
/// Prunes the lock from the in-flight map when nobody else uses it,
/// also when dropped while still waiting for the lock.
struct InFlight<'a> {
    inner: &'a ConnectionInner,
    key: (u16, u16),
    lock: Option<Arc<AsyncMutex<()>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.lock.take();
        let mut in_flight = self.inner.in_flight.lock();
        if in_flight.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            in_flight.remove(&self.key);
        }
    }
}

/// Reads frames from the socket until it fails or the connection is closed.
async fn read_frames(
    socket: Arc<Socket>, buffer_size: usize, frame_tx: mpsc::Sender<Vec<u8>>, shutdown_tx: Arc<watch::Sender<bool>>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut buf = vec![0; buffer_size];

    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) => {
                log::debug!("Management socket reached end of file");
                break;
            }
            Ok(n) => n,
            Err(err) if err.kind == ErrorKind::Closed => break,
            Err(err) => {
                log::warn!("Reading from management socket failed: {}", &err);
                break;
            }
        };

        let frame = buf[..n].to_vec();
        select! {
            res = frame_tx.send(frame) => {
                if res.is_err() {
                    break;
                }
            }
            () = wait_closed(&mut shutdown_rx) => break,
        }
    }

    let _ = socket.close();
    shutdown_tx.send_replace(true);
    log::trace!("Terminated management socket reader");
}

/// Dispatches received frames to listeners and applies registry changes.
///
/// Removals take precedence over additions, so an acknowledged addition
/// implies that all previously requested removals have been applied.
async fn dispatch_events(
    mut frame_rx: mpsc::Receiver<Vec<u8>>, mut add_rx: mpsc::Receiver<AddReq>,
    mut remove_rx: mpsc::UnboundedReceiver<ListenerId>, shutdown_tx: Arc<watch::Sender<bool>>,
) {
    log::trace!("Starting management event dispatcher");
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut listeners: BTreeMap<ListenerId, Box<dyn Listener>> = BTreeMap::new();

    loop {
        select! {
            biased;
            () = wait_closed(&mut shutdown_rx) => break,
            Some(id) = remove_rx.recv() => {
                if listeners.remove(&id).is_some() {
                    log::trace!("Removed listener {}", id);
                }
            }
            Some(AddReq { id, listener, ready_tx }) = add_rx.recv() => {
                log::trace!("Adding listener {}", id);
                listeners.insert(id, listener);
                let _ = ready_tx.send(());
            }
            Some(frame) = frame_rx.recv() => dispatch_frame(&mut listeners, &frame),
            else => break,
        }
    }

    frame_rx.close();
    let mut dropped = 0;
    while frame_rx.try_recv().is_ok() {
        dropped += 1;
    }
    log::trace!(
        "Terminated management event dispatcher with {} listeners and {} unprocessed frames",
        listeners.len(),
        dropped
    );
}

fn dispatch_frame(listeners: &mut BTreeMap<ListenerId, Box<dyn Listener>>, frame: &[u8]) {
    let event = match Event::decode(frame) {
        Ok(event) => event,
        Err(err) => {
            log::warn!("Skipping malformed management frame {}: {}", hex::encode(frame), &err);
            return;
        }
    };
    log::trace!("Event: {:?}", &event);

    let finished: Vec<ListenerId> = listeners
        .iter_mut()
        .filter_map(|(id, listener)| (listener.filter(&event) && listener.handle(&event)).then_some(*id))
        .collect();
    for id in finished {
        listeners.remove(&id);
        log::trace!("Listener {} finished", id);
    }
}
