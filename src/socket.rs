//! Management socket transport.

use libc::{AF_BLUETOOTH, MSG_NOSIGNAL};
use parking_lot::Mutex;
use std::{
    fmt,
    io::ErrorKind as IoErrorKind,
    os::fd::{FromRawFd, OwnedFd, RawFd},
    sync::Arc,
};
use strum::Display;
use tokio::{
    io::unix::AsyncFd,
    select,
    sync::{watch, Mutex as AsyncMutex},
};

use crate::{
    sock,
    sys::{sockaddr_hci, HCI_CHANNEL_CONTROL, HCI_DEV_NONE},
    Error, ErrorKind, Result,
};

/// Address of an HCI socket channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HciAddr {
    /// Device index or `0xffff` for none.
    pub dev: u16,
    /// Channel.
    pub channel: u16,
}

impl HciAddr {
    /// Control channel of the management interface, not bound to a device.
    pub const fn control() -> Self {
        Self { dev: HCI_DEV_NONE, channel: HCI_CHANNEL_CONTROL }
    }
}

impl From<HciAddr> for sockaddr_hci {
    fn from(addr: HciAddr) -> Self {
        sockaddr_hci { hci_family: AF_BLUETOOTH as _, hci_dev: addr.dev, hci_channel: addr.channel }
    }
}

/// Lifecycle state of a [Socket].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum SocketState {
    /// No descriptor has been opened yet.
    Disconnected,
    /// Descriptor is open but not bound.
    Connected,
    /// Bound to the control channel; reads and writes are possible.
    Bound,
    /// Closed; this is final.
    Closed,
}

enum Fd {
    Disconnected,
    Connected(Arc<AsyncFd<OwnedFd>>),
    Bound(Arc<AsyncFd<OwnedFd>>),
    Closed,
}

impl Fd {
    fn state(&self) -> SocketState {
        match self {
            Self::Disconnected => SocketState::Disconnected,
            Self::Connected(_) => SocketState::Connected,
            Self::Bound(_) => SocketState::Bound,
            Self::Closed => SocketState::Closed,
        }
    }
}

/// Raw Bluetooth socket bound to the management control channel.
///
/// Reads and writes are guarded by separate locks, so a pending read never
/// delays a write. Closing the socket wakes all pending reads and writes.
pub struct Socket {
    fd: Mutex<Fd>,
    read_lock: AsyncMutex<()>,
    write_lock: AsyncMutex<()>,
    closed_tx: watch::Sender<bool>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Socket {{ state: {} }}", self.state())
    }
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    /// Creates a socket in the disconnected state.
    pub fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            fd: Mutex::new(Fd::Disconnected),
            read_lock: AsyncMutex::new(()),
            write_lock: AsyncMutex::new(()),
            closed_tx,
        }
    }

    /// Opens a socket and binds it to the management control channel.
    ///
    /// Must be called from a Tokio runtime.
    pub fn open() -> Result<Self> {
        let socket = Self::new();
        socket.connect()?;
        if let Err(err) = socket.bind() {
            let _ = socket.close();
            return Err(err);
        }
        Ok(socket)
    }

    /// Constructs a bound socket from the specified raw file descriptor.
    ///
    /// The descriptor must be a message oriented socket in non-blocking mode.
    /// Must be called from a Tokio runtime.
    ///
    /// # Safety
    /// If the passed file descriptor is invalid, undefined behavior may occur.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        let fd = AsyncFd::new(OwnedFd::from_raw_fd(fd))?;
        let socket = Self::new();
        *socket.fd.lock() = Fd::Bound(Arc::new(fd));
        Ok(socket)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.fd.lock().state()
    }

    /// Opens the raw Bluetooth HCI socket.
    ///
    /// Must be called from a Tokio runtime.
    pub fn connect(&self) -> Result<()> {
        let mut fd = self.fd.lock();
        match &*fd {
            Fd::Disconnected => (),
            Fd::Closed => return Err(Error::closed()),
            _ => return Err(Error::with_message(ErrorKind::SocketOpen, "socket is already open")),
        }

        let socket = sock::hci_socket()
            .map_err(|err| Error::with_message(ErrorKind::SocketOpen, err.to_string()))?;
        let socket =
            AsyncFd::new(socket).map_err(|err| Error::with_message(ErrorKind::SocketOpen, err.to_string()))?;
        *fd = Fd::Connected(Arc::new(socket));
        log::debug!("Opened management socket");
        Ok(())
    }

    /// Binds the socket to the management control channel.
    pub fn bind(&self) -> Result<()> {
        let mut fd = self.fd.lock();
        let socket = match &*fd {
            Fd::Connected(socket) => socket.clone(),
            Fd::Closed => return Err(Error::closed()),
            _ => return Err(Error::with_message(ErrorKind::SocketBind, format!("socket is {}", fd.state()))),
        };

        sock::bind(socket.get_ref(), &HciAddr::control().into())
            .map_err(|err| Error::with_message(ErrorKind::SocketBind, err.to_string()))?;
        *fd = Fd::Bound(socket);
        log::debug!("Bound management socket to control channel");
        Ok(())
    }

    fn bound(&self) -> Result<Arc<AsyncFd<OwnedFd>>> {
        match &*self.fd.lock() {
            Fd::Bound(socket) => Ok(socket.clone()),
            Fd::Closed => Err(Error::closed()),
            other => Err(Error::with_message(ErrorKind::NotConnected, format!("socket is {}", other.state()))),
        }
    }

    /// Receives one frame into the buffer and returns its length.
    ///
    /// Frames longer than the buffer are truncated.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let _guard = self.read_lock.lock().await;
        let socket = self.bound()?;
        let mut closed_rx = self.closed_tx.subscribe();

        loop {
            select! {
                res = socket.readable() => {
                    let mut guard = res?;
                    match guard.try_io(|inner| sock::recv(inner.get_ref(), &mut *buf, 0)) {
                        Ok(result) => return Ok(result?),
                        Err(_would_block) => continue,
                    }
                }
                () = wait_closed(&mut closed_rx) => return Err(Error::closed()),
            }
        }
    }

    /// Sends the buffer and returns how many bytes were written.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let socket = self.bound()?;
        self.send(&socket, buf).await
    }

    /// Sends the whole buffer, retrying after partial writes.
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let socket = self.bound()?;
        while !buf.is_empty() {
            match self.send(&socket, buf).await? {
                0 => return Err(std::io::Error::from(IoErrorKind::WriteZero).into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    async fn send(&self, socket: &AsyncFd<OwnedFd>, buf: &[u8]) -> Result<usize> {
        let mut closed_rx = self.closed_tx.subscribe();
        loop {
            select! {
                res = socket.writable() => {
                    let mut guard = res?;
                    match guard.try_io(|inner| sock::send(inner.get_ref(), buf, MSG_NOSIGNAL)) {
                        Ok(result) => return Ok(result?),
                        Err(_would_block) => continue,
                    }
                }
                () = wait_closed(&mut closed_rx) => return Err(Error::closed()),
            }
        }
    }

    /// Closes the socket.
    ///
    /// Pending reads and writes fail with [ErrorKind::Closed].
    /// Closing an already closed socket succeeds.
    pub fn close(&self) -> Result<()> {
        let prev = std::mem::replace(&mut *self.fd.lock(), Fd::Closed);
        self.closed_tx.send_replace(true);
        match prev {
            Fd::Connected(_) | Fd::Bound(_) => log::debug!("Closed management socket"),
            Fd::Disconnected => log::trace!("Closed management socket that was never opened"),
            Fd::Closed => (),
        }
        Ok(())
    }
}

/// Completes once the watched flag becomes true or its sender is gone.
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}
