#![cfg_attr(docsrs, feature(doc_cfg))]

//! # bluemgmt: Asynchronous Bluetooth Management Socket Client
//!
//! This library talks directly to the Bluetooth subsystem of the Linux kernel over the
//! [Bluetooth Management API] control socket.
//! No Bluetooth daemon is required; the process needs the `CAP_NET_ADMIN` capability
//! for commands that change controller state.
//!
//! This library depends on the [tokio] asynchronous runtime.
//!
//! The following functionality is provided.
//!
//! * [management socket transport](Socket)
//!     * opening and binding to the control channel of all controllers
//!     * async reads and writes that are aborted when the socket is closed
//! * [management connection](Connection)
//!     * [sending commands](Connection::run_command) and waiting for their correlated results
//!     * [command status taxonomy](Status)
//!     * [event subscriptions](Connection::events) with code and controller index filters
//!     * [custom listeners](Listener)
//! * [typed controller operations](Controller)
//!     * reading version, supported commands, controller list and controller information
//!     * changing power, discoverability, connectability, name, class and more
//!     * [current settings](ControllerSettings) decoding
//! * [automatic reconnection](Supervisor) with exponential backoff
//!
//! ## Crate features
//! The following crate features are available.
//!
//! * `serde`: Enables serialization and deserialization of some data types.
//!
//! ## Basic usage
//! Create a [Connection] using [Connection::new]; this opens and binds the management socket
//! and starts the event dispatcher.
//! Then obtain a controller handle using [Connection::controller].
//! From there on you can access most of the functionality using the methods provided by [Controller].
//!
//! Raw commands can be sent using [Connection::run_command].
//!
//! [Bluetooth Management API]: https://git.kernel.org/pub/scm/bluetooth/bluez.git/tree/doc/mgmt-api.txt

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("bluemgmt only supports the Linux operating system.");

use std::fmt;
use strum::EnumString;
use tokio::task::JoinError;

mod address;
mod command;
mod config;
mod connection;
mod controller;
mod event;
mod listener;
mod settings;
mod sock;
mod socket;
mod status;
mod supervisor;
#[allow(non_camel_case_types)]
mod sys;

pub use crate::{
    address::*, command::*, config::*, connection::*, controller::*, event::*, listener::*, settings::*, socket::*,
    status::*, supervisor::*,
};

#[doc(no_inline)]
pub use uuid::Uuid;

/// Controller index addressing no specific controller.
///
/// Used for commands and events that concern the management interface as a whole.
pub const INDEX_NONE: u16 = sys::HCI_DEV_NONE;

/// Bluetooth management error.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message.
    pub message: String,
}

/// Bluetooth management error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash, EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum ErrorKind {
    /// opening the management socket failed
    SocketOpen,
    /// binding the management socket to the control channel failed
    SocketBind,
    /// management socket is not bound
    NotConnected,
    /// management connection has been closed
    Closed,
    /// command reached timeout
    Timeout,
    /// invalid management frame or payload
    InvalidFormat,
    /// command failed with status: {0}
    #[strum(disabled)]
    Status(Status),
    /// command failed with unknown status {0:#04x}
    #[strum(disabled)]
    UnknownStatus(u8),
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal Bluetooth management error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// join error
    JoinError,
    /// IO error {0:?}
    // The error kind is not preserved during serialization.
    #[cfg_attr(feature = "serde", serde(with = "io_errorkind_serde"))]
    Io(std::io::ErrorKind),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub(crate) fn closed() -> Self {
        Self::new(ErrorKind::Closed)
    }

    pub(crate) fn invalid_format(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::InvalidFormat, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::JoinError), message: err.to_string() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::Io(err.kind())), message: err.to_string() }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind as E;
        let kind = match err.kind {
            ErrorKind::SocketOpen => E::Other,
            ErrorKind::SocketBind => E::AddrNotAvailable,
            ErrorKind::NotConnected => E::NotConnected,
            ErrorKind::Closed => E::BrokenPipe,
            ErrorKind::Timeout => E::TimedOut,
            ErrorKind::InvalidFormat => E::InvalidData,
            ErrorKind::Status(Status::PermissionDenied) => E::PermissionDenied,
            ErrorKind::Status(Status::InvalidParameters) => E::InvalidInput,
            ErrorKind::Status(Status::NotSupported) => E::Unsupported,
            ErrorKind::Status(_) => E::Other,
            ErrorKind::UnknownStatus(_) => E::Other,
            ErrorKind::Internal(InternalErrorKind::Io(err)) => err,
            ErrorKind::Internal(_) => E::Other,
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(feature = "serde")]
mod io_errorkind_serde {
    pub fn serialize<S>(_kind: &std::io::ErrorKind, ser: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::Serialize;
        ().serialize(ser)
    }

    pub fn deserialize<'de, D>(deser: D) -> Result<std::io::ErrorKind, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::Deserialize;
        <()>::deserialize(deser)?;
        Ok(std::io::ErrorKind::Other)
    }
}

/// Bluetooth management result.
pub type Result<T> = std::result::Result<T, Error>;
