//! Command status codes.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use strum::IntoStaticStr;

use crate::{Error, ErrorKind, Result};

/// Status of a management command as reported by the kernel.
#[derive(
    Clone,
    Copy,
    Debug,
    displaydoc::Display,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoStaticStr,
    FromPrimitive,
    ToPrimitive,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Status {
    /// success
    Success = 0x00,
    /// unknown command
    UnknownCommand = 0x01,
    /// not connected
    NotConnected = 0x02,
    /// failed
    Failed = 0x03,
    /// connect failed
    ConnectFailed = 0x04,
    /// authentication failed
    AuthenticationFailed = 0x05,
    /// not paired
    NotPaired = 0x06,
    /// no resources
    NoResources = 0x07,
    /// timeout
    Timeout = 0x08,
    /// already connected
    AlreadyConnected = 0x09,
    /// busy
    Busy = 0x0a,
    /// rejected
    Rejected = 0x0b,
    /// not supported
    NotSupported = 0x0c,
    /// invalid parameters
    InvalidParameters = 0x0d,
    /// disconnected
    Disconnected = 0x0e,
    /// not powered
    NotPowered = 0x0f,
    /// cancelled
    Cancelled = 0x10,
    /// invalid index
    InvalidIndex = 0x11,
    /// blocked through rfkill
    RfKilled = 0x12,
    /// already paired
    AlreadyPaired = 0x13,
    /// permission denied
    PermissionDenied = 0x14,
}

impl Status {
    /// Decodes a wire status byte.
    ///
    /// Returns `None` for codes this library does not know.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::from_u8(code)
    }

    /// Wire status byte.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether this is [Status::Success].
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Converts the status into a result, mapping every status except success to an error.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Success => Ok(()),
            status => Err(Error::new(ErrorKind::Status(status))),
        }
    }
}

/// Maps a wire status byte to a result.
///
/// Unknown codes produce [ErrorKind::UnknownStatus] instead of a decoding failure.
pub(crate) fn check_status(code: u8) -> Result<()> {
    match Status::from_code(code) {
        Some(status) => status.into_result(),
        None => Err(Error::new(ErrorKind::UnknownStatus(code))),
    }
}
