//! Management events and frame decoding.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::fmt;
use strum::{Display, EnumString};

use crate::{
    command::{check_payload_len, encode_frame, opcode_name, HEADER_LEN},
    status::check_status,
    ControllerSettings, Error, Result, INDEX_NONE,
};

/// Management event code.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString, FromPrimitive, ToPrimitive,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum EventCode {
    CommandComplete = 0x0001,
    CommandStatus = 0x0002,
    ControllerError = 0x0003,
    IndexAdded = 0x0004,
    IndexRemoved = 0x0005,
    NewSettings = 0x0006,
    ClassOfDeviceChanged = 0x0007,
    LocalNameChanged = 0x0008,
    NewLinkKey = 0x0009,
    NewLongTermKey = 0x000a,
    DeviceConnected = 0x000b,
    DeviceDisconnected = 0x000c,
    ConnectFailed = 0x000d,
    PinCodeRequest = 0x000e,
    UserConfirmationRequest = 0x000f,
    UserPasskeyRequest = 0x0010,
    AuthenticationFailed = 0x0011,
    DeviceFound = 0x0012,
    Discovering = 0x0013,
    DeviceBlocked = 0x0014,
    DeviceUnblocked = 0x0015,
    DeviceUnpaired = 0x0016,
    PasskeyNotify = 0x0017,
    NewIdentityResolvingKey = 0x0018,
    NewSignatureResolvingKey = 0x0019,
    DeviceAdded = 0x001a,
    DeviceRemoved = 0x001b,
    NewConnectionParameter = 0x001c,
    UnconfiguredIndexAdded = 0x001d,
    UnconfiguredIndexRemoved = 0x001e,
    NewConfigurationOptions = 0x001f,
    ExtendedIndexAdded = 0x0020,
    ExtendedIndexRemoved = 0x0021,
    LocalOobExtendedDataUpdated = 0x0022,
    AdvertisingAdded = 0x0023,
    AdvertisingRemoved = 0x0024,
    ExtendedControllerInfoChanged = 0x0025,
    PhyConfigurationChanged = 0x0026,
}

impl EventCode {
    /// Looks up a raw event code in the catalog.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::from_u16(code)
    }

    /// Raw event code value.
    pub const fn code(self) -> u16 {
        self as u16
    }
}

impl From<EventCode> for u16 {
    fn from(code: EventCode) -> Self {
        code.code()
    }
}

/// Management event received from the kernel.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Event {
    code: u16,
    index: u16,
    payload: Vec<u8>,
}

impl Event {
    /// Creates an event.
    ///
    /// Fails if the payload does not fit into a frame.
    pub fn new(code: impl Into<u16>, index: u16, payload: impl Into<Vec<u8>>) -> Result<Self> {
        let payload = payload.into();
        check_payload_len(payload.len())?;
        Ok(Self { code: code.into(), index, payload })
    }

    /// Decodes an event from a received frame.
    ///
    /// Bytes following the declared payload are ignored.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(Error::invalid_format(format!(
                "frame of {} bytes is shorter than the {HEADER_LEN} byte header",
                frame.len()
            )));
        }
        let code = u16::from_le_bytes([frame[0], frame[1]]);
        let index = u16::from_le_bytes([frame[2], frame[3]]);
        let param_len = u16::from_le_bytes([frame[4], frame[5]]) as usize;
        let payload = frame.get(HEADER_LEN..HEADER_LEN + param_len).ok_or_else(|| {
            Error::invalid_format(format!(
                "declared payload length {param_len} exceeds available {} bytes",
                frame.len() - HEADER_LEN
            ))
        })?;
        Ok(Self { code, index, payload: payload.to_vec() })
    }

    /// Encodes the event into a frame.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.code, self.index, &self.payload)
    }

    /// Raw event code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Event code, if it is in the catalog.
    pub fn event_code(&self) -> Option<EventCode> {
        EventCode::from_code(self.code)
    }

    /// Index of the controller that generated the event.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Event parameters.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Parameter length.
    pub fn param_len(&self) -> u16 {
        self.payload.len() as u16
    }

    /// Whether this is a command status or command complete event.
    pub fn is_command_result(&self) -> bool {
        matches!(self.event_code(), Some(EventCode::CommandComplete | EventCode::CommandStatus))
    }

    /// Parses the payload of a [EventCode::NewSettings] event.
    pub fn new_settings(&self) -> Result<ControllerSettings> {
        if self.event_code() != Some(EventCode::NewSettings) {
            return Err(Error::invalid_format(format!("event {:#06x} is not a new settings event", self.code)));
        }
        if self.payload.len() != 4 {
            return Err(Error::invalid_format(format!(
                "new settings payload has {} bytes instead of 4",
                self.payload.len()
            )));
        }
        ControllerSettings::from_le_bytes(&self.payload)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self.event_code() {
            Some(code) => format!("{code} ({:#06x})", self.code),
            None => format!("{:#06x}", self.code),
        };
        let index = if self.index == INDEX_NONE { "none".to_string() } else { self.index.to_string() };
        write!(f, "Event {{ code: {}, index: {}, payload: {} }}", code, index, hex::encode(&self.payload))
    }
}

/// Payload of a command status event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandStatus {
    /// Opcode of the command this status belongs to.
    pub opcode: u16,
    /// Raw status byte.
    pub status: u8,
}

impl CommandStatus {
    /// Maps the status byte to a result.
    pub fn result(&self) -> Result<()> {
        check_status(self.status)
    }
}

/// Payload of a command complete event.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandComplete<'a> {
    /// Opcode of the completed command.
    pub opcode: u16,
    /// Raw status byte.
    pub status: u8,
    /// Return parameters; may be empty.
    pub result: &'a [u8],
}

impl CommandComplete<'_> {
    /// Maps the status byte to a result carrying the return parameters.
    pub fn result(&self) -> Result<Vec<u8>> {
        check_status(self.status)?;
        Ok(self.result.to_vec())
    }
}

impl fmt::Debug for CommandComplete<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandComplete {{ opcode: {}, status: {:#04x}, result: {} }}",
            opcode_name(self.opcode),
            self.status,
            hex::encode(self.result)
        )
    }
}

/// Parses the payload of a command status event.
///
/// The payload must be exactly 3 bytes long.
pub fn parse_command_status(payload: &[u8]) -> Result<CommandStatus> {
    match payload {
        &[op0, op1, status] => Ok(CommandStatus { opcode: u16::from_le_bytes([op0, op1]), status }),
        _ => Err(Error::invalid_format(format!(
            "command status payload has {} bytes instead of 3",
            payload.len()
        ))),
    }
}

/// Parses the payload of a command complete event.
///
/// The payload must be at least 3 bytes long.
pub fn parse_command_complete(payload: &[u8]) -> Result<CommandComplete<'_>> {
    match payload {
        &[op0, op1, status, ref result @ ..] => {
            Ok(CommandComplete { opcode: u16::from_le_bytes([op0, op1]), status, result })
        }
        _ => Err(Error::invalid_format(format!(
            "command complete payload has {} bytes, at least 3 required",
            payload.len()
        ))),
    }
}
