//! Management commands and frame encoding.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::fmt;
use strum::{Display, EnumString};

use crate::{Error, Result, INDEX_NONE};

/// Length of the frame header shared by commands and events.
pub const HEADER_LEN: usize = 6;

/// Maximum length of a frame payload.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Management command opcode.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString, FromPrimitive, ToPrimitive,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum Opcode {
    ReadVersion = 0x0001,
    ReadSupportedCommands = 0x0002,
    ReadControllerIndexList = 0x0003,
    ReadControllerInfo = 0x0004,
    SetPowered = 0x0005,
    SetDiscoverable = 0x0006,
    SetConnectable = 0x0007,
    SetFastConnectable = 0x0008,
    SetBondable = 0x0009,
    SetLinkSecurity = 0x000a,
    SetSecureSimplePairing = 0x000b,
    SetHighSpeed = 0x000c,
    SetLowEnergy = 0x000d,
    SetDeviceClass = 0x000e,
    SetLocalName = 0x000f,
    AddUuid = 0x0010,
    RemoveUuid = 0x0011,
    LoadLinkKeys = 0x0012,
    LoadLongTermKeys = 0x0013,
    Disconnect = 0x0014,
    GetConnections = 0x0015,
    PinCodeReply = 0x0016,
    PinCodeNegativeReply = 0x0017,
    SetIoCapability = 0x0018,
    PairDevice = 0x0019,
    CancelPairDevice = 0x001a,
    UnpairDevice = 0x001b,
    UserConfirmationReply = 0x001c,
    UserConfirmationNegativeReply = 0x001d,
    UserPasskeyReply = 0x001e,
    UserPasskeyNegativeReply = 0x001f,
    ReadLocalOobData = 0x0020,
    AddRemoteOobData = 0x0021,
    RemoveRemoteOobData = 0x0022,
    StartDiscovery = 0x0023,
    StopDiscovery = 0x0024,
    ConfirmName = 0x0025,
    BlockDevice = 0x0026,
    UnblockDevice = 0x0027,
    SetDeviceId = 0x0028,
    SetAdvertising = 0x0029,
    SetBrEdr = 0x002a,
    SetStaticAddress = 0x002b,
    SetPhyConfiguration = 0x0044,
}

impl Opcode {
    /// Looks up a raw opcode in the catalog.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::from_u16(code)
    }

    /// Raw opcode value.
    pub const fn code(self) -> u16 {
        self as u16
    }
}

impl From<Opcode> for u16 {
    fn from(opcode: Opcode) -> Self {
        opcode.code()
    }
}

/// Formats a raw opcode with its catalog name, if any.
pub(crate) fn opcode_name(code: u16) -> String {
    match Opcode::from_code(code) {
        Some(opcode) => format!("{opcode} ({code:#06x})"),
        None => format!("{code:#06x}"),
    }
}

/// Encodes a frame header followed by the payload.
///
/// The payload length must already have been checked against [MAX_PAYLOAD_LEN].
pub(crate) fn encode_frame(code: u16, index: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&code.to_le_bytes());
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn check_payload_len(len: usize) -> Result<()> {
    if len > MAX_PAYLOAD_LEN {
        return Err(Error::invalid_format(format!(
            "payload of {len} bytes exceeds maximum of {MAX_PAYLOAD_LEN} bytes"
        )));
    }
    Ok(())
}

/// Management command.
///
/// The parameter length is derived from the payload when encoding.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Command {
    opcode: u16,
    index: u16,
    payload: Vec<u8>,
}

impl Command {
    /// Creates a command for the controller with the specified index.
    ///
    /// Use [INDEX_NONE] for commands that do not address a controller.
    /// Fails if the payload is longer than [MAX_PAYLOAD_LEN].
    pub fn new(opcode: impl Into<u16>, index: u16, payload: impl Into<Vec<u8>>) -> Result<Self> {
        let payload = payload.into();
        check_payload_len(payload.len())?;
        Ok(Self { opcode: opcode.into(), index, payload })
    }

    /// Raw opcode.
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    /// Controller index.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Command parameters.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Parameter length as sent in the frame header.
    pub fn param_len(&self) -> u16 {
        self.payload.len() as u16
    }

    /// Encodes the command into a frame.
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.opcode, self.index, &self.payload)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = if self.index == INDEX_NONE { "none".to_string() } else { self.index.to_string() };
        write!(
            f,
            "Command {{ opcode: {}, index: {}, payload: {} }}",
            opcode_name(self.opcode),
            index,
            hex::encode(&self.payload)
        )
    }
}
