//! Typed controller operations.

use std::fmt;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{
    Address, Connection, ControllerSettings, Error, EventFilter, EventStream, Opcode, Result, INDEX_NONE,
};

/// Length of the name field in management commands, including the terminating zero.
pub const NAME_LEN: usize = 249;

/// Length of the short name field in management commands, including the terminating zero.
pub const SHORT_NAME_LEN: usize = 11;

/// Sequential reader over command return parameters.
struct Params<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Params<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::invalid_format(format!(
                "{} result is too short: {} more bytes needed, {} available",
                self.what,
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut a = [0; N];
        a.copy_from_slice(self.bytes(N)?);
        Ok(a)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u24(&mut self) -> Result<u32> {
        let [b0, b1, b2] = self.array::<3>()?;
        Ok(u32::from_le_bytes([b0, b1, b2, 0]))
    }

    fn settings(&mut self) -> Result<ControllerSettings> {
        ControllerSettings::from_le_bytes(self.bytes(4)?)
    }

    fn string(&mut self, len: usize) -> Result<String> {
        let raw = self.bytes(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    fn u16_list(&mut self, count: usize) -> Result<Vec<u16>> {
        (0..count).map(|_| self.u16()).collect()
    }
}

/// Version of the management interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Version {
    /// Major version.
    pub version: u8,
    /// Revision.
    pub revision: u16,
}

impl Version {
    fn parse(buf: &[u8]) -> Result<Self> {
        let mut p = Params::new(buf, "read version");
        Ok(Self { version: p.u8()?, revision: p.u16()? })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.version, self.revision)
    }
}

/// Commands and events supported by the management interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SupportedCommands {
    /// Raw opcodes of supported commands.
    pub commands: Vec<u16>,
    /// Raw codes of supported events.
    pub events: Vec<u16>,
}

impl SupportedCommands {
    fn parse(buf: &[u8]) -> Result<Self> {
        let mut p = Params::new(buf, "read supported commands");
        let num_commands = p.u16()? as usize;
        let num_events = p.u16()? as usize;
        Ok(Self { commands: p.u16_list(num_commands)?, events: p.u16_list(num_events)? })
    }

    /// Whether the specified command is supported.
    pub fn supports(&self, opcode: impl Into<u16>) -> bool {
        self.commands.contains(&opcode.into())
    }
}

fn parse_index_list(buf: &[u8]) -> Result<Vec<u16>> {
    let mut p = Params::new(buf, "read controller index list");
    let count = p.u16()? as usize;
    p.u16_list(count)
}

/// Information about a Bluetooth controller.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControllerInfo {
    /// Public address.
    pub address: Address,
    /// Bluetooth core specification version.
    pub bluetooth_version: u8,
    /// Manufacturer id.
    pub manufacturer: u16,
    /// Settings the controller supports.
    pub supported_settings: ControllerSettings,
    /// Settings currently in effect.
    pub current_settings: ControllerSettings,
    /// Class of device.
    pub class_of_device: u32,
    /// Local name.
    pub name: String,
    /// Short local name.
    pub short_name: String,
}

impl ControllerInfo {
    fn parse(buf: &[u8]) -> Result<Self> {
        let mut p = Params::new(buf, "read controller information");
        Ok(Self {
            address: Address::from_wire(p.array()?),
            bluetooth_version: p.u8()?,
            manufacturer: p.u16()?,
            supported_settings: p.settings()?,
            current_settings: p.settings()?,
            class_of_device: p.u24()?,
            name: p.string(NAME_LEN)?,
            short_name: p.string(SHORT_NAME_LEN)?,
        })
    }
}

/// Discoverable mode of a controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Discoverable {
    /// Not discoverable.
    #[default]
    #[strum(serialize = "off")]
    Disabled = 0x00,
    /// General discoverable.
    #[strum(serialize = "general")]
    General = 0x01,
    /// Limited discoverable.
    #[strum(serialize = "limited")]
    Limited = 0x02,
}

fn name_field(name: &str, len: usize, what: &str) -> Result<Vec<u8>> {
    if name.len() >= len {
        return Err(Error::invalid_format(format!("{what} {name:?} is longer than {} bytes", len - 1)));
    }
    let mut field = name.as_bytes().to_vec();
    field.resize(len, 0);
    Ok(field)
}

fn uuid_le_bytes(uuid: Uuid) -> [u8; 16] {
    let mut bytes = *uuid.as_bytes();
    bytes.reverse();
    bytes
}

impl Connection {
    /// Reads the version of the management interface.
    pub async fn read_version(&self) -> Result<Version> {
        Version::parse(&self.run_command(INDEX_NONE, Opcode::ReadVersion, &[]).await?)
    }

    /// Reads the commands and events supported by the management interface.
    pub async fn read_supported_commands(&self) -> Result<SupportedCommands> {
        SupportedCommands::parse(&self.run_command(INDEX_NONE, Opcode::ReadSupportedCommands, &[]).await?)
    }

    /// Reads the indices of all configured controllers.
    pub async fn read_controller_index_list(&self) -> Result<Vec<u16>> {
        parse_index_list(&self.run_command(INDEX_NONE, Opcode::ReadControllerIndexList, &[]).await?)
    }

    /// Handle to the controller with the specified index.
    ///
    /// The controller is not checked for existence.
    pub fn controller(&self, index: u16) -> Controller {
        Controller { connection: self.clone(), index }
    }

    /// Handles to all configured controllers.
    pub async fn controllers(&self) -> Result<Vec<Controller>> {
        Ok(self.read_controller_index_list().await?.into_iter().map(|index| self.controller(index)).collect())
    }
}

macro_rules! mode_setters {
    ($(
        $(#[$outer:meta])*
        $name:ident => $opcode:ident,
    )*) => {
        $(
            $(#[$outer])*
            ///
            /// Returns the settings in effect afterwards.
            pub async fn $name(&self, enabled: bool) -> Result<ControllerSettings> {
                self.set_mode(Opcode::$opcode, enabled).await
            }
        )*
    };
}

/// Bluetooth controller.
///
/// All operations are sent over the [Connection] this handle was obtained from.
#[derive(Clone)]
pub struct Controller {
    connection: Connection,
    index: u16,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Controller {{ index: {} }}", self.index)
    }
}

impl Controller {
    /// Controller index.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Connection used by this controller handle.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    async fn run(&self, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>> {
        self.connection.run_command(self.index, opcode, params).await
    }

    async fn set_mode(&self, opcode: Opcode, enabled: bool) -> Result<ControllerSettings> {
        let res = self.run(opcode, &[enabled as u8]).await?;
        Params::new(&res, "set mode").settings()
    }

    /// Reads information about the controller.
    pub async fn info(&self) -> Result<ControllerInfo> {
        ControllerInfo::parse(&self.run(Opcode::ReadControllerInfo, &[]).await?)
    }

    /// Reads the settings currently in effect.
    pub async fn settings(&self) -> Result<ControllerSettings> {
        Ok(self.info().await?.current_settings)
    }

    mode_setters! {
        /// Powers the controller on or off.
        set_powered => SetPowered,
        /// Sets whether the controller accepts incoming connections.
        set_connectable => SetConnectable,
        /// Sets whether page scan uses fast intervals.
        set_fast_connectable => SetFastConnectable,
        /// Sets whether the controller accepts pairing requests.
        set_bondable => SetBondable,
        /// Enables or disables link level security.
        set_link_security => SetLinkSecurity,
        /// Enables or disables Secure Simple Pairing.
        set_secure_simple_pairing => SetSecureSimplePairing,
        /// Enables or disables high speed support.
        set_high_speed => SetHighSpeed,
        /// Enables or disables Bluetooth Low Energy.
        set_low_energy => SetLowEnergy,
        /// Enables or disables LE advertising.
        set_advertising => SetAdvertising,
        /// Enables or disables classic Bluetooth (BR/EDR).
        set_br_edr => SetBrEdr,
    }

    /// Sets the discoverable mode.
    ///
    /// `timeout` is in seconds; zero means no timeout.
    /// Limited discoverable mode requires a timeout.
    pub async fn set_discoverable(&self, mode: Discoverable, timeout: u16) -> Result<ControllerSettings> {
        let mut params = vec![mode as u8];
        params.extend_from_slice(&timeout.to_le_bytes());
        let res = self.run(Opcode::SetDiscoverable, &params).await?;
        Params::new(&res, "set discoverable").settings()
    }

    /// Sets the major and minor device class and returns the resulting class of device.
    pub async fn set_device_class(&self, major: u8, minor: u8) -> Result<u32> {
        let res = self.run(Opcode::SetDeviceClass, &[major, minor]).await?;
        Params::new(&res, "set device class").u24()
    }

    /// Sets the local name and short name.
    ///
    /// The name can have at most 248 bytes and the short name at most 10 bytes.
    pub async fn set_local_name(&self, name: &str, short_name: &str) -> Result<()> {
        let mut params = name_field(name, NAME_LEN, "name")?;
        params.extend(name_field(short_name, SHORT_NAME_LEN, "short name")?);
        let res = self.run(Opcode::SetLocalName, &params).await?;
        if !res.is_empty() {
            let mut p = Params::new(&res, "set local name");
            let (name, short_name) = (p.string(NAME_LEN)?, p.string(SHORT_NAME_LEN)?);
            log::debug!("Controller {} is now named {:?} ({:?})", self.index, name, short_name);
        }
        Ok(())
    }

    /// Adds a service UUID to the EIR data and returns the resulting class of device.
    ///
    /// `svc_hint` contains the service class bits for the class of device.
    pub async fn add_uuid(&self, uuid: Uuid, svc_hint: u8) -> Result<u32> {
        let mut params = uuid_le_bytes(uuid).to_vec();
        params.push(svc_hint);
        let res = self.run(Opcode::AddUuid, &params).await?;
        Params::new(&res, "add UUID").u24()
    }

    /// Removes a service UUID from the EIR data and returns the resulting class of device.
    ///
    /// The nil UUID removes all UUIDs.
    pub async fn remove_uuid(&self, uuid: Uuid) -> Result<u32> {
        let res = self.run(Opcode::RemoveUuid, &uuid_le_bytes(uuid)).await?;
        Params::new(&res, "remove UUID").u24()
    }

    /// Stream of all events generated by this controller.
    pub async fn events(&self) -> Result<EventStream> {
        self.connection.events(EventFilter::all().index(self.index)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn version() {
        let v = Version::parse(&[0x01, 0x16, 0x00]).unwrap();
        assert_eq!(v, Version { version: 1, revision: 22 });
        assert_eq!(v.to_string(), "1.22");
        assert_eq!(Version::parse(&[0x01, 0x16]).unwrap_err().kind, ErrorKind::InvalidFormat);
    }

    #[test]
    fn supported_commands() {
        let buf = [0x02, 0x00, 0x01, 0x00, 0x01, 0x00, 0x05, 0x00, 0x06, 0x00];
        let sc = SupportedCommands::parse(&buf).unwrap();
        assert_eq!(sc.commands, vec![0x01, 0x05]);
        assert_eq!(sc.events, vec![0x06]);
        assert!(sc.supports(Opcode::SetPowered));
        assert!(!sc.supports(Opcode::SetBondable));
        assert!(SupportedCommands::parse(&buf[..8]).is_err());
    }

    #[test]
    fn index_list() {
        assert_eq!(parse_index_list(&[0x02, 0x00, 0x00, 0x00, 0x01, 0x00]).unwrap(), vec![0, 1]);
        assert_eq!(parse_index_list(&[0x00, 0x00]).unwrap(), Vec::<u16>::new());
        assert!(parse_index_list(&[0x03, 0x00, 0x00, 0x00]).is_err());
        assert!(parse_index_list(&[]).is_err());
    }

    fn info_payload() -> Vec<u8> {
        let mut buf = vec![0x66, 0x55, 0x44, 0x33, 0x22, 0x11];
        buf.push(0x09);
        buf.extend_from_slice(&0x000fu16.to_le_bytes());
        buf.extend_from_slice(&0xffffu32.to_le_bytes());
        buf.extend_from_slice(&0x0281u32.to_le_bytes());
        buf.extend_from_slice(&[0x0c, 0x01, 0x1c]);
        buf.extend(name_field("hci test", NAME_LEN, "name").unwrap());
        buf.extend(name_field("test", SHORT_NAME_LEN, "short name").unwrap());
        buf
    }

    #[test]
    fn controller_info() {
        let info = ControllerInfo::parse(&info_payload()).unwrap();
        assert_eq!(info.address.to_string(), "11:22:33:44:55:66");
        assert_eq!(info.bluetooth_version, 9);
        assert_eq!(info.manufacturer, 15);
        assert_eq!(info.supported_settings, ControllerSettings::from_bits(0xffff));
        assert!(info.current_settings.powered && info.current_settings.br_edr && info.current_settings.low_energy);
        assert!(!info.current_settings.connectable);
        assert_eq!(info.class_of_device, 0x1c010c);
        assert_eq!(info.name, "hci test");
        assert_eq!(info.short_name, "test");
    }

    #[test]
    fn short_controller_info() {
        let buf = info_payload();
        for len in [0, 6, 20, 279] {
            assert_eq!(ControllerInfo::parse(&buf[..len]).unwrap_err().kind, ErrorKind::InvalidFormat);
        }
    }

    #[test]
    fn name_fields() {
        let field = name_field("abc", SHORT_NAME_LEN, "short name").unwrap();
        assert_eq!(field.len(), SHORT_NAME_LEN);
        assert_eq!(&field[..4], b"abc\0");
        assert!(name_field("0123456789", SHORT_NAME_LEN, "short name").is_ok());
        assert!(name_field("0123456789a", SHORT_NAME_LEN, "short name").is_err());
    }

    #[test]
    fn uuid_order() {
        let uuid = Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb);
        let bytes = uuid_le_bytes(uuid);
        assert_eq!(bytes[0], 0xfb);
        assert_eq!(bytes[12], 0x0b);
        assert_eq!(bytes[13], 0x11);
    }

    #[test]
    fn discoverable_names() {
        assert_eq!(Discoverable::Limited.to_string(), "limited");
        assert_eq!("general".parse::<Discoverable>().unwrap(), Discoverable::General);
        assert_eq!(Discoverable::default() as u8, 0);
    }
}
