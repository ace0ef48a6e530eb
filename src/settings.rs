//! Controller settings.

use std::fmt;

use crate::{Error, Result};

const fn test_bit(bits: u16, bit: u8) -> bool {
    bits & (1 << bit) != 0
}

macro_rules! define_settings {
    ($vis:vis $name:ident, $doc:tt => {
        $(
            $(#[$field_outer:meta])*
            $field:ident ($bit:expr),
        )*
    }) => {
        #[derive(Clone, Copy, Default, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[doc=$doc]
        $vis struct $name {
            $(
                $(#[$field_outer])*
                pub $field: bool,
            )*
        }

        impl $name {
            /// Unpacks the settings bitfield.
            pub const fn from_bits(bits: u16) -> Self {
                Self {
                    $( $field: test_bit(bits, $bit), )*
                }
            }

            /// Packs the settings into a bitfield.
            pub const fn bits(&self) -> u16 {
                let mut bits = 0;
                $(
                    if self.$field {
                        bits |= 1 << $bit;
                    }
                )*
                bits
            }

            /// Names of all settings that are enabled.
            pub fn names(&self) -> Vec<&'static str> {
                let mut v = Vec::new();
                $(
                    if self.$field {
                        v.push(stringify!($field));
                    }
                )*
                v
            }
        }
    };
}

define_settings!(pub ControllerSettings, "Settings of a Bluetooth controller." => {
    /// Controller is powered on.
    powered(0),
    /// Controller accepts incoming connections.
    connectable(1),
    /// Page scan uses fast intervals.
    fast_connectable(2),
    /// Controller is discoverable.
    discoverable(3),
    /// Controller accepts pairing requests.
    bondable(4),
    /// Link level security (security mode 3) is enabled.
    link_level_security(5),
    /// Secure Simple Pairing is enabled.
    secure_simple_pairing(6),
    /// Classic Bluetooth (BR/EDR) is enabled.
    br_edr(7),
    /// High speed (AMP) is enabled.
    high_speed(8),
    /// Bluetooth Low Energy is enabled.
    low_energy(9),
    /// LE advertising is enabled.
    advertising(10),
    /// Secure Connections are enabled.
    secure_connections(11),
    /// Debug keys are used.
    debug_keys(12),
    /// LE privacy is enabled.
    privacy(13),
    /// Controller requires configuration.
    controller_configuration(14),
    /// LE static address is used.
    static_address(15),
});

impl ControllerSettings {
    /// Decodes settings from their 32-bit little-endian wire form.
    ///
    /// Only the first 4 bytes are used; bits above 15 are ignored.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes {
            &[b0, b1, b2, b3, ..] => Ok(Self::from_bits(u32::from_le_bytes([b0, b1, b2, b3]) as u16)),
            _ => Err(Error::invalid_format(format!("settings need 4 bytes but {} available", bytes.len()))),
        }
    }

    /// Encodes the settings into their 32-bit little-endian wire form.
    pub fn to_le_bytes(&self) -> [u8; 4] {
        u32::from(self.bits()).to_le_bytes()
    }
}

impl fmt::Display for ControllerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join(", "))
    }
}

impl From<u16> for ControllerSettings {
    fn from(bits: u16) -> Self {
        Self::from_bits(bits)
    }
}

impl From<ControllerSettings> for u16 {
    fn from(settings: ControllerSettings) -> Self {
        settings.bits()
    }
}
