use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::Display;

/// OBD-II mode 01, "show current data".
pub const MODE_CURRENT_DATA: u8 = 0x01;

/// The mode byte echoed in a reply has bit 6 set (`01` requests are
/// answered with `41`).
pub const fn reply_mode(mode: u8) -> u8 {
    mode | 0x40
}

/// Mode-01 parameter IDs this driver knows how to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Pid {
    /// Bitmask of PIDs 01-20 the vehicle supports; doubles as the
    /// connectivity probe during initialization.
    #[strum(to_string = "supported PIDs")]
    SupportedPids = 0x00,
    #[strum(to_string = "engine coolant temperature")]
    CoolantTemp = 0x05,
    #[strum(to_string = "intake air temperature")]
    IntakeAirTemp = 0x0F,
}

impl Pid {
    /// Renders the request string sent to the adapter, e.g. `"0105"`.
    pub fn command(self) -> String {
        format!("{MODE_CURRENT_DATA:02X}{:02X}", u8::from(self))
    }
}

/// SAE J1979 offset encoding shared by the temperature PIDs:
/// `celsius = byte - 40`.
pub fn decode_temperature(byte: u8) -> i16 {
    i16::from(byte) - 40
}
