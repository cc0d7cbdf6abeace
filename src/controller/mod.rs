mod codec;
mod debounce;
mod registry;
mod session;
#[cfg(test)]
mod test_support;
mod vibration;

pub use registry::Registry;

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Button bitmask of a decoded controller report
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Buttons: u32 {
        const A = 0x0000_0001;
        const B = 0x0000_0002;
        const X = 0x0000_0004;
        const Y = 0x0000_0008;
        const L1 = 0x0000_0010;
        const R1 = 0x0000_0020;
        const LS = 0x0000_0040;
        const RS = 0x0000_0080;
        const UP = 0x0000_0100;
        const DOWN = 0x0000_0200;
        const LEFT = 0x0000_0400;
        const RIGHT = 0x0000_0800;
        const OPTIONS = 0x0000_1000;
        const MENU = 0x0000_2000;
        /// The Stadia (guide) button
        const STADIA = 0x0000_4000;
    }
}

impl Default for Buttons {
    fn default() -> Self {
        Buttons::empty()
    }
}

/// Canonical controller state, replaced as a whole on every accepted report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerState {
    pub buttons: Buttons,
    pub left_stick_x: u8,
    pub left_stick_y: u8,
    pub right_stick_x: u8,
    pub right_stick_y: u8,
    pub left_trigger: u8,
    pub right_trigger: u8,
    /// Only present when the report carries the battery byte
    pub battery: Option<u8>,
}

/// Requested motor intensities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VibrationCommand {
    pub big_motor: u8,
    pub small_motor: u8,
}

impl VibrationCommand {
    pub const OFF: VibrationCommand = VibrationCommand {
        big_motor: 0,
        small_motor: 0,
    };

    pub fn new(big_motor: u8, small_motor: u8) -> Self {
        Self {
            big_motor,
            small_motor,
        }
    }

    pub fn is_off(&self) -> bool {
        self.big_motor == 0 && self.small_motor == 0
    }
}

/// Process-unique session identity, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Unknown,
    Requested,
    ReadError,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unknown => "unknown",
            Self::Requested => "requested",
            Self::ReadError => "read error",
        };
        f.write_str(text)
    }
}

/// Receives state snapshots and the final stop notification of sessions.
///
/// Called from the session threads, outside of any session lock.
/// Implementations must not block for long.
pub trait SessionSink: Send + Sync {
    fn on_state(&self, id: SessionId, state: &ControllerState);
    fn on_stopped(&self, id: SessionId, reason: StopReason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_bits_keep_their_values() {
        assert_eq!(Buttons::A.bits(), 0x0001);
        assert_eq!(Buttons::RS.bits(), 0x0080);
        assert_eq!(Buttons::UP.bits(), 0x0100);
        assert_eq!(Buttons::STADIA.bits(), 0x4000);
        assert_eq!(Buttons::all().bits(), 0x7FFF);
        assert!(ControllerState::default().buttons.is_empty());
    }
}
