#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
mod uinput_ffi;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::VirtualXboxController;
#[cfg(windows)]
pub use windows::VirtualXboxController;

use crate::controller::{Buttons, ControllerState};

/// Xbox 360 report to be emitted, in XInput conventions (stick up is positive)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XboxControllerState {
    pub thumb_lx: i16,
    pub thumb_ly: i16,
    pub thumb_rx: i16,
    pub thumb_ry: i16,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub buttons: XboxButtons,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XboxButtons {
    pub a: bool,
    pub b: bool,
    pub x: bool,
    pub y: bool,
    pub left_bumper: bool,
    pub right_bumper: bool,
    pub back: bool,
    pub start: bool,
    pub guide: bool,
    pub left_thumb: bool,
    pub right_thumb: bool,
    pub dpad_up: bool,
    pub dpad_down: bool,
    pub dpad_left: bool,
    pub dpad_right: bool,
}

/// Map a 0..=255 stick byte centered at 128 onto the full i16 range
pub fn map_axis(value: u8, inverted: bool) -> i16 {
    let centered = (i32::from(value) - 128).max(-127);
    let centered = if inverted { -centered } else { centered };
    (32767 * centered / 127) as i16
}

impl From<&ControllerState> for XboxControllerState {
    fn from(state: &ControllerState) -> Self {
        let pressed = |button| state.buttons.contains(button);

        Self {
            // Stadia reports Y growing downwards
            thumb_lx: map_axis(state.left_stick_x, false),
            thumb_ly: map_axis(state.left_stick_y, true),
            thumb_rx: map_axis(state.right_stick_x, false),
            thumb_ry: map_axis(state.right_stick_y, true),
            left_trigger: state.left_trigger,
            right_trigger: state.right_trigger,
            buttons: XboxButtons {
                a: pressed(Buttons::A),
                b: pressed(Buttons::B),
                x: pressed(Buttons::X),
                y: pressed(Buttons::Y),
                left_bumper: pressed(Buttons::L1),
                right_bumper: pressed(Buttons::R1),
                back: pressed(Buttons::OPTIONS),
                start: pressed(Buttons::MENU),
                guide: pressed(Buttons::STADIA),
                left_thumb: pressed(Buttons::LS),
                right_thumb: pressed(Buttons::RS),
                dpad_up: pressed(Buttons::UP),
                dpad_down: pressed(Buttons::DOWN),
                dpad_left: pressed(Buttons::LEFT),
                dpad_right: pressed(Buttons::RIGHT),
            },
        }
    }
}

/// Receives rumble requests from the game as (large motor, small motor)
pub type RumbleHandler = Box<dyn Fn(u8, u8) + Send + 'static>;

/// Trait for virtual Xbox controller implementations
pub trait VirtualController: Send {
    fn update(&mut self, state: &XboxControllerState) -> anyhow::Result<()>;
}

/// Plug in a virtual Xbox 360 pad for this platform
#[cfg(any(windows, target_os = "linux"))]
pub fn create(rumble: RumbleHandler) -> anyhow::Result<Box<dyn VirtualController>> {
    Ok(Box::new(VirtualXboxController::new(rumble)?))
}

#[cfg(not(any(windows, target_os = "linux")))]
pub fn create(_rumble: RumbleHandler) -> anyhow::Result<Box<dyn VirtualController>> {
    Err(anyhow::anyhow!("Virtual gamepads are not supported on this platform"))
}
