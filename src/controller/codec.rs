use super::{Buttons, ControllerState, VibrationCommand};

/// Leading byte of every controller input report
pub const INPUT_REPORT_ID: u8 = 0x03;
/// Leading byte of the rumble output report
pub const OUTPUT_REPORT_ID: u8 = 0x05;

/// Input reports are 10 bytes, 11 when the battery byte is present
pub const INPUT_REPORT_MIN_LEN: usize = 10;
pub const INPUT_REPORT_LEN: usize = 11;
pub const OUTPUT_REPORT_LEN: usize = 5;

const BIG_MOTOR_OFFSET: usize = 2;
const SMALL_MOTOR_OFFSET: usize = 4;

/// Direction index (clockwise from up) to d-pad flags
const DPAD_MAP: [Buttons; 8] = [
    Buttons::UP,
    Buttons::UP.union(Buttons::RIGHT),
    Buttons::RIGHT,
    Buttons::RIGHT.union(Buttons::DOWN),
    Buttons::DOWN,
    Buttons::DOWN.union(Buttons::LEFT),
    Buttons::LEFT,
    Buttons::LEFT.union(Buttons::UP),
];

// (bit, flag) pairs
const BYTE2_BUTTONS: [(u8, Buttons); 4] = [
    (7, Buttons::RS),
    (6, Buttons::OPTIONS),
    (5, Buttons::MENU),
    (4, Buttons::STADIA),
];

const BYTE3_BUTTONS: [(u8, Buttons); 7] = [
    (6, Buttons::A),
    (5, Buttons::B),
    (4, Buttons::X),
    (3, Buttons::Y),
    (2, Buttons::L1),
    (1, Buttons::R1),
    (0, Buttons::LS),
];

/// Decode a raw input report.
///
/// Returns `None` for reports with a foreign identifier or that are too short
/// to hold the sticks and triggers; those are dropped without touching state.
pub fn decode_input(report: &[u8]) -> Option<ControllerState> {
    if report.len() < INPUT_REPORT_MIN_LEN || report[0] != INPUT_REPORT_ID {
        return None;
    }

    let mut buttons = Buttons::empty();

    // Neutral d-pad is reported as 8
    if let Some(dpad) = DPAD_MAP.get(usize::from(report[1])) {
        buttons |= *dpad;
    }

    for (bit, flag) in BYTE2_BUTTONS {
        if report[2] & (1 << bit) != 0 {
            buttons |= flag;
        }
    }
    for (bit, flag) in BYTE3_BUTTONS {
        if report[3] & (1 << bit) != 0 {
            buttons |= flag;
        }
    }

    Some(ControllerState {
        buttons,
        left_stick_x: report[4],
        left_stick_y: report[5],
        right_stick_x: report[6],
        right_stick_y: report[7],
        left_trigger: report[8],
        right_trigger: report[9],
        battery: report.get(INPUT_REPORT_LEN - 1).copied(),
    })
}

/// Encode a rumble command as an output report
pub fn encode_output(command: VibrationCommand) -> [u8; OUTPUT_REPORT_LEN] {
    let mut report = [0u8; OUTPUT_REPORT_LEN];
    report[0] = OUTPUT_REPORT_ID;
    report[BIG_MOTOR_OFFSET] = command.big_motor;
    report[SMALL_MOTOR_OFFSET] = command.small_motor;
    report
}
