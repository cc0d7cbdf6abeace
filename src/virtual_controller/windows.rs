use super::{RumbleHandler, VirtualController, XboxControllerState};
use std::thread::JoinHandle;
use vigem_client::{Client, TargetId, XButtons, XGamepad, Xbox360Wired};

pub struct VirtualXboxController {
    target: Xbox360Wired<Client>,
    notification_thread: Option<JoinHandle<()>>,
}

impl VirtualXboxController {
    pub fn new(rumble: RumbleHandler) -> anyhow::Result<Self> {
        let client = Client::connect().map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to ViGEmBus: {:?}. Make sure ViGEmBus driver is installed from https://github.com/ViGEm/ViGEmBus/releases",
                e
            )
        })?;

        let mut target = Xbox360Wired::new(client, TargetId::XBOX360_WIRED);

        target
            .plugin()
            .map_err(|e| anyhow::anyhow!("Failed to plug in virtual controller: {:?}", e))?;

        target
            .wait_ready()
            .map_err(|e| anyhow::anyhow!("Controller not ready: {:?}", e))?;

        log::info!("Virtual Xbox 360 controller created via ViGEmBus");

        // Rumble from the game goes straight back to the physical controller
        let notification_thread = match target.request_notification() {
            Ok(request_notification) => {
                let handle = request_notification.spawn_thread(move |_notif, data| {
                    log::trace!(
                        "Rumble request: large={}, small={}",
                        data.large_motor,
                        data.small_motor
                    );
                    rumble(data.large_motor, data.small_motor);
                });
                Some(handle)
            }
            Err(e) => {
                log::warn!("Failed to enable rumble notifications: {:?}", e);
                None
            }
        };

        Ok(Self {
            target,
            notification_thread,
        })
    }
}

impl VirtualController for VirtualXboxController {
    fn update(&mut self, state: &XboxControllerState) -> anyhow::Result<()> {
        let buttons = &state.buttons;
        let flags = [
            (buttons.a, XButtons::A),
            (buttons.b, XButtons::B),
            (buttons.x, XButtons::X),
            (buttons.y, XButtons::Y),
            (buttons.left_bumper, XButtons::LB),
            (buttons.right_bumper, XButtons::RB),
            (buttons.back, XButtons::BACK),
            (buttons.start, XButtons::START),
            (buttons.guide, XButtons::GUIDE),
            (buttons.left_thumb, XButtons::LTHUMB),
            (buttons.right_thumb, XButtons::RTHUMB),
            (buttons.dpad_up, XButtons::UP),
            (buttons.dpad_down, XButtons::DOWN),
            (buttons.dpad_left, XButtons::LEFT),
            (buttons.dpad_right, XButtons::RIGHT),
        ];
        let raw = flags
            .iter()
            .filter(|(pressed, _)| *pressed)
            .fold(0u16, |raw, (_, flag)| raw | *flag);

        let gamepad = XGamepad {
            buttons: XButtons { raw },
            left_trigger: state.left_trigger,
            right_trigger: state.right_trigger,
            thumb_lx: state.thumb_lx,
            thumb_ly: state.thumb_ly,
            thumb_rx: state.thumb_rx,
            thumb_ry: state.thumb_ry,
        };

        self.target
            .update(&gamepad)
            .map_err(|e| anyhow::anyhow!("Failed to update controller: {:?}", e))?;

        Ok(())
    }
}

impl Drop for VirtualXboxController {
    fn drop(&mut self) {
        // Unplugging ends the notification thread
        let _ = self.target.unplug();

        if let Some(thread) = self.notification_thread.take() {
            let _ = thread.join();
        }
        log::info!("Virtual Xbox 360 controller removed");
    }
}
