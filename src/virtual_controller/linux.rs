use super::uinput_ffi::*;
use super::{RumbleHandler, VirtualController, XboxControllerState};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const DEVICE_NAME: &[u8] = b"Stadia Bridge Virtual Xbox Controller";
const FF_POLL_TIMEOUT_MS: libc::c_int = 100;

pub struct VirtualXboxController {
    uinput_file: File,
    ff_thread_handle: Option<JoinHandle<()>>,
    ff_thread_running: Arc<AtomicBool>,
}

impl VirtualXboxController {
    pub fn new(rumble: RumbleHandler) -> anyhow::Result<Self> {
        let uinput_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(UINPUT_PATH)
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to open {}: {}. Try: sudo chmod 666 /dev/uinput",
                    UINPUT_PATH,
                    e
                )
            })?;

        let fd = uinput_file.as_raw_fd();
        set_nonblocking(fd)?;
        register_capabilities(fd)?;
        create_device(fd)?;

        log::info!("Uinput gamepad created");

        let ff_thread_running = Arc::new(AtomicBool::new(true));
        let ff_thread_handle = spawn_ff_thread(fd, rumble, Arc::clone(&ff_thread_running))?;

        Ok(Self {
            uinput_file,
            ff_thread_handle: Some(ff_thread_handle),
            ff_thread_running,
        })
    }

    fn write_event(&mut self, type_: u16, code: u16, value: i32) -> anyhow::Result<()> {
        let event = InputEvent::new(type_, code, value);
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &event as *const _ as *const u8,
                std::mem::size_of::<InputEvent>(),
            )
        };
        self.uinput_file.write_all(bytes)?;
        Ok(())
    }
}

fn set_nonblocking(fd: RawFd) -> anyhow::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(anyhow::anyhow!("Failed to get uinput file flags"));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(anyhow::anyhow!("Failed to set uinput non-blocking mode"));
        }
    }
    Ok(())
}

fn set_bit(fd: RawFd, request: libc::c_ulong, bit: u16, what: &str) -> anyhow::Result<()> {
    if unsafe { libc::ioctl(fd, request, bit as libc::c_int) } < 0 {
        return Err(anyhow::anyhow!(
            "Failed to enable {} {:#x}: {}",
            what,
            bit,
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

fn register_capabilities(fd: RawFd) -> anyhow::Result<()> {
    for event_type in [EV_KEY, EV_ABS, EV_SYN, EV_FF] {
        set_bit(fd, UI_SET_EVBIT, event_type, "event type")?;
    }
    for button in [
        BTN_A, BTN_B, BTN_X, BTN_Y, BTN_TL, BTN_TR, BTN_SELECT, BTN_START, BTN_MODE, BTN_THUMBL,
        BTN_THUMBR,
    ] {
        set_bit(fd, UI_SET_KEYBIT, button, "button")?;
    }
    for axis in [ABS_X, ABS_Y, ABS_RX, ABS_RY, ABS_Z, ABS_RZ, ABS_HAT0X, ABS_HAT0Y] {
        set_bit(fd, UI_SET_ABSBIT, axis, "axis")?;
    }
    set_bit(fd, UI_SET_FFBIT, FF_RUMBLE, "effect")
}

fn create_device(fd: RawFd) -> anyhow::Result<()> {
    let mut dev: UinputUserDev = unsafe { std::mem::zeroed() };
    dev.name[..DEVICE_NAME.len()].copy_from_slice(DEVICE_NAME);
    dev.id = InputId {
        bustype: 0x03, // BUS_USB
        vendor: 0x045e,
        product: 0x028e,
        version: 0x0110,
    };
    dev.ff_effects_max = 16;

    for axis in [ABS_X, ABS_Y, ABS_RX, ABS_RY] {
        dev.absmin[axis as usize] = AXIS_MIN;
        dev.absmax[axis as usize] = AXIS_MAX;
    }
    for trigger in [ABS_Z, ABS_RZ] {
        dev.absmin[trigger as usize] = TRIGGER_MIN;
        dev.absmax[trigger as usize] = TRIGGER_MAX;
    }
    for hat in [ABS_HAT0X, ABS_HAT0Y] {
        dev.absmin[hat as usize] = -1;
        dev.absmax[hat as usize] = 1;
    }

    unsafe {
        let dev_bytes = std::slice::from_raw_parts(
            &dev as *const _ as *const u8,
            std::mem::size_of::<UinputUserDev>(),
        );
        if libc::write(fd, dev_bytes.as_ptr() as *const libc::c_void, dev_bytes.len()) < 0 {
            return Err(anyhow::anyhow!("Failed to write device struct"));
        }
        if libc::ioctl(fd, UI_DEV_CREATE) < 0 {
            return Err(anyhow::anyhow!(
                "Failed to create device: {}",
                std::io::Error::last_os_error()
            ));
        }
    }
    Ok(())
}

/// Serve force feedback uploads and forward played rumble effects
fn spawn_ff_thread(
    fd: RawFd,
    rumble: RumbleHandler,
    running: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<()>> {
    // The thread keeps its own descriptor so it can outlive a write error
    let thread_fd = unsafe { libc::dup(fd) };
    if thread_fd < 0 {
        return Err(anyhow::anyhow!(
            "Failed to duplicate uinput fd: {}",
            std::io::Error::last_os_error()
        ));
    }

    let spawned = std::thread::Builder::new()
        .name("uinput-ff".to_string())
        .spawn(move || {
            let mut effects: HashMap<i16, FFRumbleEffect> = HashMap::new();
            while running.load(Ordering::SeqCst) {
                if !wait_readable(thread_fd) {
                    continue;
                }
                while let Some(event) = read_event(thread_fd) {
                    match (event.type_, event.code) {
                        (EV_UINPUT, UI_FF_UPLOAD) => handle_upload(thread_fd, event.value, &mut effects),
                        (EV_UINPUT, UI_FF_ERASE) => handle_erase(thread_fd, event.value, &mut effects),
                        (EV_FF, code) => play_effect(code as i16, event.value, &effects, &rumble),
                        _ => {}
                    }
                }
            }
            unsafe {
                libc::close(thread_fd);
            }
            log::debug!("FF polling stopped");
        });

    spawned.map_err(|e| {
        unsafe {
            libc::close(thread_fd);
        }
        anyhow::anyhow!("Failed to spawn FF thread: {}", e)
    })
}

fn wait_readable(fd: RawFd) -> bool {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let result = unsafe { libc::poll(&mut pollfd as *mut libc::pollfd, 1, FF_POLL_TIMEOUT_MS) };
    if result < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            log::error!("Poll error in FF thread: {}", err);
            std::thread::sleep(std::time::Duration::from_millis(FF_POLL_TIMEOUT_MS as u64));
        }
        return false;
    }
    result > 0
}

fn read_event(fd: RawFd) -> Option<InputEvent> {
    let mut buffer = [0u8; std::mem::size_of::<InputEvent>()];
    let result = unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
    if result != buffer.len() as isize {
        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                log::warn!("Error reading FF events: {}", err);
            }
        }
        return None;
    }
    Some(unsafe { std::ptr::read_unaligned(buffer.as_ptr() as *const InputEvent) })
}

fn handle_upload(fd: RawFd, request_id: i32, effects: &mut HashMap<i16, FFRumbleEffect>) {
    let mut upload: UinputFFUpload = unsafe { std::mem::zeroed() };
    upload.request_id = request_id as u32;

    if unsafe { libc::ioctl(fd, UI_BEGIN_FF_UPLOAD, &mut upload as *mut _) } < 0 {
        log::error!("UI_BEGIN_FF_UPLOAD failed: {}", std::io::Error::last_os_error());
        return;
    }

    if upload.effect.type_ == FF_RUMBLE {
        let effect: FFRumbleEffect =
            unsafe { std::ptr::read_unaligned(upload.effect.u.as_ptr() as *const FFRumbleEffect) };
        log::debug!(
            "Stored FF effect {}: strong={}, weak={}",
            upload.effect.id,
            effect.strong_magnitude,
            effect.weak_magnitude
        );
        effects.insert(upload.effect.id, effect);
    } else {
        log::warn!("Ignoring non-rumble FF effect type {}", upload.effect.type_);
    }

    upload.retval = 0;
    if unsafe { libc::ioctl(fd, UI_END_FF_UPLOAD, &upload as *const _) } < 0 {
        log::error!("UI_END_FF_UPLOAD failed: {}", std::io::Error::last_os_error());
    }
}

fn handle_erase(fd: RawFd, request_id: i32, effects: &mut HashMap<i16, FFRumbleEffect>) {
    let mut erase: UinputFFErase = unsafe { std::mem::zeroed() };
    erase.request_id = request_id as u32;

    if unsafe { libc::ioctl(fd, UI_BEGIN_FF_ERASE, &mut erase as *mut _) } < 0 {
        log::error!("UI_BEGIN_FF_ERASE failed: {}", std::io::Error::last_os_error());
        return;
    }

    effects.remove(&(erase.effect_id as i16));

    erase.retval = 0;
    if unsafe { libc::ioctl(fd, UI_END_FF_ERASE, &erase as *const _) } < 0 {
        log::error!("UI_END_FF_ERASE failed: {}", std::io::Error::last_os_error());
    }
}

/// A positive count plays the effect, zero stops it
fn play_effect(
    id: i16,
    count: i32,
    effects: &HashMap<i16, FFRumbleEffect>,
    rumble: &RumbleHandler,
) {
    if count <= 0 {
        rumble(0, 0);
        return;
    }
    match effects.get(&id) {
        Some(effect) => rumble(
            (effect.strong_magnitude >> 8) as u8,
            (effect.weak_magnitude >> 8) as u8,
        ),
        None => log::warn!("EV_FF play event for unknown effect ID {}", id),
    }
}

impl VirtualController for VirtualXboxController {
    fn update(&mut self, state: &XboxControllerState) -> anyhow::Result<()> {
        // evdev Y axes grow downwards
        let axes = [
            (ABS_X, i32::from(state.thumb_lx)),
            (ABS_Y, -i32::from(state.thumb_ly)),
            (ABS_RX, i32::from(state.thumb_rx)),
            (ABS_RY, -i32::from(state.thumb_ry)),
            (ABS_Z, i32::from(state.left_trigger)),
            (ABS_RZ, i32::from(state.right_trigger)),
        ];
        for (axis, value) in axes {
            self.write_event(EV_ABS, axis, value)?;
        }

        let buttons = &state.buttons;
        let keys = [
            (BTN_A, buttons.a),
            (BTN_B, buttons.b),
            (BTN_X, buttons.x),
            (BTN_Y, buttons.y),
            (BTN_TL, buttons.left_bumper),
            (BTN_TR, buttons.right_bumper),
            (BTN_SELECT, buttons.back),
            (BTN_START, buttons.start),
            (BTN_MODE, buttons.guide),
            (BTN_THUMBL, buttons.left_thumb),
            (BTN_THUMBR, buttons.right_thumb),
        ];
        for (key, pressed) in keys {
            self.write_event(EV_KEY, key, pressed as i32)?;
        }

        let hat_x = match (buttons.dpad_left, buttons.dpad_right) {
            (true, false) => -1,
            (false, true) => 1,
            _ => 0,
        };
        let hat_y = match (buttons.dpad_up, buttons.dpad_down) {
            (true, false) => -1,
            (false, true) => 1,
            _ => 0,
        };
        self.write_event(EV_ABS, ABS_HAT0X, hat_x)?;
        self.write_event(EV_ABS, ABS_HAT0Y, hat_y)?;

        self.write_event(EV_SYN, SYN_REPORT, 0)?;
        self.uinput_file.flush()?;
        Ok(())
    }
}

impl Drop for VirtualXboxController {
    fn drop(&mut self) {
        self.ff_thread_running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.ff_thread_handle.take() {
            if let Err(e) = handle.join() {
                log::error!("FF polling thread panicked: {:?}", e);
            }
        }

        unsafe {
            let _ = libc::ioctl(self.uinput_file.as_raw_fd(), UI_DEV_DESTROY);
        }
        log::info!("Uinput gamepad removed");
    }
}
