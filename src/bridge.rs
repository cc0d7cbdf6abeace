use crate::config::BridgeConfig;
use crate::controller::{ControllerState, Registry, SessionId, SessionSink, StopReason};
use crate::transport::{HidTransport, Transport};
use crate::virtual_controller::{self, RumbleHandler, VirtualController, XboxControllerState};
use hidapi::HidApi;
use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Plugs in a virtual pad whose rumble requests go to the given handler
pub type PadFactory =
    Box<dyn Fn(RumbleHandler) -> anyhow::Result<Box<dyn VirtualController>> + Send>;

struct ActiveDevice {
    path: CString,
    pad: Option<Box<dyn VirtualController>>,
}

type DeviceMap = Arc<Mutex<HashMap<SessionId, ActiveDevice>>>;

fn lock_devices(
    devices: &Mutex<HashMap<SessionId, ActiveDevice>>,
) -> MutexGuard<'_, HashMap<SessionId, ActiveDevice>> {
    devices.lock().unwrap_or_else(|e| e.into_inner())
}

/// Forwards session output to the virtual pads and forgets stopped devices
struct PadSink {
    devices: DeviceMap,
}

impl SessionSink for PadSink {
    fn on_state(&self, id: SessionId, state: &ControllerState) {
        let xbox = XboxControllerState::from(state);
        let mut devices = lock_devices(&self.devices);
        match devices.get_mut(&id).and_then(|device| device.pad.as_mut()) {
            Some(pad) => {
                if let Err(e) = pad.update(&xbox) {
                    log::error!("Failed to update virtual controller of session {}: {}", id, e);
                }
            }
            None => log::trace!("Session {} state: {:?}", id, state),
        }
    }

    fn on_stopped(&self, id: SessionId, reason: StopReason) {
        let removed = lock_devices(&self.devices).remove(&id);
        if let Some(device) = removed {
            log::info!(
                "Controller {} disconnected ({})",
                device.path.to_string_lossy(),
                reason
            );
        }
    }
}

/// Keeps one session (and optionally one virtual pad) per attached controller
pub struct Bridge {
    config: BridgeConfig,
    registry: Registry,
    devices: DeviceMap,
    sink: Arc<PadSink>,
    pad_factory: Option<PadFactory>,
    // Controllers turned away at the device cap, warned about once
    refused: HashSet<CString>,
    last_reported: Option<usize>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let pad_factory = if config.virtual_pads {
            let create: PadFactory = Box::new(virtual_controller::create);
            Some(create)
        } else {
            None
        };
        Self::with_pad_factory(config, pad_factory)
    }

    pub fn with_pad_factory(config: BridgeConfig, pad_factory: Option<PadFactory>) -> Self {
        let devices = DeviceMap::default();
        Self {
            config,
            registry: Registry::new(),
            sink: Arc::new(PadSink {
                devices: Arc::clone(&devices),
            }),
            devices,
            pad_factory,
            refused: HashSet::new(),
            last_reported: None,
        }
    }

    /// Enumerate attached controllers and bring the sessions in line
    pub fn refresh(&mut self, api: &mut HidApi) -> anyhow::Result<()> {
        let present = HidTransport::enumerate(api)?;
        let api = &*api;
        self.reconcile(&present, |path| {
            let transport = HidTransport::open(api, path)?;
            Ok(Box::new(transport) as Box<dyn Transport>)
        });
        Ok(())
    }

    /// Stop sessions whose controller vanished and start sessions for new
    /// ones, up to the configured maximum
    pub fn reconcile<F>(&mut self, present: &[CString], mut open: F)
    where
        F: FnMut(&CStr) -> anyhow::Result<Box<dyn Transport>>,
    {
        let (gone, known): (Vec<SessionId>, Vec<CString>) = {
            let devices = lock_devices(&self.devices);
            let gone = devices
                .iter()
                .filter(|(_, device)| !present.contains(&device.path))
                .map(|(id, _)| *id)
                .collect();
            let known = devices.values().map(|device| device.path.clone()).collect();
            (gone, known)
        };

        for id in gone {
            log::info!("Controller of session {} was removed", id);
            self.registry.stop_session(id);
        }

        self.refused.retain(|path| present.contains(path));

        for path in present.iter().filter(|path| !known.contains(path)) {
            if self.device_count() >= self.config.max_devices {
                if self.refused.insert(path.clone()) {
                    log::warn!(
                        "Ignoring {}, already serving {} controller(s)",
                        path.to_string_lossy(),
                        self.config.max_devices
                    );
                }
                continue;
            }
            self.refused.remove(path);
            match open(path.as_c_str()) {
                Ok(transport) => self.add_device(path, transport),
                Err(e) => log::warn!("Skipping controller: {:#}", e),
            }
        }

        self.report_status();
    }

    fn add_device(&mut self, path: &CStr, transport: Box<dyn Transport>) {
        let session_sink: Arc<dyn SessionSink> = self.sink.clone();
        let id = match self.registry.start_session(
            transport,
            session_sink,
            self.config.session_config(),
        ) {
            Ok(id) => id,
            Err(e) => {
                log::error!("Failed to start session for {}: {}", path.to_string_lossy(), e);
                return;
            }
        };

        let pad = self.pad_factory.as_ref().and_then(|create| {
            let registry = self.registry.downgrade();
            let rumble: RumbleHandler = Box::new(move |large, small| {
                if let Some(registry) = registry.upgrade() {
                    registry.set_vibration(id, small, large);
                }
            });
            match create(rumble) {
                Ok(pad) => Some(pad),
                Err(e) => {
                    log::error!("Failed to create virtual controller for session {}: {}", id, e);
                    None
                }
            }
        });

        lock_devices(&self.devices).insert(
            id,
            ActiveDevice {
                path: path.to_owned(),
                pad,
            },
        );

        // The session may have ended before it was recorded here
        if self.registry.find(id).is_none() {
            let stale = lock_devices(&self.devices).remove(&id);
            drop(stale);
            log::warn!("Session {} ended during setup", id);
            return;
        }

        log::info!("Controller {} connected as session {}", path.to_string_lossy(), id);
    }

    pub fn device_count(&self) -> usize {
        lock_devices(&self.devices).len()
    }

    fn report_status(&mut self) {
        let ids = self.registry.ids();
        if self.last_reported == Some(ids.len()) {
            return;
        }
        self.last_reported = Some(ids.len());

        log::info!("{}/{} device(s) connected", ids.len(), self.config.max_devices);
        for id in ids {
            if let Some(battery) = self.registry.state(id).and_then(|state| state.battery) {
                log::info!("Session {} battery: {}", id, battery);
            }
        }
    }

    /// Stop every session and wait until all of them have reported back.
    ///
    /// Returns `false` if some session was still running after `timeout`.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        self.registry.stop_all();

        let deadline = Instant::now() + timeout;
        while !(self.registry.is_empty() && self.device_count() == 0) {
            if Instant::now() >= deadline {
                log::warn!("{} session(s) still running at shutdown", self.registry.len());
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        log::info!("All sessions stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockHandle, MockTransport};
    use crossbeam_channel::{Receiver, Sender};

    const WAIT: Duration = Duration::from_secs(2);

    struct FakePad {
        states: Sender<XboxControllerState>,
    }

    impl VirtualController for FakePad {
        fn update(&mut self, state: &XboxControllerState) -> anyhow::Result<()> {
            let _ = self.states.send(*state);
            Ok(())
        }
    }

    struct Harness {
        states: Receiver<XboxControllerState>,
        rumbles: Arc<Mutex<Vec<RumbleHandler>>>,
    }

    fn bridge(max_devices: usize) -> (Bridge, Harness) {
        let (tx, states) = crossbeam_channel::unbounded();
        let rumbles: Arc<Mutex<Vec<RumbleHandler>>> = Arc::default();
        let stored = Arc::clone(&rumbles);
        let factory: PadFactory = Box::new(move |rumble| {
            stored.lock().unwrap().push(rumble);
            Ok(Box::new(FakePad { states: tx.clone() }) as Box<dyn VirtualController>)
        });
        let config = BridgeConfig {
            read_timeout_ms: 5,
            vibration_timeout_ms: None,
            max_devices,
            ..BridgeConfig::default()
        };
        (
            Bridge::with_pad_factory(config, Some(factory)),
            Harness { states, rumbles },
        )
    }

    fn path(name: &str) -> CString {
        CString::new(name).unwrap()
    }

    /// Reconcile with one fresh mock controller per newly opened path
    fn reconcile(bridge: &mut Bridge, present: &[CString]) -> HashMap<CString, MockHandle> {
        let mut handles = HashMap::new();
        bridge.reconcile(present, |path| {
            let (transport, handle) = MockTransport::new();
            handles.insert(path.to_owned(), handle);
            Ok(Box::new(transport) as Box<dyn Transport>)
        });
        handles
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn starts_one_session_per_controller_up_to_limit() {
        let (mut bridge, harness) = bridge(2);
        let handles = reconcile(&mut bridge, &[path("a"), path("b"), path("c")]);

        assert_eq!(handles.len(), 2);
        assert_eq!(bridge.device_count(), 2);
        assert_eq!(bridge.registry.len(), 2);
        assert_eq!(harness.rumbles.lock().unwrap().len(), 2);

        // Already known controllers are not opened again
        let handles = reconcile(&mut bridge, &[path("a"), path("b"), path("c")]);
        assert!(handles.is_empty());

        assert!(bridge.shutdown(WAIT));
    }

    #[test]
    fn forwards_states_to_the_pad() {
        let (mut bridge, harness) = bridge(4);
        let handles = reconcile(&mut bridge, &[path("a")]);

        handles[&path("a")].push_report(&[0x03, 0x00, 0x10, 0x40, 0xFF, 0x00, 0x80, 0x80, 0, 0]);

        let state = harness.states.recv_timeout(WAIT).expect("pad update");
        assert!(state.buttons.a);
        assert!(state.buttons.guide);
        assert!(state.buttons.dpad_up);
        assert_eq!(state.thumb_lx, 32767);
        assert_eq!(state.thumb_ly, 32767);

        assert!(bridge.shutdown(WAIT));
    }

    #[test]
    fn pad_rumble_reaches_the_controller() {
        let (mut bridge, harness) = bridge(4);
        let handles = reconcile(&mut bridge, &[path("a")]);
        let handle = &handles[&path("a")];
        assert_eq!(handle.next_write(WAIT).unwrap().report, vec![5, 0, 0, 0, 0]);

        (harness.rumbles.lock().unwrap()[0])(200, 10);

        let written = handle.next_write(WAIT).expect("rumble report");
        assert_eq!(written.report, vec![5, 0, 200, 0, 10]);

        assert!(bridge.shutdown(WAIT));
    }

    #[test]
    fn removed_controller_is_stopped_and_forgotten() {
        let (mut bridge, _harness) = bridge(4);
        let handles = reconcile(&mut bridge, &[path("a"), path("b")]);

        reconcile(&mut bridge, &[path("b")]);

        assert!(wait_until(|| bridge.device_count() == 1));
        assert!(wait_until(|| handles[&path("a")].is_closed()));
        assert!(!handles[&path("b")].is_closed());
        assert_eq!(bridge.registry.len(), 1);

        assert!(bridge.shutdown(WAIT));
    }

    #[test]
    fn failed_controller_is_reopened_on_next_refresh() {
        let (mut bridge, _harness) = bridge(4);
        let handles = reconcile(&mut bridge, &[path("a")]);

        handles[&path("a")].push_failure();
        assert!(wait_until(|| bridge.device_count() == 0));
        assert!(bridge.registry.is_empty());

        let reopened = reconcile(&mut bridge, &[path("a")]);
        assert_eq!(reopened.len(), 1);
        assert_eq!(bridge.device_count(), 1);

        assert!(bridge.shutdown(WAIT));
    }

    #[test]
    fn open_failures_are_skipped() {
        let (mut bridge, _harness) = bridge(4);
        bridge.reconcile(&[path("a")], |_| Err(anyhow::anyhow!("busy")));

        assert_eq!(bridge.device_count(), 0);
        assert!(bridge.registry.is_empty());
    }

    #[test]
    fn runs_without_virtual_pads() {
        let config = BridgeConfig {
            read_timeout_ms: 5,
            virtual_pads: false,
            ..BridgeConfig::default()
        };
        let mut bridge = Bridge::new(config);
        let handles = reconcile(&mut bridge, &[path("a")]);

        handles[&path("a")].push_report(&[0x03, 0x08, 0, 0, 0x80, 0x80, 0x80, 0x80, 0, 0, 55]);
        assert!(wait_until(|| {
            bridge.registry.ids().into_iter().all(|id| {
                bridge.registry.state(id).and_then(|state| state.battery) == Some(55)
            })
        }));

        assert!(bridge.shutdown(WAIT));
        assert!(handles[&path("a")].is_closed());
    }
}
