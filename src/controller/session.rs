use super::debounce::HoldLatch;
use super::registry::{Registry, WeakRegistry};
use super::vibration::{TimerAction, VibrationScheduler, VibrationTracker};
use super::{codec, ControllerState, SessionId, SessionSink, StopReason, VibrationCommand};
use crate::config::SessionConfig;
use crate::transport::{Transport, TransportError};
use crossbeam_channel::{select, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Large enough for any report the controller sends over USB or Bluetooth
const READ_BUFFER_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to clear vibration on startup: {0}")]
    InitialWrite(#[source] TransportError),

    #[error("Failed to spawn session thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

enum OutputWake {
    Shutdown,
    Request,
    Expired,
}

/// One physical controller, from startup to teardown.
///
/// Runs an input thread, an output thread and, when the hold-button release
/// is enabled, a debounce thread. The input thread owns the teardown.
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    transport: Box<dyn Transport>,
    sink: Arc<dyn SessionSink>,

    state: RwLock<ControllerState>,
    hold: Option<HoldLatch>,
    vibration: VibrationScheduler,

    active: AtomicBool,
    // Dropping the sender wakes every loop waiting on `shutdown_rx` at once
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        transport: Box<dyn Transport>,
        sink: Arc<dyn SessionSink>,
        config: SessionConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        Self {
            id,
            config,
            transport,
            sink,
            state: RwLock::new(ControllerState::default()),
            hold: config.guide_release.map(|_| HoldLatch::new()),
            vibration: VibrationScheduler::new(),
            active: AtomicBool::new(true),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    /// Clear the motors, spawn the loops and register the session.
    ///
    /// Nothing is registered on failure and the transport is closed.
    pub(crate) fn start(
        registry: &Registry,
        transport: Box<dyn Transport>,
        sink: Arc<dyn SessionSink>,
        config: SessionConfig,
    ) -> Result<SessionId, SessionError> {
        if let Err(e) = transport.write_output(&codec::encode_output(VibrationCommand::OFF)) {
            transport.close();
            return Err(SessionError::InitialWrite(e));
        }

        let session = Arc::new(Session::new(registry.next_id(), transport, sink, config));
        let id = session.id;

        // Threads are parked until the session is registered
        let mut workers = Vec::new();
        let mut worker_gates = Vec::new();
        let mut spawned = Session::spawn_gated(&session, "output", |s| s.output_loop())
            .map(|(handle, gate)| {
                workers.push(handle);
                worker_gates.push(gate);
            });

        if spawned.is_ok() && session.hold.is_some() {
            spawned = Session::spawn_gated(&session, "debounce", |s| s.debounce_loop()).map(
                |(handle, gate)| {
                    workers.push(handle);
                    worker_gates.push(gate);
                },
            );
        }

        let input = spawned.and_then(|_| {
            let (gate, parked) = crossbeam_channel::bounded::<Vec<JoinHandle<()>>>(1);
            let weak = registry.downgrade();
            let session = Arc::clone(&session);
            thread::Builder::new()
                .name(format!("stadia-input-{}", id.0))
                .spawn(move || {
                    if let Ok(workers) = parked.recv() {
                        session.run_input(workers, weak);
                    }
                })
                .map(|handle| (handle, gate))
        });

        let (input_handle, input_gate) = match input {
            Ok(input) => input,
            Err(e) => {
                log::error!("Failed to start session {}: {}", id, e);
                drop(worker_gates);
                for worker in workers {
                    let _ = worker.join();
                }
                session.transport.close();
                return Err(SessionError::ThreadSpawn(e));
            }
        };

        registry.register(Arc::clone(&session));

        for gate in worker_gates {
            let _ = gate.send(());
        }
        let _ = input_gate.send(workers);
        // The input thread tears itself down, nobody joins it
        drop(input_handle);

        log::info!("Session {} started", id);
        Ok(id)
    }

    fn spawn_gated<F>(
        session: &Arc<Session>,
        kind: &str,
        body: F,
    ) -> std::io::Result<(JoinHandle<()>, Sender<()>)>
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        let (gate, parked) = crossbeam_channel::bounded::<()>(1);
        let session = Arc::clone(session);
        let handle = thread::Builder::new()
            .name(format!("stadia-{}-{}", kind, session.id.0))
            .spawn(move || {
                // A dropped gate means startup was aborted
                if parked.recv().is_ok() {
                    body(&session);
                }
            })?;
        Ok((handle, gate))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Snapshot of the last published state
    pub fn state(&self) -> ControllerState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Request new motor intensities; ignored once the session is stopping
    pub fn set_vibration(&self, small_motor: u8, big_motor: u8) {
        if !self.is_active() {
            log::trace!("Session {} is stopping, vibration ignored", self.id);
            return;
        }
        self.vibration
            .set(VibrationCommand::new(big_motor, small_motor));
    }

    /// Ask the session to stop. Repeated calls are no-ops.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            log::info!("Stopping session {}", self.id);
            self.transport.cancel_pending_read();
            self.signal_shutdown();
        }
    }

    fn signal_shutdown(&self) {
        self.shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    fn run_input(&self, workers: Vec<JoinHandle<()>>, registry: WeakRegistry) {
        let reason = match panic::catch_unwind(AssertUnwindSafe(|| self.poll_input())) {
            Ok(reason) => reason,
            Err(_) => {
                log::error!("Input loop of session {} panicked", self.id);
                StopReason::Unknown
            }
        };
        self.teardown(reason, workers, registry);
    }

    fn poll_input(&self) -> StopReason {
        let mut buf = [0u8; READ_BUFFER_LEN];

        loop {
            let read = loop {
                if !self.is_active() {
                    return StopReason::Requested;
                }
                match self.transport.read_input(&mut buf, self.config.read_timeout) {
                    Ok(0) => continue,
                    other => break other,
                }
            };

            if !self.is_active() {
                return StopReason::Requested;
            }

            let len = match read {
                Ok(len) => len,
                Err(e) => {
                    log::warn!("Read from session {} failed: {}", self.id, e);
                    return StopReason::ReadError;
                }
            };

            let Some(state) = codec::decode_input(&buf[..len]) else {
                log::trace!("Session {} dropped report {:02x?}", self.id, &buf[..len]);
                continue;
            };

            {
                let mut current = self.state.write().unwrap_or_else(|e| e.into_inner());
                *current = state;
                if let Some(hold) = &self.hold {
                    hold.observe(&state);
                }
            }

            self.sink.on_state(self.id, &state);
        }
    }

    fn output_loop(&self) {
        let mut tracker = VibrationTracker::new(self.config.vibration_timeout.is_some());
        let mut timer = crossbeam_channel::never();
        let wake = self.vibration.wake_receiver();

        while self.is_active() {
            let event = select! {
                recv(self.shutdown_rx) -> _ => OutputWake::Shutdown,
                recv(wake) -> _ => OutputWake::Request,
                recv(timer) -> _ => OutputWake::Expired,
            };

            match event {
                OutputWake::Shutdown => break,
                OutputWake::Request => {}
                OutputWake::Expired => {
                    timer = crossbeam_channel::never();
                    tracker.expire();
                    if self.vibration.clear_if(tracker.written()) {
                        log::debug!("Session {} vibration timed out", self.id);
                    }
                }
            }

            let step = tracker.step(self.vibration.requested());
            match step.timer {
                TimerAction::Arm => {
                    if let Some(timeout) = self.config.vibration_timeout {
                        timer = crossbeam_channel::after(timeout);
                    }
                }
                TimerAction::Cancel => timer = crossbeam_channel::never(),
                TimerAction::Keep => {}
            }

            if let Some(command) = step.write {
                self.write_vibration(command);
            }
        }

        // Vibration never outlives the session
        self.write_vibration(VibrationCommand::OFF);
    }

    fn write_vibration(&self, command: VibrationCommand) {
        log::debug!(
            "Session {} vibration: big={}, small={}",
            self.id,
            command.big_motor,
            command.small_motor
        );
        if let Err(e) = self.transport.write_output(&codec::encode_output(command)) {
            log::warn!("Failed to write vibration to session {}: {}", self.id, e);
        }
    }

    fn debounce_loop(&self) {
        let (Some(hold), Some(delay)) = (&self.hold, self.config.guide_release) else {
            return;
        };

        while self.is_active() {
            let woken = select! {
                recv(self.shutdown_rx) -> _ => false,
                recv(hold.wake_receiver()) -> _ => true,
            };
            if !woken {
                break;
            }
            if !hold.is_held() {
                continue;
            }
            if !self.wait_or_shutdown(delay) {
                break;
            }

            let released = {
                let mut current = self.state.write().unwrap_or_else(|e| e.into_inner());
                hold.release(&mut current).then_some(*current)
            };
            match released {
                Some(state) => {
                    log::trace!("Session {} released the Stadia button", self.id);
                    self.sink.on_state(self.id, &state);
                }
                None => log::trace!("Session {} Stadia button already up", self.id),
            }
        }
    }

    /// False when shutdown was signalled before `delay` elapsed
    fn wait_or_shutdown(&self, delay: Duration) -> bool {
        let timer = crossbeam_channel::after(delay);
        select! {
            recv(self.shutdown_rx) -> _ => false,
            recv(timer) -> _ => self.is_active(),
        }
    }

    fn teardown(&self, reason: StopReason, workers: Vec<JoinHandle<()>>, registry: WeakRegistry) {
        // Lookups must never find a session that is being torn down
        if let Some(registry) = registry.upgrade() {
            registry.unregister(self.id);
        }

        self.active.store(false, Ordering::SeqCst);
        self.signal_shutdown();

        for worker in workers {
            if worker.join().is_err() {
                log::error!("A worker thread of session {} panicked", self.id);
            }
        }

        self.transport.close();

        log::info!("Session {} stopped: {}", self.id, reason);
        self.sink.on_stopped(self.id, reason);
    }
}
