use super::VibrationCommand;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Mutex;

/// Requested motor pair of one session, shared between the public setter and
/// the output loop. Guarded by its own lock, never taken together with the
/// state lock.
pub(crate) struct VibrationScheduler {
    requested: Mutex<VibrationCommand>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl VibrationScheduler {
    pub fn new() -> Self {
        // A single pending wake is enough, later ones coalesce into it
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            requested: Mutex::new(VibrationCommand::OFF),
            wake_tx,
            wake_rx,
        }
    }

    /// Overwrite the requested pair and wake the output loop
    pub fn set(&self, command: VibrationCommand) {
        *self.requested.lock().unwrap_or_else(|e| e.into_inner()) = command;
        let _ = self.wake_tx.try_send(());
    }

    /// Drop the request back to zero after the inactivity timeout, unless a
    /// different pair was requested since `stale` was written.
    pub fn clear_if(&self, stale: VibrationCommand) -> bool {
        let mut requested = self.requested.lock().unwrap_or_else(|e| e.into_inner());
        if *requested == stale {
            *requested = VibrationCommand::OFF;
            true
        } else {
            false
        }
    }

    pub fn requested(&self) -> VibrationCommand {
        *self.requested.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wake_receiver(&self) -> &Receiver<()> {
        &self.wake_rx
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerAction {
    Keep,
    Arm,
    Cancel,
}

/// What the output loop has to do after a wake-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutputStep {
    /// Command to write, `None` when the device already has it
    pub write: Option<VibrationCommand>,
    pub timer: TimerAction,
}

/// Output-loop side bookkeeping: last pair written and whether the
/// inactivity timer runs.
pub(crate) struct VibrationTracker {
    written: VibrationCommand,
    timer_armed: bool,
    auto_stop: bool,
}

impl VibrationTracker {
    /// `auto_stop` enables the inactivity timer
    pub fn new(auto_stop: bool) -> Self {
        Self {
            written: VibrationCommand::OFF,
            timer_armed: false,
            auto_stop,
        }
    }

    /// Plan the reaction to a fresh request.
    ///
    /// A nonzero request re-arms the timer even when it equals what was
    /// already written; only a change produces a report.
    pub fn step(&mut self, requested: VibrationCommand) -> OutputStep {
        let write = if requested != self.written {
            self.written = requested;
            Some(requested)
        } else {
            None
        };

        let timer = if !self.auto_stop {
            TimerAction::Keep
        } else if !requested.is_off() {
            self.timer_armed = true;
            TimerAction::Arm
        } else if self.timer_armed {
            self.timer_armed = false;
            TimerAction::Cancel
        } else {
            TimerAction::Keep
        };

        OutputStep { write, timer }
    }

    /// The inactivity timer fired
    pub fn expire(&mut self) {
        self.timer_armed = false;
    }

    pub fn written(&self) -> VibrationCommand {
        self.written
    }
}
