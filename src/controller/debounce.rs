use super::{Buttons, ControllerState};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};

/// The button whose release is synthesized
pub(crate) const HOLD_BUTTON: Buttons = Buttons::STADIA;

/// Latch set by the input loop when the hold button shows up in a report.
///
/// The controller reports the Stadia button as a momentary press, so the
/// debounce loop turns it back off on its own after a short delay.
pub(crate) struct HoldLatch {
    held: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl HoldLatch {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            held: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        }
    }

    /// Latch the button if `state` carries it. Returns true when the latch
    /// was newly set and the debounce loop was woken.
    pub fn observe(&self, state: &ControllerState) -> bool {
        if !state.buttons.contains(HOLD_BUTTON) {
            return false;
        }
        if self.held.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.wake_tx.try_send(());
        true
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Clear the latch and the button bit. Must be called under the state
    /// write lock so the input loop cannot interleave.
    ///
    /// Returns false if a later report had already cleared the bit.
    pub fn release(&self, state: &mut ControllerState) -> bool {
        self.held.store(false, Ordering::SeqCst);
        let pressed = state.buttons.contains(HOLD_BUTTON);
        state.buttons.remove(HOLD_BUTTON);
        pressed
    }

    pub fn wake_receiver(&self) -> &Receiver<()> {
        &self.wake_rx
    }
}
