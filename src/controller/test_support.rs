use super::{ControllerState, SessionId, SessionSink, StopReason};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    State(SessionId, ControllerState),
    Stopped(SessionId, StopReason),
}

/// Forwards every callback into a channel
pub struct ChannelSink {
    events: Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, Receiver<SinkEvent>) {
        let (events, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self { events }), rx)
    }
}

impl SessionSink for ChannelSink {
    fn on_state(&self, id: SessionId, state: &ControllerState) {
        let _ = self.events.send(SinkEvent::State(id, *state));
    }

    fn on_stopped(&self, id: SessionId, reason: StopReason) {
        let _ = self.events.send(SinkEvent::Stopped(id, reason));
    }
}

pub const WAIT: Duration = Duration::from_secs(2);

/// Next event, skipping nothing
pub fn next_event(rx: &Receiver<SinkEvent>) -> SinkEvent {
    rx.recv_timeout(WAIT).expect("sink event")
}

/// Skip state events until the stop notification arrives
pub fn wait_stopped(rx: &Receiver<SinkEvent>) -> (SessionId, StopReason) {
    loop {
        match next_event(rx) {
            SinkEvent::Stopped(id, reason) => return (id, reason),
            SinkEvent::State(..) => continue,
        }
    }
}
