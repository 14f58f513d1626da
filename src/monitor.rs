use std::sync::Arc;

use crate::backend::PipetteLink;
use crate::channel::{Channel, DeviceSignal};
use crate::command::Command;

/// Watches the device for the end of the command last sent to it.
///
/// Only polls while a sent command is outstanding, so a stale "ready" from
/// before the send can never complete a newer command.
pub(crate) struct CompletionMonitor {
    channel: Arc<Channel>,
    awaiting: Option<Command>,
}

impl CompletionMonitor {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            awaiting: None,
        }
    }

    pub(crate) fn command_sent(&mut self, command: Command) {
        self.awaiting = Some(command);
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.awaiting.is_some()
    }

    pub(crate) fn poll(&mut self, link: &mut dyn PipetteLink) {
        if self.is_waiting() {
            let signal = link.read_signal();
            self.observe(signal);
        }
    }

    pub(crate) fn observe(&mut self, signal: DeviceSignal) {
        match signal {
            DeviceSignal::Pending => {}
            DeviceSignal::Completed | DeviceSignal::Error(_) => {
                self.awaiting = None;
                self.channel.on_device_signal(signal);
            }
        }
    }
}
