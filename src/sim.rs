use crate::command::Command;
use crate::data::{ActionStatus, DeviceStatus, StatusCode};
use crate::register_map::ActionKind;

const VOLUME_PER_POLL_AT_SPEED_1: u32 = 250;
const MAX_ACTION_POLLS: u32 = 20;
const HOME_POLLS: u32 = 2;

/// Pipette model used by the simulation interface.
#[derive(Debug, Clone)]
pub struct SimPipette {
    held_volume: u32,
    remaining_polls: u32,
}

impl SimPipette {
    pub fn new() -> Self {
        Self {
            held_volume: 0,
            remaining_polls: 0,
        }
    }

    pub fn held_volume(&self) -> u32 {
        self.held_volume
    }

    /// Refuses a dispense larger than the held volume, like the device does.
    pub fn start(&mut self, command: Command) -> Result<(), StatusCode> {
        if self.remaining_polls > 0 {
            return Err(StatusCode::NotAccepted);
        }
        let volume = u32::from(command.device_volume());
        match command.action {
            ActionKind::Aspirate => self.held_volume = self.held_volume.saturating_add(volume),
            ActionKind::Dispense => {
                self.held_volume = self
                    .held_volume
                    .checked_sub(volume)
                    .ok_or(StatusCode::NotAccepted)?;
            }
            ActionKind::Home => self.held_volume = 0,
        }
        self.remaining_polls = match command.action {
            ActionKind::Home => HOME_POLLS,
            _ => action_polls(volume, command.speed),
        };
        Ok(())
    }

    pub fn tick(&mut self) -> DeviceStatus {
        let action = if self.remaining_polls == 0 {
            ActionStatus::Ready
        } else {
            self.remaining_polls -= 1;
            ActionStatus::Busy
        };
        DeviceStatus {
            action,
            hardware_error: 0,
        }
    }
}

fn action_polls(volume: u32, speed: u8) -> u32 {
    let per_poll = VOLUME_PER_POLL_AT_SPEED_1 * u32::from(speed.max(1));
    (1 + volume / per_poll).min(MAX_ACTION_POLLS)
}
