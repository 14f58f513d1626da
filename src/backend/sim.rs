use color_eyre::eyre;

use crate::backend::PipetteLink;
use crate::channel::DeviceSignal;
use crate::command::Command;
use crate::sim::SimPipette;

pub(crate) struct SimLink {
    sim: SimPipette,
}

impl SimLink {
    pub(crate) fn new() -> Self {
        Self {
            sim: SimPipette::new(),
        }
    }
}

impl PipetteLink for SimLink {
    fn send(&mut self, command: Command) -> eyre::Result<()> {
        self.sim.start(command).map_err(|status| {
            eyre::eyre!("{command} refused by simulated pipette: {}", status.describe())
        })?;
        log::debug!("simulated pipette now holds {}", self.sim.held_volume());
        Ok(())
    }

    fn read_signal(&mut self) -> DeviceSignal {
        self.sim.tick().signal()
    }
}
