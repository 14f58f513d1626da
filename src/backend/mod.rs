use color_eyre::eyre;

use crate::channel::DeviceSignal;
use crate::command::Command;
use crate::config::BridgeConfig;
use crate::interface::InterfaceMode;
use crate::register_map::ChannelId;

mod viaflo;

#[cfg(debug_assertions)]
mod sim;

/// Serial side of one channel. Owned by that channel's worker thread.
pub(crate) trait PipetteLink {
    /// Start `command` on the device. An error means the device may not
    /// have received it.
    fn send(&mut self, command: Command) -> eyre::Result<()>;
    fn read_signal(&mut self) -> DeviceSignal;
}

pub(crate) fn open_link(
    config: &BridgeConfig,
    channel: ChannelId,
) -> eyre::Result<Box<dyn PipetteLink + Send>> {
    match config.interface {
        InterfaceMode::Serial => {
            let port = config
                .channel(channel)
                .port
                .as_ref()
                .ok_or_else(|| eyre::eyre!("{channel}: serial port required"))?;
            let link = viaflo::ViafloLink::open(port, config.baud, config.response_timeout)?;
            Ok(Box::new(link))
        }
        InterfaceMode::Simulation => {
            #[cfg(debug_assertions)]
            {
                Ok(Box::new(sim::SimLink::new()))
            }
            #[cfg(not(debug_assertions))]
            {
                Err(eyre::eyre!("simulation not available in release builds"))
            }
        }
    }
}
