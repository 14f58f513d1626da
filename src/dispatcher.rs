use std::sync::Arc;

use thiserror::Error;

use crate::channel::{Channel, ChannelSnapshot, ChannelState, Rejection};
use crate::command::{self, Request, TranslationError};
use crate::register_map::{ChannelId, RegisterMap, RegisterRole};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("address {0} is not in the register map")]
    UnknownAddress(u16),
    #[error("address {0} is read-only")]
    WriteToReadOnlyRegister(u16),
    #[error("{0} is busy")]
    Busy(ChannelId),
    #[error("{0} is faulted")]
    Faulted(ChannelId),
}

impl From<TranslationError> for DispatchError {
    fn from(err: TranslationError) -> Self {
        match err {
            TranslationError::UnknownAddress(address) => Self::UnknownAddress(address),
            TranslationError::WriteToReadOnlyRegister(address) => {
                Self::WriteToReadOnlyRegister(address)
            }
        }
    }
}

impl DispatchError {
    fn rejected(channel: ChannelId, rejection: Rejection) -> Self {
        match rejection {
            Rejection::Busy => Self::Busy(channel),
            Rejection::Faulted => Self::Faulted(channel),
        }
    }
}

/// Result of a successful register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Accepted(ChannelId),
    Reset(ChannelId),
}

/// Result of a register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Value(u16),
    /// Command and reset registers are served from the transport's store.
    PassThrough,
}

/// Routes register traffic to the two channels.
///
/// Holds no lock of its own; every call touches only the target channel.
#[derive(Debug)]
pub struct Dispatcher {
    map: Arc<RegisterMap>,
    channels: [Arc<Channel>; 2],
}

impl Dispatcher {
    pub fn new(map: Arc<RegisterMap>, channels: [Arc<Channel>; 2]) -> Self {
        debug_assert!(
            ChannelId::ALL
                .iter()
                .all(|id| channels[id.index()].id() == *id)
        );
        Self { map, channels }
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[id.index()]
    }

    pub fn handle_write(&self, address: u16, value: u16) -> Result<Dispatched, DispatchError> {
        let channel_id = command::target_channel(&self.map, address)?;
        let channel = self.channel(channel_id);
        match command::translate(&self.map, address, value, channel.params())? {
            // Rebuilt under the accept lock so a 0 reuses the latest parameters.
            Request::Execute(routed) => channel
                .accept_with(|params| {
                    command::build_command(routed.channel, routed.action, value, params)
                })
                .map(|_| Dispatched::Accepted(channel_id))
                .map_err(|rejection| DispatchError::rejected(channel_id, rejection)),
            Request::Reset(id) => self.reset(id).map(|()| Dispatched::Reset(id)),
        }
    }

    /// Check that a write would be taken without dispatching it. Only a reset
    /// register may target a faulted channel.
    pub fn check_write(&self, address: u16) -> Result<ChannelId, DispatchError> {
        let id = command::target_channel(&self.map, address)?;
        let is_reset = matches!(self.map.role(address), Some(RegisterRole::Reset(_)));
        match self.channel(id).state() {
            ChannelState::Idle => Ok(id),
            ChannelState::Faulted if is_reset => Ok(id),
            ChannelState::Faulted => Err(DispatchError::Faulted(id)),
            ChannelState::Busy => Err(DispatchError::Busy(id)),
        }
    }

    /// A coil dropped back to false. Nothing is dispatched, but the address
    /// must still be a writable one.
    pub fn handle_release(&self, address: u16) -> Result<(), DispatchError> {
        command::target_channel(&self.map, address)?;
        Ok(())
    }

    pub fn handle_read(&self, address: u16) -> Result<ReadOutcome, DispatchError> {
        if let Some(id) = self.map.completion_channel(address) {
            return Ok(ReadOutcome::Value(u16::from(
                self.channel(id).poll_completion(),
            )));
        }
        match self.map.role(address) {
            Some(RegisterRole::Status(id)) => {
                Ok(ReadOutcome::Value(self.channel(id).state().code()))
            }
            Some(
                RegisterRole::Command(..) | RegisterRole::Reset(_) | RegisterRole::Completion(_),
            ) => Ok(ReadOutcome::PassThrough),
            None => Err(DispatchError::UnknownAddress(address)),
        }
    }

    pub fn reset(&self, id: ChannelId) -> Result<(), DispatchError> {
        self.channel(id)
            .reset()
            .map_err(|rejection| DispatchError::rejected(id, rejection))
    }

    pub fn snapshots(&self) -> [ChannelSnapshot; 2] {
        ChannelId::ALL.map(|id| self.channel(id).snapshot())
    }

    pub fn terminate(&self) {
        for channel in &self.channels {
            channel.terminate();
        }
    }
}
