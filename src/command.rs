use std::fmt;

use thiserror::Error;

use crate::register_map::{ActionKind, ChannelId, RegisterMap, RegisterRole};

/// Written value meaning "repeat with the channel's last parameter".
pub const REUSE_LAST_PARAMETER: u16 = 0;

/// Parameters a channel last executed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParams {
    pub volume: u16,
    pub dispense_amount: u16,
    pub speed: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub channel: ChannelId,
    pub action: ActionKind,
    pub volume: u16,
    pub dispense_amount: u16,
    pub speed: u8,
}

impl Command {
    /// Volume field sent to the pipette for this action.
    pub const fn device_volume(&self) -> u16 {
        match self.action {
            ActionKind::Aspirate => self.volume,
            ActionKind::Dispense => self.dispense_amount,
            ActionKind::Home => 0,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action {
            ActionKind::Home => write!(f, "home (speed {})", self.speed),
            action => write!(
                f,
                "{} {} (speed {})",
                action.label(),
                self.device_volume(),
                self.speed
            ),
        }
    }
}

/// What a register write asks a channel to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Execute(Command),
    Reset(ChannelId),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TranslationError {
    #[error("address {0} is not in the register map")]
    UnknownAddress(u16),
    #[error("address {0} is read-only")]
    WriteToReadOnlyRegister(u16),
}

/// Channel a write to `address` would land on, if any.
pub fn target_channel(map: &RegisterMap, address: u16) -> Result<ChannelId, TranslationError> {
    match map.role(address) {
        Some(role) if role.is_read_only() => Err(TranslationError::WriteToReadOnlyRegister(address)),
        Some(role) => Ok(role.channel()),
        None => Err(TranslationError::UnknownAddress(address)),
    }
}

/// Turn one register write into a request for a channel.
///
/// `current` is the target channel's parameter snapshot; the written value
/// replaces only the parameter the action uses.
pub fn translate(
    map: &RegisterMap,
    address: u16,
    value: u16,
    current: ChannelParams,
) -> Result<Request, TranslationError> {
    let Some((channel, action)) = map.resolve(address) else {
        return match map.role(address) {
            Some(RegisterRole::Reset(channel)) => Ok(Request::Reset(channel)),
            Some(_) => Err(TranslationError::WriteToReadOnlyRegister(address)),
            None => Err(TranslationError::UnknownAddress(address)),
        };
    };

    Ok(Request::Execute(build_command(channel, action, value, current)))
}

/// Command for `action` with `value` applied over the channel's parameters.
pub fn build_command(
    channel: ChannelId,
    action: ActionKind,
    value: u16,
    current: ChannelParams,
) -> Command {
    let parameter = |last: u16| {
        if value == REUSE_LAST_PARAMETER {
            last
        } else {
            value
        }
    };

    let mut command = Command {
        channel,
        action,
        volume: current.volume,
        dispense_amount: current.dispense_amount,
        speed: current.speed,
    };
    match action {
        ActionKind::Aspirate => command.volume = parameter(current.volume),
        ActionKind::Dispense => command.dispense_amount = parameter(current.dispense_amount),
        ActionKind::Home => {}
    }
    command
}
