use crate::channel::DeviceSignal;
use crate::register_map::ActionKind;

pub const MSG_GET_INFO: u16 = 0x01;
pub const MSG_GET_ACTION_STATUS: u16 = 0x02;
pub const MSG_SET_ACTION: u16 = 0x05;

pub const ACTION_ASPIRATE: u8 = 1;
pub const ACTION_DISPENSE: u8 = 2;
pub const ACTION_HOME_PIPETTE: u8 = 8;

pub const DISPLAY_MESSAGE_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Accepted,
    UnknownMessageType,
    ValueOutOfRange,
    HardwareError,
    NotAccepted,
    Other(u16),
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        match code {
            0 => Self::Accepted,
            1 => Self::UnknownMessageType,
            2 => Self::ValueOutOfRange,
            3 => Self::HardwareError,
            4 => Self::NotAccepted,
            other => Self::Other(other),
        }
    }
}

impl StatusCode {
    pub fn describe(self) -> String {
        match self {
            Self::Accepted => "command accepted".into(),
            Self::UnknownMessageType => "unknown message type".into(),
            Self::ValueOutOfRange => "value out of range".into(),
            Self::HardwareError => "hardware error".into(),
            Self::NotAccepted => "command not accepted".into(),
            Self::Other(code) => format!("unknown status code 0x{code:02X}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Ready,
    WaitForBlowIn,
    WaitForRunKey,
    Busy,
    NotHomed,
    UserAbort,
    Unknown(u16),
}

impl From<u16> for ActionStatus {
    fn from(code: u16) -> Self {
        match code {
            0 => Self::Ready,
            1 => Self::WaitForBlowIn,
            2 => Self::WaitForRunKey,
            3 => Self::Busy,
            4 => Self::NotHomed,
            5 => Self::UserAbort,
            other => Self::Unknown(other),
        }
    }
}

/// Decoded `GET_ACTION_STATUS` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub action: ActionStatus,
    pub hardware_error: u16,
}

impl DeviceStatus {
    pub fn from_data(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        Some(Self {
            action: ActionStatus::from(u16::from_be_bytes([data[0], data[1]])),
            hardware_error: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    /// Waiting for blow-in still means the last action finished.
    pub fn signal(self) -> DeviceSignal {
        if self.hardware_error != 0 {
            return DeviceSignal::Error(format!("hardware error {}", self.hardware_error));
        }
        match self.action {
            ActionStatus::Ready | ActionStatus::WaitForBlowIn => DeviceSignal::Completed,
            ActionStatus::UserAbort => DeviceSignal::Error("action aborted by user".into()),
            ActionStatus::WaitForRunKey
            | ActionStatus::Busy
            | ActionStatus::NotHomed
            | ActionStatus::Unknown(_) => DeviceSignal::Pending,
        }
    }
}

/// Decoded `GET_INFO` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipetteInfo {
    pub firmware: (u8, u8),
    pub hardware: u8,
    pub serial_number: u32,
    pub model_type: u16,
}

impl PipetteInfo {
    pub fn from_data(data: &[u8]) -> Option<Self> {
        if data.len() < 10 {
            return None;
        }
        Some(Self {
            firmware: (data[0], data[1]),
            hardware: data[3],
            serial_number: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            model_type: u16::from_be_bytes([data[8], data[9]]),
        })
    }
}

pub const fn action_code(action: ActionKind) -> u8 {
    match action {
        ActionKind::Aspirate => ACTION_ASPIRATE,
        ActionKind::Dispense => ACTION_DISPENSE,
        ActionKind::Home => ACTION_HOME_PIPETTE,
    }
}

/// Text shown on the pipette display while the action runs.
pub fn display_message(action: ActionKind) -> [u8; DISPLAY_MESSAGE_LEN] {
    let text = match action {
        ActionKind::Aspirate => "ASPIRATE...",
        ActionKind::Dispense => "DISPENSE...",
        ActionKind::Home => "HOME_PIPETTE...",
    };
    let mut message = [0u8; DISPLAY_MESSAGE_LEN];
    let len = text.len().min(DISPLAY_MESSAGE_LEN);
    message[..len].copy_from_slice(&text.as_bytes()[..len]);
    message
}
