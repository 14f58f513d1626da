pub const CH1_COMPLETION_ADDRESS: u16 = 1;
pub const CH1_ASPIRATE_ADDRESS: u16 = 2;
pub const CH1_DISPENSE_ADDRESS: u16 = 3;
pub const CH1_HOME_ADDRESS: u16 = 4;
pub const CH1_RESET_ADDRESS: u16 = 9;
pub const CH1_STATUS_ADDRESS: u16 = 11;

pub const CH2_COMPLETION_ADDRESS: u16 = 5;
pub const CH2_ASPIRATE_ADDRESS: u16 = 6;
pub const CH2_DISPENSE_ADDRESS: u16 = 7;
pub const CH2_HOME_ADDRESS: u16 = 8;
pub const CH2_RESET_ADDRESS: u16 = 10;
pub const CH2_STATUS_ADDRESS: u16 = 12;

pub const DEFAULT_VOLUME: u16 = 5000;
pub const DEFAULT_DISPENSE_AMOUNT: u16 = 1250;
pub const DEFAULT_SPEED: u8 = 5;

pub const SPEED_MIN: u8 = 1;
pub const SPEED_MAX: u8 = 10;

pub const DEFAULT_MODBUS_PORT: u16 = 502;
pub const DEFAULT_REGISTER_COUNT: u16 = 100;

pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2_000;

pub const STATUS_IDLE: u16 = 0;
pub const STATUS_BUSY: u16 = 1;
pub const STATUS_FAULTED: u16 = 2;
