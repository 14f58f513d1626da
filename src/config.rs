use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use color_eyre::eyre::{self, WrapErr};
use serde::Deserialize;

use crate::constants::{
    DEFAULT_BAUD, DEFAULT_MODBUS_PORT, DEFAULT_POLL_INTERVAL_MS, DEFAULT_REGISTER_COUNT,
    DEFAULT_RESPONSE_TIMEOUT_MS, SPEED_MAX, SPEED_MIN,
};
use crate::interface::InterfaceMode;
use crate::register_map::{ChannelAddresses, ChannelDefaults, ChannelId, RegisterMap};

/// Optional TOML file. Every key may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub modbus: ModbusSection,
    pub serial: SerialSection,
    pub channel1: ChannelSection,
    pub channel2: ChannelSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModbusSection {
    pub bind: Option<SocketAddr>,
    pub register_count: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSection {
    pub baud: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelSection {
    pub port: Option<String>,
    pub completion_address: Option<u16>,
    pub aspirate_address: Option<u16>,
    pub dispense_address: Option<u16>,
    pub home_address: Option<u16>,
    pub reset_address: Option<u16>,
    pub status_address: Option<u16>,
    pub volume: Option<u16>,
    pub dispense_amount: Option<u16>,
    pub speed: Option<u8>,
}

impl FileConfig {
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let text = fs::read_to_string(path)
            .wrap_err_with(|| format!("read config file {}", path.display()))?;
        toml::from_str(&text).wrap_err_with(|| format!("parse config file {}", path.display()))
    }

    fn section(&self, channel: ChannelId) -> &ChannelSection {
        match channel {
            ChannelId::One => &self.channel1,
            ChannelId::Two => &self.channel2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub port: Option<String>,
    pub addresses: ChannelAddresses,
    pub defaults: ChannelDefaults,
}

impl ChannelConfig {
    fn resolve(channel: ChannelId, section: &ChannelSection) -> Self {
        let base = ChannelAddresses::default_for(channel);
        let defaults = ChannelDefaults::default();
        Self {
            port: section.port.clone(),
            addresses: ChannelAddresses {
                completion: section.completion_address.unwrap_or(base.completion),
                aspirate: section.aspirate_address.unwrap_or(base.aspirate),
                dispense: section.dispense_address.unwrap_or(base.dispense),
                home: section.home_address.unwrap_or(base.home),
                reset: section.reset_address.unwrap_or(base.reset),
                status: section.status_address.unwrap_or(base.status),
            },
            defaults: ChannelDefaults {
                volume: section.volume.unwrap_or(defaults.volume),
                dispense_amount: section.dispense_amount.unwrap_or(defaults.dispense_amount),
                speed: section.speed.unwrap_or(defaults.speed),
            },
        }
    }
}

/// Startup configuration. Fixed once the bridge is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub bind: SocketAddr,
    pub register_count: u16,
    pub baud: u32,
    pub poll_interval: Duration,
    pub response_timeout: Duration,
    pub interface: InterfaceMode,
    pub channels: [ChannelConfig; 2],
}

impl BridgeConfig {
    pub fn from_file(file: &FileConfig, interface: InterfaceMode) -> Self {
        Self {
            bind: file
                .modbus
                .bind
                .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_MODBUS_PORT))),
            register_count: file.modbus.register_count.unwrap_or(DEFAULT_REGISTER_COUNT),
            baud: file.serial.baud.unwrap_or(DEFAULT_BAUD),
            poll_interval: Duration::from_millis(
                file.serial
                    .poll_interval_ms
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            response_timeout: Duration::from_millis(
                file.serial
                    .response_timeout_ms
                    .unwrap_or(DEFAULT_RESPONSE_TIMEOUT_MS),
            ),
            interface,
            channels: ChannelId::ALL.map(|id| ChannelConfig::resolve(id, file.section(id))),
        }
    }

    pub fn channel(&self, id: ChannelId) -> &ChannelConfig {
        &self.channels[id.index()]
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> &mut ChannelConfig {
        &mut self.channels[id.index()]
    }

    /// Build the register map; an address collision is fatal.
    pub fn register_map(&self) -> eyre::Result<RegisterMap> {
        let map = RegisterMap::new(
            self.channels.clone().map(|c| c.addresses),
            self.channels.clone().map(|c| c.defaults),
        )
        .wrap_err("invalid register map")?;
        if map.highest_address() >= self.register_count {
            return Err(eyre::eyre!(
                "register count {} does not cover address {}",
                self.register_count,
                map.highest_address()
            ));
        }
        Ok(map)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        for id in ChannelId::ALL {
            let channel = self.channel(id);
            if !(SPEED_MIN..=SPEED_MAX).contains(&channel.defaults.speed) {
                return Err(eyre::eyre!(
                    "{id}: speed {} outside {SPEED_MIN}..={SPEED_MAX}",
                    channel.defaults.speed
                ));
            }
            if self.interface == InterfaceMode::Serial && channel.port.is_none() {
                return Err(eyre::eyre!(
                    "{id}: serial port required unless using simulation interface"
                ));
            }
        }
        if self.poll_interval.is_zero() {
            return Err(eyre::eyre!("poll interval must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::{BridgeConfig, FileConfig};
    use crate::interface::InterfaceMode;
    use crate::register_map::ChannelId;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(text.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn defaults_follow_robot_layout() {
        let config = BridgeConfig::from_file(&FileConfig::default(), InterfaceMode::Simulation);
        assert_eq!(config.bind.port(), 502);
        assert_eq!(config.register_count, 100);
        assert_eq!(config.baud, 115_200);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.channel(ChannelId::One).addresses.aspirate, 2);
        assert_eq!(config.channel(ChannelId::Two).addresses.completion, 5);
        assert_eq!(config.channel(ChannelId::Two).defaults.volume, 5000);
        config.validate().expect("defaults should validate");
        config.register_map().expect("defaults should map");
    }

    #[test]
    fn loads_partial_file() {
        let file = write_config(
            r#"
[modbus]
bind = "127.0.0.1:1502"

[serial]
poll_interval_ms = 250

[channel1]
port = "/dev/ttyUSB0"
volume = 1000

[channel2]
port = "/dev/ttyUSB1"
speed = 8
"#,
        );
        let loaded = FileConfig::load(file.path()).expect("config should load");
        let config = BridgeConfig::from_file(&loaded, InterfaceMode::Serial);

        assert_eq!(config.bind.port(), 1502);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        let one = config.channel(ChannelId::One);
        assert_eq!(one.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(one.defaults.volume, 1000);
        let two = config.channel(ChannelId::Two);
        assert_eq!(two.defaults.speed, 8);
        assert_eq!(two.addresses.aspirate, 6, "unset keys keep channel 2 defaults");
        config.validate().expect("config should validate");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config("[channel1]\nvolumes = 10\n");
        let err = FileConfig::load(file.path()).expect_err("typo should fail");
        assert!(format!("{err:#}").contains("unknown field `volumes`"));
    }

    #[test]
    fn colliding_addresses_fail_map_construction() {
        let file = write_config("[channel2]\naspirate_address = 2\n");
        let loaded = FileConfig::load(file.path()).expect("config should load");
        let config = BridgeConfig::from_file(&loaded, InterfaceMode::Simulation);
        let err = config.register_map().expect_err("collision should be fatal");
        assert!(format!("{err:#}").contains("address 2"));
    }

    #[test]
    fn register_count_must_cover_map() {
        let file = write_config("[modbus]\nregister_count = 10\n");
        let loaded = FileConfig::load(file.path()).expect("config should load");
        let config = BridgeConfig::from_file(&loaded, InterfaceMode::Simulation);
        let err = config.register_map().expect_err("store too small");
        assert!(err.to_string().contains("does not cover"));
    }

    #[test]
    fn serial_interface_requires_ports() {
        let config = BridgeConfig::from_file(&FileConfig::default(), InterfaceMode::Serial);
        let err = config.validate().expect_err("ports should be required");
        assert!(err.to_string().contains("serial port required"));
    }

    #[test]
    fn speed_out_of_range_is_rejected() {
        let mut config =
            BridgeConfig::from_file(&FileConfig::default(), InterfaceMode::Simulation);
        config.channel_mut(ChannelId::Two).defaults.speed = 11;
        let err = config.validate().expect_err("speed 11 is invalid");
        assert!(err.to_string().contains("channel 2"));
    }
}
