use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::constants::{
    CH1_ASPIRATE_ADDRESS, CH1_COMPLETION_ADDRESS, CH1_DISPENSE_ADDRESS, CH1_HOME_ADDRESS,
    CH1_RESET_ADDRESS, CH1_STATUS_ADDRESS, CH2_ASPIRATE_ADDRESS, CH2_COMPLETION_ADDRESS,
    CH2_DISPENSE_ADDRESS, CH2_HOME_ADDRESS, CH2_RESET_ADDRESS, CH2_STATUS_ADDRESS,
    DEFAULT_DISPENSE_AMOUNT, DEFAULT_SPEED, DEFAULT_VOLUME,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    One,
    Two,
}

impl ChannelId {
    pub const ALL: [Self; 2] = [Self::One, Self::Two];

    pub const fn index(self) -> usize {
        match self {
            Self::One => 0,
            Self::Two => 1,
        }
    }

    pub const fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Aspirate,
    Dispense,
    Home,
}

impl ActionKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Aspirate => "aspirate",
            Self::Dispense => "dispense",
            Self::Home => "home",
        }
    }
}

/// What a Modbus address means to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterRole {
    Command(ChannelId, ActionKind),
    Completion(ChannelId),
    Reset(ChannelId),
    Status(ChannelId),
}

impl RegisterRole {
    pub const fn channel(self) -> ChannelId {
        match self {
            Self::Command(channel, _)
            | Self::Completion(channel)
            | Self::Reset(channel)
            | Self::Status(channel) => channel,
        }
    }

    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::Completion(_) | Self::Status(_))
    }
}

impl fmt::Display for RegisterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(channel, action) => write!(f, "{channel} {}", action.label()),
            Self::Completion(channel) => write!(f, "{channel} completion"),
            Self::Reset(channel) => write!(f, "{channel} reset"),
            Self::Status(channel) => write!(f, "{channel} status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAddresses {
    pub completion: u16,
    pub aspirate: u16,
    pub dispense: u16,
    pub home: u16,
    pub reset: u16,
    pub status: u16,
}

impl ChannelAddresses {
    pub const fn default_for(channel: ChannelId) -> Self {
        match channel {
            ChannelId::One => Self {
                completion: CH1_COMPLETION_ADDRESS,
                aspirate: CH1_ASPIRATE_ADDRESS,
                dispense: CH1_DISPENSE_ADDRESS,
                home: CH1_HOME_ADDRESS,
                reset: CH1_RESET_ADDRESS,
                status: CH1_STATUS_ADDRESS,
            },
            ChannelId::Two => Self {
                completion: CH2_COMPLETION_ADDRESS,
                aspirate: CH2_ASPIRATE_ADDRESS,
                dispense: CH2_DISPENSE_ADDRESS,
                home: CH2_HOME_ADDRESS,
                reset: CH2_RESET_ADDRESS,
                status: CH2_STATUS_ADDRESS,
            },
        }
    }

    fn roles(&self, channel: ChannelId) -> [(u16, RegisterRole); 6] {
        [
            (self.completion, RegisterRole::Completion(channel)),
            (
                self.aspirate,
                RegisterRole::Command(channel, ActionKind::Aspirate),
            ),
            (
                self.dispense,
                RegisterRole::Command(channel, ActionKind::Dispense),
            ),
            (self.home, RegisterRole::Command(channel, ActionKind::Home)),
            (self.reset, RegisterRole::Reset(channel)),
            (self.status, RegisterRole::Status(channel)),
        ]
    }
}

/// Operating parameters a channel starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDefaults {
    pub volume: u16,
    pub dispense_amount: u16,
    pub speed: u8,
}

impl Default for ChannelDefaults {
    fn default() -> Self {
        Self {
            volume: DEFAULT_VOLUME,
            dispense_amount: DEFAULT_DISPENSE_AMOUNT,
            speed: DEFAULT_SPEED,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterMapError {
    #[error("address {address} is assigned to both {first} and {second}")]
    DuplicateAddress {
        address: u16,
        first: RegisterRole,
        second: RegisterRole,
    },
}

/// Immutable address table shared by both channels.
///
/// Every address maps to exactly one [`RegisterRole`]; construction fails
/// rather than letting a later entry shadow an earlier one.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    roles: HashMap<u16, RegisterRole>,
    defaults: [ChannelDefaults; 2],
}

impl RegisterMap {
    pub fn new(
        addresses: [ChannelAddresses; 2],
        defaults: [ChannelDefaults; 2],
    ) -> Result<Self, RegisterMapError> {
        let mut roles = HashMap::new();
        for channel in ChannelId::ALL {
            for (address, role) in addresses[channel.index()].roles(channel) {
                if let Some(first) = roles.insert(address, role) {
                    return Err(RegisterMapError::DuplicateAddress {
                        address,
                        first,
                        second: role,
                    });
                }
            }
        }
        Ok(Self { roles, defaults })
    }

    pub fn role(&self, address: u16) -> Option<RegisterRole> {
        self.roles.get(&address).copied()
    }

    pub fn resolve(&self, address: u16) -> Option<(ChannelId, ActionKind)> {
        match self.role(address)? {
            RegisterRole::Command(channel, action) => Some((channel, action)),
            _ => None,
        }
    }

    pub fn completion_channel(&self, address: u16) -> Option<ChannelId> {
        match self.role(address)? {
            RegisterRole::Completion(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn defaults_for(&self, channel: ChannelId) -> ChannelDefaults {
        self.defaults[channel.index()]
    }

    pub fn highest_address(&self) -> u16 {
        self.roles.keys().copied().max().unwrap_or(0)
    }

    /// All mapped addresses in ascending order.
    pub fn entries(&self) -> Vec<(u16, RegisterRole)> {
        let mut entries: Vec<_> = self.roles.iter().map(|(a, r)| (*a, *r)).collect();
        entries.sort_by_key(|(address, _)| *address);
        entries
    }
}

#[cfg(test)]
impl Default for RegisterMap {
    fn default() -> Self {
        Self::new(
            ChannelId::ALL.map(ChannelAddresses::default_for),
            [ChannelDefaults::default(); 2],
        )
        .expect("default layout should be valid")
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ActionKind, ChannelAddresses, ChannelDefaults, ChannelId, RegisterMap, RegisterMapError,
        RegisterRole,
    };

    fn default_addresses() -> [ChannelAddresses; 2] {
        ChannelId::ALL.map(ChannelAddresses::default_for)
    }

    #[test]
    fn default_layout_matches_robot_program() {
        let map = RegisterMap::new(default_addresses(), [ChannelDefaults::default(); 2])
            .expect("default layout should be valid");
        assert_eq!(map.completion_channel(1), Some(ChannelId::One));
        assert_eq!(map.resolve(2), Some((ChannelId::One, ActionKind::Aspirate)));
        assert_eq!(map.resolve(3), Some((ChannelId::One, ActionKind::Dispense)));
        assert_eq!(map.resolve(4), Some((ChannelId::One, ActionKind::Home)));
        assert_eq!(map.completion_channel(5), Some(ChannelId::Two));
        assert_eq!(map.resolve(6), Some((ChannelId::Two, ActionKind::Aspirate)));
        assert_eq!(map.resolve(7), Some((ChannelId::Two, ActionKind::Dispense)));
        assert_eq!(map.resolve(8), Some((ChannelId::Two, ActionKind::Home)));
        assert_eq!(map.role(9), Some(RegisterRole::Reset(ChannelId::One)));
        assert_eq!(map.role(12), Some(RegisterRole::Status(ChannelId::Two)));
    }

    #[test]
    fn default_impl_matches_validated_layout() {
        let validated = RegisterMap::new(default_addresses(), [ChannelDefaults::default(); 2])
            .expect("default layout should be valid");
        assert_eq!(RegisterMap::default().entries(), validated.entries());
    }

    #[test]
    fn completion_address_is_not_a_command() {
        let map = RegisterMap::default();
        assert_eq!(map.resolve(1), None);
        assert_eq!(map.completion_channel(2), None);
    }

    #[test]
    fn unknown_address_resolves_to_nothing() {
        let map = RegisterMap::default();
        assert_eq!(map.role(42), None);
        assert_eq!(map.resolve(42), None);
        assert_eq!(map.completion_channel(42), None);
    }

    #[test]
    fn duplicate_address_across_channels_fails_construction() {
        let mut addresses = default_addresses();
        addresses[1].aspirate = addresses[0].aspirate;

        let err = RegisterMap::new(addresses, [ChannelDefaults::default(); 2])
            .expect_err("collision should be fatal");
        assert_eq!(
            err,
            RegisterMapError::DuplicateAddress {
                address: 2,
                first: RegisterRole::Command(ChannelId::One, ActionKind::Aspirate),
                second: RegisterRole::Command(ChannelId::Two, ActionKind::Aspirate),
            }
        );
        assert!(err.to_string().contains("address 2"));
    }

    #[test]
    fn completion_colliding_with_command_fails_construction() {
        let mut addresses = default_addresses();
        addresses[0].completion = addresses[1].home;

        RegisterMap::new(addresses, [ChannelDefaults::default(); 2])
            .expect_err("completion must be disjoint from commands");
    }

    #[test]
    fn duplicate_within_one_channel_fails_construction() {
        let mut addresses = default_addresses();
        addresses[0].dispense = addresses[0].aspirate;

        RegisterMap::new(addresses, [ChannelDefaults::default(); 2])
            .expect_err("collision inside a channel should be fatal");
    }

    #[test]
    fn defaults_are_per_channel() {
        let defaults = [
            ChannelDefaults::default(),
            ChannelDefaults {
                volume: 300,
                dispense_amount: 100,
                speed: 8,
            },
        ];
        let map = RegisterMap::new(default_addresses(), defaults).expect("valid layout");
        assert_eq!(map.defaults_for(ChannelId::One).volume, 5000);
        assert_eq!(map.defaults_for(ChannelId::Two).speed, 8);
    }

    #[test]
    fn entries_are_sorted_and_highest_address_is_tracked() {
        let map = RegisterMap::default();
        let entries = map.entries();
        assert_eq!(entries.len(), 12);
        assert!(entries.windows(2).all(|pair| pair[0].0 < pair[1].0));
        assert_eq!(map.highest_address(), 12);
    }
}
