//! Gadget data types and structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use typeshare::typeshare;

/// USB gadget network mode
///
/// Each mode occupies one bit so that the set of available modes can be
/// expressed as a mask, while the active mode is always a single value.
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Nothing exposed on the gadget
    #[default]
    None,
    /// Point-to-point Ethernet with a private DHCP server
    EthernetP2p,
    /// Host connection shared through the network manager's tethering
    EthernetTethering,
}

impl Mode {
    /// All modes that can actually be activated
    pub const ACTIVATABLE: [Mode; 2] = [Mode::EthernetP2p, Mode::EthernetTethering];

    /// Bit value of this mode
    pub fn bits(self) -> u32 {
        match self {
            Mode::None => 0,
            Mode::EthernetP2p => 1 << 0,
            Mode::EthernetTethering => 1 << 1,
        }
    }

    pub fn is_none(self) -> bool {
        self == Mode::None
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::None => "none",
            Mode::EthernetP2p => "ethernet_p2p",
            Mode::EthernetTethering => "ethernet_tethering",
        };
        f.write_str(name)
    }
}

/// Bitmask of modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Mode>", into = "Vec<Mode>")]
pub struct ModeSet(u32);

impl ModeSet {
    pub const EMPTY: ModeSet = ModeSet(0);

    pub fn from_bits(bits: u32) -> Self {
        let mask = Mode::ACTIVATABLE.iter().fold(0, |acc, m| acc | m.bits());
        Self(bits & mask)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// `Mode::None` is never contained in any set
    pub fn contains(self, mode: Mode) -> bool {
        mode.bits() != 0 && self.0 & mode.bits() == mode.bits()
    }

    pub fn insert(&mut self, mode: Mode) {
        self.0 |= mode.bits();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn modes(self) -> Vec<Mode> {
        Mode::ACTIVATABLE
            .into_iter()
            .filter(|m| self.contains(*m))
            .collect()
    }
}

impl FromIterator<Mode> for ModeSet {
    fn from_iter<T: IntoIterator<Item = Mode>>(iter: T) -> Self {
        let mut set = ModeSet::EMPTY;
        for mode in iter {
            set.insert(mode);
        }
        set
    }
}

impl From<Vec<Mode>> for ModeSet {
    fn from(modes: Vec<Mode>) -> Self {
        modes.into_iter().collect()
    }
}

impl From<ModeSet> for Vec<Mode> {
    fn from(set: ModeSet) -> Self {
        set.modes()
    }
}

/// Exclusivity lock holder
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Identity of the client holding the lock
    pub owner: String,
    /// Free-form reason supplied on acquisition
    pub reason: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(owner: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            reason: reason.into(),
            acquired_at: Utc::now(),
        }
    }
}

/// Gadget status snapshot, as exposed on the control surface
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GadgetStatus {
    /// Currently active mode
    pub active_mode: Mode,
    /// Modes this device can activate
    pub available_modes: Vec<Mode>,
    /// Whether an activation or deactivation is running
    pub in_transition: bool,
    /// Exclusivity lock, if held
    pub lock: Option<LockInfo>,
    /// Cable hotplug detection is not supported on this hardware
    pub can_detect_cable_hotplugging: bool,
    /// Mirrors the active mode
    pub usb_cable_status: Mode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits_are_distinct() {
        assert_eq!(Mode::None.bits(), 0);
        assert_ne!(Mode::EthernetP2p.bits(), Mode::EthernetTethering.bits());
        assert_eq!(Mode::EthernetP2p.bits() & Mode::EthernetTethering.bits(), 0);
    }

    #[test]
    fn test_mode_set_contains() {
        let set: ModeSet = [Mode::EthernetP2p].into_iter().collect();
        assert!(set.contains(Mode::EthernetP2p));
        assert!(!set.contains(Mode::EthernetTethering));
        assert!(!set.contains(Mode::None));
        assert!(!ModeSet::from_bits(u32::MAX).contains(Mode::None));
    }

    #[test]
    fn test_mode_set_serializes_as_list() {
        let set = ModeSet::from_bits(0b11);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["ethernet_p2p","ethernet_tethering"]"#);

        let parsed: ModeSet = serde_json::from_str(r#"["ethernet_tethering"]"#).unwrap();
        assert_eq!(parsed.modes(), vec![Mode::EthernetTethering]);
    }

    #[test]
    fn test_mode_display_matches_serde() {
        for mode in [Mode::None, Mode::EthernetP2p, Mode::EthernetTethering] {
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{}\"", mode));
        }
    }
}
