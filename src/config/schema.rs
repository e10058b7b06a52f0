use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use typeshare::typeshare;

use crate::error::{AppError, Result};
use crate::gadget::{Mode, ModeSet};

/// Main application configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Gadget mode settings
    pub gadget: GadgetConfig,
    /// Local DHCP service settings (P2P mode)
    pub dhcp: DhcpConfig,
    /// External command paths
    pub commands: CommandsConfig,
    /// Control surface settings
    pub web: WebConfig,
    /// Exit after this many idle seconds (disabled if unset)
    pub idle_shutdown_secs: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gadget: GadgetConfig::default(),
            dhcp: DhcpConfig::default(),
            commands: CommandsConfig::default(),
            web: WebConfig::default(),
            idle_shutdown_secs: None,
        }
    }
}

impl AppConfig {
    /// Reject configurations the gadget operations cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.gadget.available_modes.is_empty() {
            return Err(AppError::Config(
                "gadget.available_modes must contain at least one mode".to_string(),
            ));
        }
        if self.gadget.step_timeout_ms == 0 {
            return Err(AppError::Config(
                "gadget.step_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.commands.timeout_ms == 0 {
            return Err(AppError::Config(
                "commands.timeout_ms must be greater than 0".to_string(),
            ));
        }
        let names = [
            ("gadget.kernel_module", &self.gadget.kernel_module),
            ("gadget.technology", &self.gadget.technology),
            ("gadget.interface", &self.gadget.interface),
            ("dhcp.unit", &self.dhcp.unit),
            ("dhcp.lease_time", &self.dhcp.lease_time),
        ];
        for (key, value) in names {
            if value.trim().is_empty() {
                return Err(AppError::Config(format!("{} must not be empty", key)));
            }
        }
        if self.idle_shutdown_secs == Some(0) {
            return Err(AppError::Config(
                "idle_shutdown_secs must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Gadget mode configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GadgetConfig {
    /// Modes this device supports (not detected at runtime)
    pub available_modes: ModeSet,
    /// Ethernet gadget kernel module
    pub kernel_module: String,
    /// Network manager technology type of the gadget
    pub technology: String,
    /// Network interface created by the gadget driver
    pub interface: String,
    /// Bound for every wait on the network manager
    pub step_timeout_ms: u64,
    /// Fixed seed for address block selection (random if unset)
    pub address_seed: Option<u64>,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            available_modes: [Mode::EthernetP2p, Mode::EthernetTethering]
                .into_iter()
                .collect(),
            kernel_module: "g_ether".to_string(),
            technology: "gadget".to_string(),
            interface: "usb0".to_string(),
            step_timeout_ms: 5000,
            address_seed: None,
        }
    }
}

impl GadgetConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// DHCP service configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    /// Service unit serving DHCP on the gadget link
    pub unit: String,
    /// Where the generated configuration is written
    pub config_path: PathBuf,
    /// Lease time, in the DHCP server's notation
    pub lease_time: String,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            unit: "dnsmasq-usb-gadget.service".to_string(),
            config_path: PathBuf::from("/tmp/dnsmasq-volatile.conf"),
            lease_time: "12h".to_string(),
        }
    }
}

/// External command paths
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub lsmod: String,
    pub modprobe: String,
    pub rmmod: String,
    pub systemctl: String,
    /// How long any one command may run (milliseconds)
    pub timeout_ms: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            lsmod: "/sbin/lsmod".to_string(),
            modprobe: "/sbin/modprobe".to_string(),
            rmmod: "/sbin/rmmod".to_string(),
            systemctl: "systemctl".to_string(),
            timeout_ms: 30000,
        }
    }
}

impl CommandsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Control surface configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            http_port: 8099,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.gadget.available_modes.contains(Mode::EthernetP2p));
        assert!(config.gadget.available_modes.contains(Mode::EthernetTethering));
        assert_eq!(config.gadget.step_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "gadget": { "available_modes": ["ethernet_tethering"] },
                "web": { "http_port": 9000 }
            }"#,
        )
        .unwrap();
        assert!(!config.gadget.available_modes.contains(Mode::EthernetP2p));
        assert_eq!(config.gadget.kernel_module, "g_ether");
        assert_eq!(config.web.http_port, 9000);
        assert_eq!(config.web.bind_address, "127.0.0.1");
        assert_eq!(config.dhcp.unit, "dnsmasq-usb-gadget.service");
        assert_eq!(config.commands.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.gadget.available_modes = ModeSet::EMPTY;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let mut config = AppConfig::default();
        config.gadget.step_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let mut config = AppConfig::default();
        config.commands.timeout_ms = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let mut config = AppConfig::default();
        config.gadget.technology = " ".to_string();
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let mut config = AppConfig::default();
        config.idle_shutdown_secs = Some(0);
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }
}
