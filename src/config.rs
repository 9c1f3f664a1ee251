//! Tunnel Configuration
//!
//! The kernel ABI constants used to provision and configure a tunnel
//! interface. Defaults are the Darwin values; every field can be
//! overridden from a TOML file so nothing is baked into the call sites.
//! The records those values travel in are not configurable: their layout
//! is the Darwin one (see [`RequestCodes`]).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::control::CTL_NAME_CAPACITY;
use crate::error::{Error, Result};

/// Main tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Kernel control handshake constants
    #[serde(default)]
    pub control: ControlConfig,

    /// Device-request codes for MTU and address configuration
    #[serde(default)]
    pub requests: RequestCodes,

    /// IPv4 address family value, used for frame tags and socket addresses
    #[serde(default = "default_inet_family")]
    pub inet_family: u8,
}

/// Kernel control socket configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Well-known driver name resolved through the control-info request
    #[serde(default = "default_control_name")]
    pub name: String,

    /// Protocol family passed to socket(2) (PF_SYSTEM)
    #[serde(default = "default_system_family")]
    pub domain: i32,

    /// Address family written into the control address (AF_SYSTEM)
    #[serde(default = "default_system_family_u8")]
    pub address_family: u8,

    /// System sub-family for kernel controls (AF_SYS_CONTROL)
    #[serde(default = "default_sys_control")]
    pub sys_address: u16,

    /// Socket protocol (SYSPROTO_CONTROL), also the getsockopt level
    #[serde(default = "default_sysproto_control")]
    pub protocol: i32,

    /// Control-info lookup request (CTLIOCGINFO)
    #[serde(default = "default_info_request")]
    pub info_request: u64,

    /// Socket option returning the assigned interface name (UTUN_OPT_IFNAME)
    #[serde(default = "default_ifname_option")]
    pub ifname_option: i32,
}

/// Legacy device-request codes
///
/// Only the numeric codes are configurable. The records sent with them use
/// the Darwin layouts: a 32-byte `struct ifreq` and a 64-byte
/// `struct ifaliasreq`. Codes from a platform whose `ifreq` is larger
/// (64-bit Linux uses 40 bytes) would let the kernel copy past the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCodes {
    #[serde(default = "default_get_mtu")]
    pub get_mtu: u64,
    #[serde(default = "default_set_mtu")]
    pub set_mtu: u64,
    #[serde(default = "default_get_addr")]
    pub get_addr: u64,
    #[serde(default = "default_get_dst_addr")]
    pub get_dst_addr: u64,
    #[serde(default = "default_get_netmask")]
    pub get_netmask: u64,
    #[serde(default = "default_delete_addr")]
    pub delete_addr: u64,
    #[serde(default = "default_add_addr")]
    pub add_addr: u64,
}

// Default value functions
fn default_control_name() -> String {
    "com.apple.net.utun_control".to_string()
}

fn default_system_family() -> i32 {
    32
}

fn default_system_family_u8() -> u8 {
    32
}

fn default_sys_control() -> u16 {
    2
}

fn default_sysproto_control() -> i32 {
    2
}

fn default_info_request() -> u64 {
    0xc064_4e03
}

fn default_ifname_option() -> i32 {
    2
}

fn default_inet_family() -> u8 {
    2
}

fn default_get_mtu() -> u64 {
    0xc020_6933
}

fn default_set_mtu() -> u64 {
    0x8020_6934
}

fn default_get_addr() -> u64 {
    0xc020_6921
}

fn default_get_dst_addr() -> u64 {
    0xc020_6922
}

fn default_get_netmask() -> u64 {
    0xc020_6925
}

fn default_delete_addr() -> u64 {
    0x8020_6919
}

fn default_add_addr() -> u64 {
    0x8040_691a
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            requests: RequestCodes::default(),
            inet_family: default_inet_family(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            name: default_control_name(),
            domain: default_system_family(),
            address_family: default_system_family_u8(),
            sys_address: default_sys_control(),
            protocol: default_sysproto_control(),
            info_request: default_info_request(),
            ifname_option: default_ifname_option(),
        }
    }
}

impl Default for RequestCodes {
    fn default() -> Self {
        Self {
            get_mtu: default_get_mtu(),
            set_mtu: default_set_mtu(),
            get_addr: default_get_addr(),
            get_dst_addr: default_get_dst_addr(),
            get_netmask: default_get_netmask(),
            delete_addr: default_delete_addr(),
            add_addr: default_add_addr(),
        }
    }
}

impl TunnelConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: TunnelConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.control.name.is_empty() {
            return Err(Error::Config("control.name cannot be empty".into()));
        }

        // ctl_name must keep room for its terminator
        if self.control.name.len() >= CTL_NAME_CAPACITY {
            return Err(Error::Config(format!(
                "control.name must be shorter than {} bytes",
                CTL_NAME_CAPACITY
            )));
        }

        if self.control.name.as_bytes().contains(&0) {
            return Err(Error::Config("control.name cannot contain NUL".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_darwin_values() {
        let config = TunnelConfig::default();
        assert_eq!(config.control.name, "com.apple.net.utun_control");
        assert_eq!(config.control.domain, 32);
        assert_eq!(config.control.protocol, 2);
        assert_eq!(config.control.info_request, 0xc0644e03);
        assert_eq!(config.requests.get_mtu, 0xc0206933);
        assert_eq!(config.requests.add_addr, 0x8040691a);
        assert_eq!(config.inet_family, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TunnelConfig::from_str(
            r#"
            [control]
            info_request = 0x10

            [requests]
            set_mtu = 0x1234
            "#,
        )
        .unwrap();

        assert_eq!(config.control.info_request, 0x10);
        assert_eq!(config.control.name, "com.apple.net.utun_control");
        assert_eq!(config.requests.set_mtu, 0x1234);
        assert_eq!(config.requests.get_mtu, 0xc0206933);
        assert_eq!(config.inet_family, 2);
    }

    #[test]
    fn test_rejects_bad_control_name() {
        let empty = TunnelConfig::from_str("[control]\nname = \"\"\n");
        assert!(matches!(empty, Err(Error::Config(_))));

        let long = format!("[control]\nname = \"{}\"\n", "x".repeat(CTL_NAME_CAPACITY));
        assert!(matches!(TunnelConfig::from_str(&long), Err(Error::Config(_))));

        assert!(matches!(
            TunnelConfig::from_str("[control]\nname = 5\n"),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "inet_family = 2\n\n[control]\nname = \"com.example.tun\"").unwrap();

        let config = TunnelConfig::from_file(file.path()).unwrap();
        assert_eq!(config.control.name, "com.example.tun");

        let missing = TunnelConfig::from_file(Path::new("/nonexistent/utunnel.toml"));
        assert!(matches!(missing, Err(Error::Io(_))));
    }
}
