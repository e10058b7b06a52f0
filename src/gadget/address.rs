//! P2P link addressing and DHCP provisioning
//!
//! P2P mode puts the device and the host on a private /29 inside the
//! link-local range:
//!
//! ```text
//! 169.254.X.Y      network (Y is a multiple of 8)
//! 169.254.X.Y+1    device
//! 169.254.X.Y+2..4 DHCP pool for the host
//! ```

use rand::Rng;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{AppError, Result};
use crate::network::Ipv4Config;

/// Netmask of a /29 block
pub const P2P_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 248);

/// Randomly chosen /29 block in 169.254.0.0/16
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressBlock {
    range1: u8,
    range2: u8,
}

impl AddressBlock {
    /// Build a block, aligning `range2` down to the /29 boundary
    ///
    /// `range1` is kept out of 0 and 255, the /24s reserved by RFC 3927.
    pub fn new(range1: u8, range2: u8) -> Result<Self> {
        if range1 == 0 || range1 == 255 {
            return Err(AppError::BadRequest(format!(
                "169.254.{}.0/24 is reserved",
                range1
            )));
        }
        Ok(Self {
            range1,
            range2: range2 & 0xf8,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::new(169, 254, self.range1, self.range2)
    }

    /// Address assigned to the device side of the link
    pub fn device_address(&self) -> Ipv4Addr {
        self.host(1)
    }

    /// First address handed out to the host
    pub fn dhcp_start(&self) -> Ipv4Addr {
        self.host(2)
    }

    /// Last address handed out to the host
    pub fn dhcp_end(&self) -> Ipv4Addr {
        self.host(4)
    }

    fn host(&self, offset: u8) -> Ipv4Addr {
        Ipv4Addr::new(169, 254, self.range1, self.range2 + offset)
    }

    /// Static IPv4 configuration for the gadget service
    pub fn ipv4_config(&self) -> Ipv4Config {
        Ipv4Config::manual(self.device_address().to_string(), P2P_NETMASK.to_string())
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/29", self.network())
    }
}

/// Pick a random /29 block
pub fn choose_address_block<R: Rng + ?Sized>(rng: &mut R) -> AddressBlock {
    let range1 = rng.gen_range(1..=254u8);
    let range2 = rng.gen::<u8>() & 0xf8;
    AddressBlock { range1, range2 }
}

/// Render the DHCP server configuration for a P2P link
pub fn render_dhcp_config(block: &AddressBlock, interface: &str, lease_time: &str) -> String {
    format!(
        "port=0\n\
         interface={interface}\n\
         bind-interfaces\n\
         dhcp-range={start},{end},{netmask},{lease_time}\n\
         dhcp-option=3\n\
         dhcp-option=6\n",
        start = block.dhcp_start(),
        end = block.dhcp_end(),
        netmask = P2P_NETMASK,
    )
}

/// Write the DHCP configuration, replacing any previous one
pub async fn write_dhcp_config(path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content).await.map_err(|e| {
        AppError::FailedRequest(format!(
            "Could not write configuration gadget for P2P connection to {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_block_layout() {
        let block = AddressBlock::new(42, 19).unwrap();
        assert_eq!(block.network(), Ipv4Addr::new(169, 254, 42, 16));
        assert_eq!(block.device_address(), Ipv4Addr::new(169, 254, 42, 17));
        assert_eq!(block.dhcp_start(), Ipv4Addr::new(169, 254, 42, 18));
        assert_eq!(block.dhcp_end(), Ipv4Addr::new(169, 254, 42, 20));
        assert_eq!(block.to_string(), "169.254.42.16/29");
    }

    #[test]
    fn test_last_block_does_not_overflow() {
        let block = AddressBlock::new(254, 255).unwrap();
        assert_eq!(block.dhcp_end(), Ipv4Addr::new(169, 254, 254, 252));
    }

    #[test]
    fn test_reserved_ranges_rejected() {
        assert!(AddressBlock::new(0, 8).is_err());
        assert!(AddressBlock::new(255, 8).is_err());
    }

    #[test]
    fn test_choose_is_deterministic_and_aligned() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..256 {
            let block = choose_address_block(&mut a);
            assert_eq!(block, choose_address_block(&mut b));

            let octets = block.network().octets();
            assert_eq!(octets[0..2], [169, 254]);
            assert!((1..=254).contains(&octets[2]));
            assert_eq!(octets[3] % 8, 0);
        }
    }

    #[test]
    fn test_ipv4_config() {
        let config = AddressBlock::new(3, 8).unwrap().ipv4_config();
        assert_eq!(config.method, "manual");
        assert_eq!(config.address.as_deref(), Some("169.254.3.9"));
        assert_eq!(config.netmask.as_deref(), Some("255.255.255.248"));
    }

    #[test]
    fn test_render_dhcp_config() {
        let block = AddressBlock::new(10, 40).unwrap();
        assert_eq!(
            render_dhcp_config(&block, "usb0", "12h"),
            "port=0\n\
             interface=usb0\n\
             bind-interfaces\n\
             dhcp-range=169.254.10.42,169.254.10.44,255.255.255.248,12h\n\
             dhcp-option=3\n\
             dhcp-option=6\n"
        );
    }

    #[tokio::test]
    async fn test_write_dhcp_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnsmasq-volatile.conf");
        tokio::fs::write(&path, "stale contents that are much longer than the new ones")
            .await
            .unwrap();

        write_dhcp_config(&path, "port=0\n").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "port=0\n");

        let err = write_dhcp_config(&dir.path().join("missing/dir.conf"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::FailedRequest(_)));
    }
}
