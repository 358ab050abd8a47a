//! Network interface enumeration.

use std::net::Ipv4Addr;

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};

use crate::error::{Error, Result};

/// One usable IPv4 interface address: the discovery sockets bind per
/// interface, and the netmask drives the same-subnet filter on received
/// advertisements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub index: u32,
}

impl Iface {
    /// Enumerates non-loopback IPv4 addresses that carry a netmask.
    pub fn list() -> Result<Vec<Iface>> {
        let nics = NetworkInterface::show()
            .map_err(|e| Error::Transport(format!("list network interfaces: {e}")))?;
        let mut out = Vec::new();
        for nic in nics {
            for addr in &nic.addr {
                let Addr::V4(v4) = addr else { continue };
                if v4.ip.is_loopback() {
                    continue;
                }
                let Some(netmask) = v4.netmask else { continue };
                out.push(Iface {
                    name: nic.name.clone(),
                    addr: v4.ip,
                    netmask,
                    index: nic.index,
                });
            }
        }
        Ok(out)
    }

    /// Prefix-masked compare against this interface's subnet.
    pub fn same_subnet(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }
}

impl std::fmt::Display for Iface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.addr)
    }
}
