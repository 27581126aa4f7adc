//! Static IP kernel arguments
//!
//! Renders the dracut `ip=` and `nameserver=` arguments the guest reads from
//! `guestinfo.afterburn.initrd.network-kargs` on first boot.

use std::net::IpAddr;

use ipnet::IpNet;

use machine_api_common::crd::NetworkDeviceSpec;

use crate::error::{Error, Result};

/// Address handed out by an IPAM pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolAddress {
    /// Address without prefix
    pub address: String,
    /// Prefix length
    pub prefix: u8,
    /// Gateway provided by the pool
    pub gateway: Option<String>,
}

/// Render kernel arguments for all devices
///
/// `pool_addresses[i]` holds the bound pool addresses of `devices[i]`; it may
/// be shorter than `devices` when no pools are used.
pub fn render_kargs(
    machine: &str,
    devices: &[NetworkDeviceSpec],
    pool_addresses: &[Vec<PoolAddress>],
) -> Result<String> {
    let mut tokens = Vec::new();
    for (i, device) in devices.iter().enumerate() {
        let pooled = pool_addresses.get(i).map(Vec::as_slice).unwrap_or_default();
        tokens.extend(device_kargs(machine, device, pooled)?);
    }
    Ok(tokens.join(" ").trim().to_string())
}

fn device_kargs(
    machine: &str,
    device: &NetworkDeviceSpec,
    pooled: &[PoolAddress],
) -> Result<Vec<String>> {
    let mut gateway = device.gateway.clone().unwrap_or_default();
    let mut addresses = device.ip_addrs.clone();
    for address in pooled {
        addresses.push(format!("{}/{}", address.address, address.prefix));
        if let Some(pool_gateway) = address.gateway.as_deref().filter(|g| !g.is_empty()) {
            gateway = pool_gateway.to_string();
        }
    }

    let mut tokens = Vec::with_capacity(addresses.len() + device.nameservers.len());
    for address in &addresses {
        let net: IpNet = address.parse().map_err(|_| {
            Error::invalid_configuration(
                machine,
                format!("address {address} is not a valid IPv4 or IPv6 CIDR"),
            )
        })?;
        tokens.push(match net {
            IpNet::V4(v4) => format!("ip={}::{}:{}:::none", v4.addr(), gateway, v4.netmask()),
            IpNet::V6(v6) => match gateway.parse::<IpAddr>() {
                Ok(IpAddr::V6(gw)) => {
                    format!("ip=[{}]::[{}]:{}:::none", v6.addr(), gw, v6.prefix_len())
                }
                _ => format!("ip=[{}]:::{}:::none", v6.addr(), v6.prefix_len()),
            },
        });
    }

    for nameserver in &device.nameservers {
        tokens.push(match nameserver.parse::<IpAddr>() {
            Ok(IpAddr::V6(ns)) => format!("nameserver=[{ns}]"),
            _ => format!("nameserver={nameserver}"),
        });
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(ip_addrs: &[&str], gateway: Option<&str>, nameservers: &[&str]) -> NetworkDeviceSpec {
        NetworkDeviceSpec {
            network_name: "VM Network".to_string(),
            gateway: gateway.map(str::to_string),
            ip_addrs: ip_addrs.iter().map(|s| s.to_string()).collect(),
            nameservers: nameservers.iter().map(|s| s.to_string()).collect(),
            addresses_from_pools: Vec::new(),
        }
    }

    #[test]
    fn ipv4_static_address() {
        let devices = [device(&["192.168.1.2/24"], Some("192.168.1.1"), &["192.168.1.100"])];
        assert_eq!(
            render_kargs("m", &devices, &[]).unwrap(),
            "ip=192.168.1.2::192.168.1.1:255.255.255.0:::none nameserver=192.168.1.100"
        );
    }

    #[test]
    fn dual_stack_omits_ipv4_gateway_for_ipv6() {
        let devices = [device(
            &["192.168.1.2/24", "2001::2/64"],
            Some("192.168.1.1"),
            &["192.168.1.100"],
        )];
        assert_eq!(
            render_kargs("m", &devices, &[]).unwrap(),
            "ip=192.168.1.2::192.168.1.1:255.255.255.0:::none ip=[2001::2]:::64:::none nameserver=192.168.1.100"
        );
    }

    #[test]
    fn ipv6_gateway_and_nameserver_are_bracketed() {
        let devices = [device(&["2001::2/64"], Some("2001::1"), &["2001::53"])];
        assert_eq!(
            render_kargs("m", &devices, &[]).unwrap(),
            "ip=[2001::2]::[2001::1]:64:::none nameserver=[2001::53]"
        );
    }

    #[test]
    fn pool_gateway_overrides_configured_gateway() {
        let devices = [device(&[], Some("10.0.0.1"), &[])];
        let pooled = vec![vec![PoolAddress {
            address: "10.0.0.20".to_string(),
            prefix: 16,
            gateway: Some("10.0.0.254".to_string()),
        }]];
        assert_eq!(
            render_kargs("m", &devices, &pooled).unwrap(),
            "ip=10.0.0.20::10.0.0.254:255.255.0.0:::none"
        );
    }

    #[test]
    fn multiple_devices_are_space_separated() {
        let devices = [
            device(&["192.168.1.2/24"], Some("192.168.1.1"), &[]),
            device(&["10.1.0.5/8"], None, &[]),
        ];
        assert_eq!(
            render_kargs("m", &devices, &[]).unwrap(),
            "ip=192.168.1.2::192.168.1.1:255.255.255.0:::none ip=10.1.0.5:::255.0.0.0:::none"
        );
    }

    #[test]
    fn invalid_address_is_configuration_error() {
        let devices = [device(&["not-an-ip"], None, &[])];
        let err = render_kargs("worker-0", &devices, &[]).unwrap_err();
        assert!(err.is_invalid_configuration());
        assert!(err.to_string().contains("not-an-ip"));
    }

    #[test]
    fn devices_without_addresses_render_nothing() {
        let devices = [device(&[], None, &[])];
        assert_eq!(render_kargs("m", &devices, &[]).unwrap(), "");
    }
}
