//! Address planner (C9): computes per-client source IPv4/IPv6 addresses
//! from a batch's configured range.
//!
//! Grounded in `environment.c`'s address-range handling (the original
//! installs each computed address as a secondary address on the network
//! interface; that installation step is an external collaborator here —
//! this component only produces the string-form addresses, per §4.9).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::errors::LoaderError;

/// Plans one source address per client, either distinct per client
/// (incrementing from `min`) or shared (`ip_shared_num == 1`: every client
/// uses `min`).
pub struct AddressPlanner {
    min: IpAddr,
    max: IpAddr,
    shared: bool,
}

impl AddressPlanner {
    pub fn new(min: IpAddr, max: IpAddr, ip_shared_num: usize) -> Result<Self, LoaderError> {
        match (min, max) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {}
            _ => {
                return Err(LoaderError::Configuration(
                    "IP_ADDR_MIN and IP_ADDR_MAX must be the same address family".into(),
                ))
            }
        }
        Ok(AddressPlanner { min, max, shared: ip_shared_num == 1 })
    }

    /// Produce the address for the `index`-th client (0-based).
    pub fn address_for(&self, index: usize) -> Result<IpAddr, LoaderError> {
        if self.shared {
            return Ok(self.min);
        }
        match (self.min, self.max) {
            (IpAddr::V4(min), IpAddr::V4(max)) => {
                let min_u = u32::from(min);
                let max_u = u32::from(max);
                let candidate = min_u.checked_add(index as u32).ok_or_else(|| {
                    LoaderError::Configuration("IPv4 address range overflowed u32".into())
                })?;
                if candidate > max_u {
                    return Err(LoaderError::Configuration(format!(
                        "client index {index} exceeds the configured IPv4 address range"
                    )));
                }
                Ok(IpAddr::V4(Ipv4Addr::from(candidate)))
            }
            (IpAddr::V6(min), IpAddr::V6(max)) => {
                let candidate = increment_v6(min, index as u128)?;
                if octets_u128(candidate) > octets_u128(max) {
                    return Err(LoaderError::Configuration(format!(
                        "client index {index} exceeds the configured IPv6 address range"
                    )));
                }
                Ok(IpAddr::V6(candidate))
            }
            _ => unreachable!("constructor enforces matching address families"),
        }
    }

    /// Plan addresses for `client_num` clients in one pass.
    pub fn plan(&self, client_num: usize) -> Result<Vec<IpAddr>, LoaderError> {
        (0..client_num).map(|i| self.address_for(i)).collect()
    }
}

fn octets_u128(addr: Ipv6Addr) -> u128 {
    u128::from(addr)
}

/// Byte-wise increment from the least significant byte with carry; carrying
/// into the scope-prefix bytes (indices 0-1) is a configuration error per
/// §4.9.
fn increment_v6(base: Ipv6Addr, by: u128) -> Result<Ipv6Addr, LoaderError> {
    let base_u = u128::from(base);
    let result = base_u.checked_add(by).ok_or_else(|| {
        LoaderError::Configuration("IPv6 address range overflowed u128".into())
    })?;
    let base_bytes = base_u.to_be_bytes();
    let result_bytes = result.to_be_bytes();
    if base_bytes[0] != result_bytes[0] || base_bytes[1] != result_bytes[1] {
        return Err(LoaderError::Configuration(
            "IPv6 address increment carried into the scope-prefix bytes (indices 0-1)".into(),
        ));
    }
    Ok(Ipv6Addr::from(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_v4_addresses_increment_from_min() {
        let planner = AddressPlanner::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10)),
            0,
        )
        .unwrap();
        assert_eq!(planner.address_for(0).unwrap(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(planner.address_for(5).unwrap(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6)));
    }

    #[test]
    fn v4_addresses_rejected_past_max() {
        let planner = AddressPlanner::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            0,
        )
        .unwrap();
        assert!(planner.address_for(5).is_err());
    }

    #[test]
    fn shared_addresses_all_equal_min() {
        let planner = AddressPlanner::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 5)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 50)),
            1,
        )
        .unwrap();
        let all = planner.plan(4).unwrap();
        assert!(all.iter().all(|a| *a == IpAddr::V4(Ipv4Addr::new(192, 168, 0, 5))));
    }

    #[test]
    fn mismatched_families_rejected() {
        let result = AddressPlanner::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn v6_carry_into_scope_prefix_is_rejected() {
        let min: Ipv6Addr = "ffff:0000:0000:0000:0000:0000:0000:fffe".parse().unwrap();
        let max: Ipv6Addr = "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff".parse().unwrap();
        let planner = AddressPlanner::new(IpAddr::V6(min), IpAddr::V6(max), 0).unwrap();
        assert!(planner.address_for(2).is_err());
    }
}
