//! Subnet allocation for project networks.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{DeployError, Result};

/// Next free `prefix_len` block after the highest network allocated inside
/// `pool`. The first block of the pool is reserved, so an empty pool yields
/// the second one. Existing networks of any size are skipped entirely.
/// Exhaustion is an error, freed blocks below the highest one are not reused.
pub fn next_subnet(existing: &[Ipv4Net], pool: Ipv4Net, prefix_len: u8) -> Result<Ipv4Net> {
    let initial = Ipv4Net::new(pool.network(), prefix_len)
        .map_err(|e| DeployError::Config(format!("Invalid subnet prefix: {e}")))?
        .trunc();

    let last_used = existing
        .iter()
        .filter(|net| pool.contains(&net.network()))
        .map(|net| u64::from(u32::from(net.broadcast())))
        .fold(u64::from(u32::from(initial.broadcast())), u64::max);

    let block_size = 1u64 << (32 - u32::from(prefix_len));
    let next = (last_used + 1).div_ceil(block_size) * block_size;

    let exhausted = || DeployError::backend_msg("No more possible subnet addresses exist.");
    let next = u32::try_from(next).map_err(|_| exhausted())?;
    let next = Ipv4Net::new(Ipv4Addr::from(next), prefix_len)
        .map_err(|e| DeployError::Config(format!("Invalid subnet prefix: {e}")))?;

    if !pool.contains(&next) {
        return Err(exhausted());
    }
    Ok(next)
}

/// First host address of a subnet.
pub fn gateway(subnet: &Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn pool() -> Ipv4Net {
        net("10.0.0.0/8")
    }

    #[test]
    fn test_first_allocation_skips_reserved_block() {
        assert_eq!(next_subnet(&[], pool(), 24).unwrap(), net("10.0.1.0/24"));
    }

    #[test]
    fn test_allocates_after_highest() {
        let existing = vec![
            net("10.0.5.0/24"),
            net("10.0.1.0/24"),
            net("172.17.0.0/16"),
        ];
        assert_eq!(next_subnet(&existing, pool(), 24).unwrap(), net("10.0.6.0/24"));
    }

    #[test]
    fn test_larger_blocks_advance_by_their_size() {
        let existing = vec![net("10.88.0.0/16")];
        assert_eq!(next_subnet(&existing, pool(), 24).unwrap(), net("10.89.0.0/24"));
    }

    #[test]
    fn test_smaller_networks_do_not_overlap_the_next_block() {
        let existing = vec![net("10.1.0.0/28")];
        let next = next_subnet(&existing, pool(), 24).unwrap();
        assert_eq!(next, net("10.1.1.0/24"));
        assert!(!next.contains(&existing[0].network()));
    }

    #[test]
    fn test_unaligned_highest_network_is_skipped() {
        let existing = vec![net("10.0.1.0/24"), net("10.0.2.64/26")];
        assert_eq!(next_subnet(&existing, pool(), 24).unwrap(), net("10.0.3.0/24"));
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let existing = vec![net("10.255.255.0/24")];
        assert!(next_subnet(&existing, pool(), 24).is_err());
    }

    #[test]
    fn test_gateway() {
        assert_eq!(gateway(&net("10.0.6.0/24")), Ipv4Addr::new(10, 0, 6, 1));
    }
}
