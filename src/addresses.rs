// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subnet partitioning and per-slot address/MAC derivation
//!
//! An address range is split into equal-size subnets when it's created.  When
//! an allocation claims a subnet, every address in the subnet is assigned a
//! role: the first is the gateway, the last is reserved for the user's VPN
//! endpoint, and everything in between is a VM slot.  MACs are derived
//! deterministically from the subnet's id and the slot index so that any
//! process can recompute them from the records alone.

use crate::error::Error;
use ipnetwork::Ipv4Network;
use macaddr::MacAddr6;
use std::net::Ipv4Addr;

/// Locally-administered prefix used for all derived MACs (KVM convention).
const MAC_PREFIX: [u8; 3] = [0x54, 0x52, 0x00];

/// Largest subnet for which MACs can be derived (the slot index must fit in
/// the final octet).
const MAX_SUBNET_ADDRESSES: u32 = 256;

/// Largest subnet id that fits in the two MAC octets reserved for it.
const MAX_SUBNET_ID: u32 = 1 << 16;

/// Splits `parent` into consecutive disjoint subnets of prefix length
/// `subnet_prefix`.  Together the returned subnets partition the parent
/// block.
pub fn partition(
    parent: Ipv4Network,
    subnet_prefix: u8,
) -> Result<Vec<Ipv4Network>, Error> {
    if subnet_prefix > 32 || subnet_prefix < parent.prefix() {
        return Err(Error::InvalidValue {
            label: String::from("subnet_prefix"),
            message: format!(
                "cannot split {} into /{} subnets",
                parent, subnet_prefix
            ),
        });
    }

    let step = 1u64 << (32 - subnet_prefix);
    let count = 1u64 << (subnet_prefix - parent.prefix());
    let base = u32::from(parent.network()) as u64;
    let mut subnets = Vec::with_capacity(count as usize);
    for i in 0..count {
        let addr = Ipv4Addr::from((base + i * step) as u32);
        let subnet = Ipv4Network::new(addr, subnet_prefix).map_err(|e| {
            Error::InternalError {
                internal_message: format!("carving subnet of {}: {}", parent, e),
            }
        })?;
        subnets.push(subnet);
    }
    Ok(subnets)
}

/// Fully-derived addressing for one claimed subnet
#[derive(Clone, Debug, PartialEq)]
pub struct SubnetSlots {
    /// first address of the subnet
    pub gateway: Ipv4Addr,
    /// last address of the subnet, never handed to a VM
    pub reserved: Ipv4Addr,
    /// addresses assigned to VM slots, in order
    pub vm_addrs: Vec<Ipv4Addr>,
    /// MAC for each VM slot, index-aligned with `vm_addrs`
    pub macs: Vec<MacAddr6>,
}

/// Derives the slot assignment for a subnet.
///
/// Capacity limits (subnet at most 256 addresses, subnet id within 16 bits)
/// are checked here, before anything touches the hypervisor.
pub fn subnet_slots(
    subnet_id: u32,
    subnet: Ipv4Network,
) -> Result<SubnetSlots, Error> {
    let size = subnet.size();
    if size > MAX_SUBNET_ADDRESSES {
        return Err(Error::Configuration {
            message: format!(
                "subnet {} has {} addresses; the largest supported is a /24",
                subnet, size
            ),
        });
    }
    if subnet_id >= MAX_SUBNET_ID {
        return Err(Error::Configuration {
            message: format!(
                "subnet id {} does not fit in 16 bits",
                subnet_id
            ),
        });
    }
    if size < 4 {
        return Err(Error::Configuration {
            message: format!(
                "subnet {} is too small to hold a gateway, a reserved \
                 address, and at least one VM",
                subnet
            ),
        });
    }

    let mut addrs: Vec<Ipv4Addr> = subnet.iter().collect();
    let gateway = addrs.remove(0);
    let reserved = addrs.pop().unwrap();
    let macs =
        (0..addrs.len()).map(|i| slot_mac(subnet_id, i as u8)).collect();
    Ok(SubnetSlots { gateway, reserved, vm_addrs: addrs, macs })
}

/// Derives the MAC for one VM slot: the locally-administered prefix, the
/// subnet id split across two octets, and the slot index.
fn slot_mac(subnet_id: u32, slot: u8) -> MacAddr6 {
    MacAddr6::new(
        MAC_PREFIX[0],
        MAC_PREFIX[1],
        MAC_PREFIX[2],
        (subnet_id >> 8) as u8,
        (subnet_id & 0xff) as u8,
        slot,
    )
}
