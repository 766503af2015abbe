// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Materializing isolated L2 networks and their access control
//!
//! [`NetworkAllocator`] turns a claimed subnet into a hypervisor network plus
//! a deny-all traffic filter; [`AccessControlBinder`] rewrites that filter so
//! exactly one external IP (the allocation owner's current VPN address) is
//! admitted.  Teardown is best-effort: a network that's already gone is
//! success, and errors while stopping or undefining are logged and swallowed
//! so cleanup makes maximum forward progress.

use crate::addresses;
use crate::error::Error;
use crate::hypervisor::filter_uuid;
use crate::hypervisor::names;
use crate::hypervisor::FilterConfig;
use crate::hypervisor::Hypervisor;
use crate::hypervisor::NetworkConfig;
use crate::hypervisor::StaticHost;
use crate::model::Subnet;
use slog::info;
use slog::warn;
use slog::Logger;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub struct NetworkAllocator {
    log: Logger,
    hypervisor: Arc<dyn Hypervisor>,
}

impl NetworkAllocator {
    pub fn new(log: Logger, hypervisor: Arc<dyn Hypervisor>) -> Self {
        NetworkAllocator { log, hypervisor }
    }

    /// Materializes the isolated network for a claimed subnet.
    ///
    /// Idempotent: if the hypervisor already has a network under the subnet's
    /// derived name, it's returned unchanged.  Otherwise this defines the
    /// network (gateway, DHCP range over the VM slots, one static lease per
    /// slot) marked autostart, plus a deny-all traffic filter scoped to the
    /// subnet.
    pub async fn ensure(&self, subnet: &Subnet) -> Result<(), Error> {
        let network_name = names::network_name(subnet.id);
        if self.hypervisor.network_lookup(&network_name).await? {
            return Ok(());
        }

        let slots = addresses::subnet_slots(subnet.id, subnet.network)?;
        let hosts = slots
            .vm_addrs
            .iter()
            .zip(slots.macs.iter())
            .enumerate()
            .map(|(i, (addr, mac))| StaticHost {
                name: format!("vm{:02}", i),
                addr: *addr,
                mac: *mac,
            })
            .collect::<Vec<_>>();

        let config = NetworkConfig {
            name: network_name.clone(),
            subnet: subnet.network,
            gateway: slots.gateway,
            dhcp_start: *slots.vm_addrs.first().unwrap(),
            dhcp_end: *slots.vm_addrs.last().unwrap(),
            hosts,
            autostart: true,
        };
        self.hypervisor.network_define(&config).await?;

        // Until the owner's IP is granted, the network admits nobody.
        let filter_name = names::filter_name(subnet.id);
        self.hypervisor
            .filter_define(&FilterConfig {
                name: filter_name.clone(),
                uuid: filter_uuid(&filter_name),
                subnet: subnet.network,
                allowed_source: None,
            })
            .await?;

        info!(self.log, "materialized network";
            "network" => &network_name,
            "subnet" => %subnet.network);
        Ok(())
    }

    /// Tears down the subnet's network and filter, best-effort.
    ///
    /// A network that's already absent counts as torn down.  Failures while
    /// stopping or undefining are logged and swallowed.
    pub async fn teardown(&self, subnet: &Subnet) {
        let network_name = names::network_name(subnet.id);
        match self.hypervisor.network_lookup(&network_name).await {
            Ok(false) => return,
            Ok(true) => (),
            Err(error) => {
                warn!(self.log, "network lookup failed during teardown";
                    "network" => &network_name,
                    "error" => %error);
                return;
            }
        }

        if let Err(error) = self.hypervisor.network_destroy(&network_name).await
        {
            if !error.is_already_gone() {
                warn!(self.log, "failed to stop network";
                    "network" => &network_name,
                    "error" => %error);
            }
        }
        if let Err(error) =
            self.hypervisor.network_undefine(&network_name).await
        {
            if !error.is_already_gone() {
                warn!(self.log, "failed to undefine network";
                    "network" => &network_name,
                    "error" => %error);
            }
        }

        let filter_name = names::filter_name(subnet.id);
        if let Err(error) = self.hypervisor.filter_undefine(&filter_name).await
        {
            if !error.is_already_gone() {
                warn!(self.log, "failed to undefine filter";
                    "filter" => &filter_name,
                    "error" => %error);
            }
        }

        info!(self.log, "tore down network"; "network" => &network_name);
    }
}

pub struct AccessControlBinder {
    log: Logger,
    hypervisor: Arc<dyn Hypervisor>,
}

impl AccessControlBinder {
    pub fn new(log: Logger, hypervisor: Arc<dyn Hypervisor>) -> Self {
        AccessControlBinder { log, hypervisor }
    }

    /// Rewrites the subnet's filter to admit exactly `ip`.  Replaces any
    /// prior grant; idempotent for the same input.
    pub async fn grant(&self, subnet: &Subnet, ip: Ipv4Addr) -> Result<(), Error> {
        self.define_filter(subnet, Some(ip)).await?;
        info!(self.log, "granted access";
            "subnet" => %subnet.network, "ip" => %ip);
        Ok(())
    }

    /// Rewrites the subnet's filter to deny all external ingress.
    pub async fn revoke(&self, subnet: &Subnet) -> Result<(), Error> {
        self.define_filter(subnet, None).await?;
        info!(self.log, "revoked access"; "subnet" => %subnet.network);
        Ok(())
    }

    async fn define_filter(
        &self,
        subnet: &Subnet,
        allowed_source: Option<Ipv4Addr>,
    ) -> Result<(), Error> {
        let filter_name = names::filter_name(subnet.id);
        self.hypervisor
            .filter_define(&FilterConfig {
                uuid: filter_uuid(&filter_name),
                name: filter_name,
                subnet: subnet.network,
                allowed_source,
            })
            .await?;
        Ok(())
    }
}
