// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resource lifecycle controller
//!
//! The controller owns the state machine for each `(resource, user)`
//! allocation: absent -> starting -> started -> (stopped | absent), with
//! ping refreshing the expiration on a started allocation.  The
//! start-check-and-flip sequence runs under an exclusive per-record lock so
//! two racing starts provision at most once; the race loser gets the
//! existing allocation back as a success.  The provisioning order matters:
//! the started record (with its claimed subnet) is persisted before any
//! hypervisor call, so a crash mid-provisioning leaves an inspectable record
//! whose cleanup path is an ordinary destroy.

use crate::addresses;
use crate::datastore::DataStore;
use crate::error::Error;
use crate::hypervisor::names;
use crate::hypervisor::Hypervisor;
use crate::model::ActiveAllocation;
use crate::model::AllocationKey;
use crate::model::AllocationStatus;
use crate::model::AllocationView;
use crate::model::PingView;
use crate::model::RangeCreateParams;
use crate::model::RangeView;
use crate::model::Resource;
use crate::model::StatusView;
use crate::model::TemplateCreateParams;
use crate::model::TemplateView;
use crate::model::VmView;
use crate::network::AccessControlBinder;
use crate::network::NetworkAllocator;
use crate::provision::VmProvisioner;
use chrono::Duration;
use chrono::Utc;
use ipnetwork::Ipv4Network;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub struct Controller {
    log: Logger,
    datastore: Arc<DataStore>,
    networks: NetworkAllocator,
    access: AccessControlBinder,
    provisioner: VmProvisioner,
    /// name of the address range allocations claim subnets from
    range_name: String,
    /// how far a start or ping pushes out the expiration
    ttl: Duration,
}

impl Controller {
    pub fn new(
        log: Logger,
        datastore: Arc<DataStore>,
        hypervisor: Arc<dyn Hypervisor>,
        range_name: String,
        ttl: Duration,
    ) -> Controller {
        Controller {
            networks: NetworkAllocator::new(
                log.new(o!("component" => "NetworkAllocator")),
                Arc::clone(&hypervisor),
            ),
            access: AccessControlBinder::new(
                log.new(o!("component" => "AccessControlBinder")),
                Arc::clone(&hypervisor),
            ),
            provisioner: VmProvisioner::new(
                log.new(o!("component" => "VmProvisioner")),
                hypervisor,
            ),
            log,
            datastore,
            range_name,
            ttl,
        }
    }

    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    /*
     * Administration
     */

    pub async fn resource_create(&self, name: &str) -> Result<Resource, Error> {
        let resource = self.datastore.resource_create(name).await?;
        info!(self.log, "created resource"; "resource" => name);
        Ok(resource)
    }

    pub async fn range_create(
        &self,
        params: &RangeCreateParams,
    ) -> Result<RangeView, Error> {
        let network: Ipv4Network =
            params.network.parse().map_err(|e| Error::InvalidValue {
                label: String::from("network"),
                message: format!("{}", e),
            })?;
        let (range, subnets_created) = self
            .datastore
            .range_create(&params.name, network, params.subnet_prefix)
            .await?;
        info!(self.log, "created address range";
            "range" => &range.name,
            "network" => %network,
            "subnets" => subnets_created);
        Ok(RangeView { name: range.name, subnets_created })
    }

    pub async fn template_register(
        &self,
        params: &TemplateCreateParams,
    ) -> Result<TemplateView, Error> {
        let resource = self.datastore.resource_lookup(&params.resource).await?;
        let template = self
            .provisioner
            .template_register(
                &self.datastore,
                &resource,
                &params.name,
                params.memory_mib,
                params.order_id,
                &params.image_file,
            )
            .await?;
        Ok(TemplateView {
            id: template.id,
            name: template.name,
            fingerprint: template.fingerprint,
        })
    }

    /*
     * Lifecycle
     */

    /// Starts (or returns the already-started) allocation of `resource_name`
    /// for `username`.
    pub async fn start_for(
        &self,
        resource_name: &str,
        username: &str,
    ) -> Result<AllocationView, Error> {
        let resource = self.datastore.resource_lookup(resource_name).await?;
        let key = AllocationKey::new(resource_name, username);

        // Everything from the started-check through provisioning runs under
        // the record lock, so a second concurrent start for the same key
        // waits here and then observes the started record.
        let _lock = self.datastore.lock_allocation(&key).await;

        let mut allocation = match self.datastore.allocation_lookup(&key).await
        {
            Some(allocation) if allocation.is_started => {
                // Some other request was faster.  Not an error: return the
                // existing allocation unchanged.
                info!(self.log, "allocation already started";
                    "allocation" => %key);
                return self.allocation_view(&allocation).await;
            }
            Some(allocation) => allocation,
            None => self.datastore.allocation_create(&key).await?,
        };

        let templates =
            self.datastore.templates_for_resource(resource.id).await;
        if templates.is_empty() {
            return Err(Error::InvalidRequest {
                message: format!(
                    "resource \"{}\" has no VM templates",
                    resource_name
                ),
            });
        }

        let subnet = self.datastore.subnet_claim(&self.range_name).await?;

        // Capacity and configuration problems must surface before anything
        // touches the hypervisor, with the subnet claim unwound.
        let slots = match addresses::subnet_slots(subnet.id, subnet.network) {
            Ok(slots) => slots,
            Err(error) => {
                self.datastore.subnet_release(subnet.id).await;
                return Err(error);
            }
        };
        if templates.len() > slots.vm_addrs.len() {
            self.datastore.subnet_release(subnet.id).await;
            return Err(Error::Configuration {
                message: format!(
                    "resource \"{}\" has {} templates but subnets of \
                     \"{}\" have only {} VM slots",
                    resource_name,
                    templates.len(),
                    self.range_name,
                    slots.vm_addrs.len()
                ),
            });
        }

        // Persist the started record before issuing any hypervisor call
        // that could fail, so a crash mid-provisioning leaves a resumable
        // record instead of silently losing the subnet claim.
        allocation.is_started = true;
        allocation.subnet_id = Some(subnet.id);
        allocation.expire_time = Utc::now() + self.ttl;
        self.datastore.allocation_update(&allocation).await?;

        self.networks.ensure(&subnet).await?;
        let network_name = names::network_name(subnet.id);
        let filter_name = names::filter_name(subnet.id);
        for (template, mac) in templates.iter().zip(slots.macs.iter()) {
            let vm = self.datastore.vm_create(allocation.id, template).await?;
            self.provisioner
                .vm_create(vm.id, template, &network_name, &filter_name, *mac)
                .await?;
        }

        // If the user already has an IP of record, admit it.  Best-effort:
        // the allocation is started either way, and the filter can be
        // rewritten when the next assignment notification arrives.
        if let Some(ip) = self.datastore.assigned_ip_lookup(username).await {
            if let Err(error) = self.access.grant(&subnet, ip).await {
                warn!(self.log, "failed to grant access after start";
                    "allocation" => %key,
                    "ip" => %ip,
                    "error" => %error);
            }
        }

        info!(self.log, "started allocation";
            "allocation" => %key,
            "subnet" => %subnet.network,
            "vms" => templates.len());
        self.allocation_view(&allocation).await
    }

    /// Extends a started allocation's expiration to now + TTL.
    pub async fn ping(
        &self,
        resource_name: &str,
        username: &str,
    ) -> Result<PingView, Error> {
        let key = AllocationKey::new(resource_name, username);
        // Under the record lock: a ping racing a stop must not write a
        // stale started record back after teardown.
        let _lock = self.datastore.lock_allocation(&key).await;
        let mut allocation = self.lookup_started(&key).await?;
        allocation.expire_time = Utc::now() + self.ttl;
        self.datastore.allocation_update(&allocation).await?;
        Ok(PingView { id: allocation.id, expire: allocation.expire_time })
    }

    /// Tears down a started allocation and deletes its record.
    pub async fn destroy(
        &self,
        resource_name: &str,
        username: &str,
    ) -> Result<(), Error> {
        let key = AllocationKey::new(resource_name, username);
        let _lock = self.datastore.lock_allocation(&key).await;
        let allocation = self.lookup_started(&key).await?;
        self.teardown(&allocation).await;
        self.datastore.allocation_delete(&key).await;
        info!(self.log, "destroyed allocation"; "allocation" => %key);
        Ok(())
    }

    /// Tears down a started allocation but keeps its record, un-started.
    ///
    /// Rarely used: the public surface exposes destroy.  The record keeps
    /// its last subnet reference for inspection; a later start claims a
    /// fresh subnet.
    pub async fn stop(
        &self,
        resource_name: &str,
        username: &str,
    ) -> Result<(), Error> {
        let key = AllocationKey::new(resource_name, username);
        let _lock = self.datastore.lock_allocation(&key).await;
        let mut allocation = self.lookup_started(&key).await?;
        self.teardown(&allocation).await;
        allocation.is_started = false;
        self.datastore.allocation_update(&allocation).await?;
        info!(self.log, "stopped allocation"; "allocation" => %key);
        Ok(())
    }

    /// Read-only status: "running" with the VM list, or "not running".
    pub async fn status(
        &self,
        resource_name: &str,
        username: &str,
    ) -> Result<StatusView, Error> {
        let key = AllocationKey::new(resource_name, username);
        match self.datastore.allocation_lookup(&key).await {
            Some(allocation) if allocation.is_started => Ok(StatusView {
                status: AllocationStatus::Running,
                resource: Some(self.allocation_view(&allocation).await?),
            }),
            _ => Ok(StatusView {
                status: AllocationStatus::NotRunning,
                resource: None,
            }),
        }
    }

    /// Destroys every started allocation whose expiration has passed,
    /// returning how many were destroyed.  Racing user-triggered destroys
    /// are fine: whichever acts first wins and the loser's attempt is a
    /// no-op.
    pub async fn destroy_expired(&self) -> usize {
        let expired = self.datastore.allocations_expired(Utc::now()).await;
        let mut destroyed = 0;
        for allocation in expired {
            let key = &allocation.key;
            match self.destroy(&key.resource, &key.user).await {
                Ok(()) => destroyed += 1,
                // Lost the race with an explicit destroy; nothing to do.
                Err(Error::NotRunning { .. }) => (),
                Err(error) => {
                    warn!(self.log, "failed to destroy expired allocation";
                        "allocation" => %key,
                        "error" => %error);
                }
            }
        }
        if destroyed > 0 {
            info!(self.log, "destroyed expired allocations";
                "count" => destroyed);
        }
        destroyed
    }

    /*
     * IP assignment notifications
     */

    /// Handles an IP-assigned notification: binds `ip` to `username`
    /// (displacing any other user currently holding that address) and admits
    /// it on every started allocation the user owns.
    pub async fn assign_ip(&self, username: &str, ip: Ipv4Addr) {
        // Unassign first in case a prior notification was lost and the
        // address still belongs to someone else.
        if let Some(displaced) =
            self.datastore.assigned_ip_delete_by_ip(ip).await
        {
            if displaced != username {
                info!(self.log, "IP displaced from prior owner";
                    "ip" => %ip, "prior_owner" => &displaced);
                self.revoke_for_user(&displaced).await;
            }
        }

        self.datastore.assigned_ip_upsert(username, ip).await;
        self.grant_for_user(username, ip).await;
    }

    /// Handles an IP-unassigned notification keyed by username.
    pub async fn unassign_ip_for_user(&self, username: &str) {
        if self
            .datastore
            .assigned_ip_delete_by_user(username)
            .await
            .is_some()
        {
            self.revoke_for_user(username).await;
        }
    }

    /// Handles an IP-unassigned notification keyed by address.
    pub async fn unassign_ip_address(&self, ip: Ipv4Addr) {
        if let Some(owner) = self.datastore.assigned_ip_delete_by_ip(ip).await
        {
            self.revoke_for_user(&owner).await;
        }
    }

    /*
     * Internal helpers
     */

    async fn lookup_started(
        &self,
        key: &AllocationKey,
    ) -> Result<ActiveAllocation, Error> {
        match self.datastore.allocation_lookup(key).await {
            Some(allocation) if allocation.is_started => Ok(allocation),
            Some(_) => Err(Error::NotRunning {
                message: format!("allocation {} is not started", key),
            }),
            None => Err(Error::NotRunning {
                message: format!("no allocation of {}", key),
            }),
        }
    }

    /// Tears down an allocation's VMs, access grant, network, and subnet
    /// claim.  Best-effort throughout: per-step failures are logged and the
    /// teardown keeps going, so it's safely repeatable after partial prior
    /// failures.
    async fn teardown(&self, allocation: &ActiveAllocation) {
        for (vm, _) in
            self.datastore.vms_for_allocation(allocation.id).await
        {
            if let Err(error) = self.provisioner.vm_destroy(vm.id).await {
                warn!(self.log, "failed to destroy VM during teardown";
                    "vm_id" => vm.id,
                    "error" => %error);
            }
            self.datastore.vm_delete(vm.id).await;
        }

        if let Some(subnet_id) = allocation.subnet_id {
            if let Ok(subnet) = self.datastore.subnet_lookup(subnet_id).await {
                if let Err(error) = self.access.revoke(&subnet).await {
                    warn!(self.log, "failed to revoke access during teardown";
                        "subnet" => %subnet.network,
                        "error" => %error);
                }
                self.networks.teardown(&subnet).await;
            }
            self.datastore.subnet_release(subnet_id).await;
        }
    }

    /// Grants `ip` on every started allocation owned by `username`,
    /// best-effort.
    async fn grant_for_user(&self, username: &str, ip: Ipv4Addr) {
        for allocation in
            self.datastore.allocations_started_for_user(username).await
        {
            let Some(subnet_id) = allocation.subnet_id else {
                continue;
            };
            match self.datastore.subnet_lookup(subnet_id).await {
                Ok(subnet) => {
                    if let Err(error) = self.access.grant(&subnet, ip).await {
                        warn!(self.log, "failed to grant access";
                            "allocation" => %allocation.key,
                            "error" => %error);
                    }
                }
                Err(error) => {
                    warn!(self.log, "allocation references missing subnet";
                        "allocation" => %allocation.key,
                        "error" => %error);
                }
            }
        }
    }

    /// Reverts every started allocation owned by `username` to deny-all,
    /// best-effort.
    async fn revoke_for_user(&self, username: &str) {
        for allocation in
            self.datastore.allocations_started_for_user(username).await
        {
            let Some(subnet_id) = allocation.subnet_id else {
                continue;
            };
            match self.datastore.subnet_lookup(subnet_id).await {
                Ok(subnet) => {
                    if let Err(error) = self.access.revoke(&subnet).await {
                        warn!(self.log, "failed to revoke access";
                            "allocation" => %allocation.key,
                            "error" => %error);
                    }
                }
                Err(error) => {
                    warn!(self.log, "allocation references missing subnet";
                        "allocation" => %allocation.key,
                        "error" => %error);
                }
            }
        }
    }

    /// Builds the client view of an allocation: VM names and derived IPs in
    /// template `order_id` order.
    async fn allocation_view(
        &self,
        allocation: &ActiveAllocation,
    ) -> Result<AllocationView, Error> {
        let mut virtual_machines = Vec::new();
        if let Some(subnet_id) = allocation.subnet_id {
            let subnet = self.datastore.subnet_lookup(subnet_id).await?;
            let slots = addresses::subnet_slots(subnet.id, subnet.network)?;
            let vms = self.datastore.vms_for_allocation(allocation.id).await;
            virtual_machines = vms
                .iter()
                .zip(slots.vm_addrs.iter())
                .map(|((_, template), ip)| VmView {
                    name: template.name.clone(),
                    ip: *ip,
                })
                .collect();
        }
        Ok(AllocationView {
            id: allocation.id,
            expire: allocation.expire_time,
            virtual_machines,
        })
    }
}
