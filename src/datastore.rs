// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory data storage for the control plane
//!
//! The persisted store is the single source of truth for subnet in-use bits
//! and allocation state.  This implementation keeps all tables behind one
//! async mutex, which makes every individual operation transactional, and
//! offers a per-allocation record lock ([`DataStore::lock_allocation`]) as
//! the "select for update" primitive the lifecycle controller needs for its
//! start-check-and-flip sequence.  Swapping in a relational store means
//! reimplementing this interface, not the callers.

use crate::addresses;
use crate::error::Error;
use crate::error::ResourceType;
use crate::model::ActiveAllocation;
use crate::model::AddressRange;
use crate::model::AllocationKey;
use crate::model::Resource;
use crate::model::ResourceKind;
use crate::model::Subnet;
use crate::model::VmInstance;
use crate::model::VmTemplate;
use chrono::DateTime;
use chrono::Utc;
use ipnetwork::Ipv4Network;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

/// Exclusive, transaction-scoped lock on one allocation record
pub type AllocationLock = OwnedMutexGuard<()>;

#[derive(Default)]
struct Tables {
    next_id: u32,
    resources: BTreeMap<String, Resource>,
    ranges: BTreeMap<String, AddressRange>,
    subnets: BTreeMap<u32, Subnet>,
    templates: BTreeMap<u32, VmTemplate>,
    allocations: BTreeMap<AllocationKey, ActiveAllocation>,
    vms: BTreeMap<u32, VmInstance>,
    assigned_ips: BTreeMap<String, Ipv4Addr>,
}

impl Tables {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct DataStore {
    data: Mutex<Tables>,
    allocation_locks: Mutex<BTreeMap<AllocationKey, Arc<Mutex<()>>>>,
}

impl DataStore {
    pub fn new() -> DataStore {
        DataStore {
            data: Mutex::new(Tables::default()),
            allocation_locks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Acquires the exclusive record lock for one `(resource, user)` key.
    ///
    /// The start-check-and-flip sequence in the lifecycle controller runs
    /// under this lock so that two simultaneous starts for the same key
    /// cannot both provision.  The guard is owned and can be held across
    /// hypervisor calls.
    pub async fn lock_allocation(&self, key: &AllocationKey) -> AllocationLock {
        let lock = {
            let mut locks = self.allocation_locks.lock().await;
            Arc::clone(
                locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /*
     * Resources
     */

    pub async fn resource_create(&self, name: &str) -> Result<Resource, Error> {
        let mut data = self.data.lock().await;
        if data.resources.contains_key(name) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Resource,
                name: name.to_owned(),
            });
        }
        let resource = Resource {
            id: data.next_id(),
            name: name.to_owned(),
            kind: ResourceKind::Vmnet,
        };
        data.resources.insert(name.to_owned(), resource.clone());
        Ok(resource)
    }

    pub async fn resource_lookup(&self, name: &str) -> Result<Resource, Error> {
        self.data
            .lock()
            .await
            .resources
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceType::Resource, name))
    }

    /*
     * Address ranges and subnets
     */

    /// Creates an address range and eagerly materializes all of its subnet
    /// records.  This happens exactly once, at range-creation time.
    pub async fn range_create(
        &self,
        name: &str,
        network: Ipv4Network,
        subnet_prefix: u8,
    ) -> Result<(AddressRange, usize), Error> {
        let blocks = addresses::partition(network, subnet_prefix)?;
        let mut data = self.data.lock().await;
        if data.ranges.contains_key(name) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::AddressRange,
                name: name.to_owned(),
            });
        }
        let range =
            AddressRange { name: name.to_owned(), network, subnet_prefix };
        data.ranges.insert(name.to_owned(), range.clone());
        let count = blocks.len();
        for block in blocks {
            let id = data.next_id();
            data.subnets.insert(
                id,
                Subnet {
                    id,
                    range_name: name.to_owned(),
                    network: block,
                    in_use: false,
                },
            );
        }
        Ok((range, count))
    }

    /// Claims one free subnet from the named range, marking it in-use.
    ///
    /// The claim is atomic: candidate selection and the in-use flip happen
    /// under the table lock, so two concurrent claims never return the same
    /// subnet.  Fails with `CapacityExhausted` when every subnet is taken.
    pub async fn subnet_claim(&self, range_name: &str) -> Result<Subnet, Error> {
        let mut data = self.data.lock().await;
        if !data.ranges.contains_key(range_name) {
            return Err(Error::not_found(
                ResourceType::AddressRange,
                range_name,
            ));
        }
        let subnet = data
            .subnets
            .values_mut()
            .find(|s| s.range_name == range_name && !s.in_use)
            .ok_or_else(|| Error::CapacityExhausted {
                message: format!(
                    "no free subnet in address range \"{}\"",
                    range_name
                ),
            })?;
        subnet.in_use = true;
        Ok(subnet.clone())
    }

    /// Marks a subnet free again.  Idempotent: releasing an already-free (or
    /// unknown) subnet is a no-op.
    pub async fn subnet_release(&self, subnet_id: u32) {
        let mut data = self.data.lock().await;
        if let Some(subnet) = data.subnets.get_mut(&subnet_id) {
            subnet.in_use = false;
        }
    }

    pub async fn subnet_lookup(&self, subnet_id: u32) -> Result<Subnet, Error> {
        self.data.lock().await.subnets.get(&subnet_id).cloned().ok_or_else(
            || {
                Error::not_found(
                    ResourceType::Subnet,
                    &subnet_id.to_string(),
                )
            },
        )
    }

    /*
     * VM templates
     */

    pub async fn template_create(
        &self,
        resource_id: u32,
        name: &str,
        memory_mib: u32,
        fingerprint: &str,
        order_id: u32,
    ) -> Result<VmTemplate, Error> {
        let mut data = self.data.lock().await;
        let template = VmTemplate {
            id: data.next_id(),
            resource_id,
            name: name.to_owned(),
            memory_mib,
            fingerprint: fingerprint.to_owned(),
            order_id,
        };
        data.templates.insert(template.id, template.clone());
        Ok(template)
    }

    /// Returns the templates of a resource bundle in `order_id` order.
    pub async fn templates_for_resource(
        &self,
        resource_id: u32,
    ) -> Vec<VmTemplate> {
        let data = self.data.lock().await;
        let mut templates: Vec<_> = data
            .templates
            .values()
            .filter(|t| t.resource_id == resource_id)
            .cloned()
            .collect();
        templates.sort_by_key(|t| (t.order_id, t.id));
        templates
    }

    pub async fn template_lookup(
        &self,
        template_id: u32,
    ) -> Result<VmTemplate, Error> {
        self.data
            .lock()
            .await
            .templates
            .get(&template_id)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(
                    ResourceType::VmTemplate,
                    &template_id.to_string(),
                )
            })
    }

    /*
     * Allocations
     */

    pub async fn allocation_lookup(
        &self,
        key: &AllocationKey,
    ) -> Option<ActiveAllocation> {
        self.data.lock().await.allocations.get(key).cloned()
    }

    /// Creates an allocation record in the un-started state.
    pub async fn allocation_create(
        &self,
        key: &AllocationKey,
    ) -> Result<ActiveAllocation, Error> {
        let mut data = self.data.lock().await;
        if data.allocations.contains_key(key) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Allocation,
                name: key.to_string(),
            });
        }
        let allocation = ActiveAllocation {
            id: data.next_id(),
            key: key.clone(),
            subnet_id: None,
            expire_time: Utc::now(),
            is_started: false,
        };
        data.allocations.insert(key.clone(), allocation.clone());
        Ok(allocation)
    }

    pub async fn allocation_update(
        &self,
        allocation: &ActiveAllocation,
    ) -> Result<(), Error> {
        let mut data = self.data.lock().await;
        match data.allocations.get_mut(&allocation.key) {
            Some(existing) => {
                *existing = allocation.clone();
                Ok(())
            }
            None => Err(Error::not_found(
                ResourceType::Allocation,
                &allocation.key.to_string(),
            )),
        }
    }

    pub async fn allocation_delete(&self, key: &AllocationKey) {
        self.data.lock().await.allocations.remove(key);
    }

    /// Returns every started allocation owned by `user`.
    pub async fn allocations_started_for_user(
        &self,
        user: &str,
    ) -> Vec<ActiveAllocation> {
        self.data
            .lock()
            .await
            .allocations
            .values()
            .filter(|a| a.is_started && a.key.user == user)
            .cloned()
            .collect()
    }

    /// Returns every started allocation whose expiration has passed.
    pub async fn allocations_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Vec<ActiveAllocation> {
        self.data
            .lock()
            .await
            .allocations
            .values()
            .filter(|a| a.is_started && a.expire_time < now)
            .cloned()
            .collect()
    }

    /*
     * VM instances
     */

    pub async fn vm_create(
        &self,
        allocation_id: u32,
        template: &VmTemplate,
    ) -> Result<VmInstance, Error> {
        let mut data = self.data.lock().await;
        let vm = VmInstance {
            id: data.next_id(),
            allocation_id,
            template_id: template.id,
            backing_fingerprint: template.fingerprint.clone(),
        };
        data.vms.insert(vm.id, vm.clone());
        Ok(vm)
    }

    /// Returns an allocation's VMs with their templates, in template
    /// `order_id` order.
    pub async fn vms_for_allocation(
        &self,
        allocation_id: u32,
    ) -> Vec<(VmInstance, VmTemplate)> {
        let data = self.data.lock().await;
        let mut vms: Vec<(VmInstance, VmTemplate)> = data
            .vms
            .values()
            .filter(|vm| vm.allocation_id == allocation_id)
            .filter_map(|vm| {
                data.templates
                    .get(&vm.template_id)
                    .map(|t| (vm.clone(), t.clone()))
            })
            .collect();
        vms.sort_by_key(|(vm, t)| (t.order_id, vm.id));
        vms
    }

    pub async fn vm_delete(&self, vm_id: u32) {
        self.data.lock().await.vms.remove(&vm_id);
    }

    /*
     * Assigned IPs
     */

    pub async fn assigned_ip_lookup(&self, user: &str) -> Option<Ipv4Addr> {
        self.data.lock().await.assigned_ips.get(user).copied()
    }

    /// Creates or overwrites the user's IP mapping.
    pub async fn assigned_ip_upsert(&self, user: &str, ip: Ipv4Addr) {
        self.data
            .lock()
            .await
            .assigned_ips
            .insert(user.to_owned(), ip);
    }

    pub async fn assigned_ip_delete_by_user(
        &self,
        user: &str,
    ) -> Option<Ipv4Addr> {
        self.data.lock().await.assigned_ips.remove(user)
    }

    /// Deletes whatever mapping currently holds `ip`, returning the
    /// displaced user.
    pub async fn assigned_ip_delete_by_ip(
        &self,
        ip: Ipv4Addr,
    ) -> Option<String> {
        let mut data = self.data.lock().await;
        let user = data
            .assigned_ips
            .iter()
            .find(|(_, assigned)| **assigned == ip)
            .map(|(user, _)| user.clone())?;
        data.assigned_ips.remove(&user);
        Some(user)
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}
