// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hypervisor capability consumed by the control plane
//!
//! The control plane treats the hypervisor as an opaque service that can
//! define and destroy networks, traffic filters, storage volumes, and compute
//! domains.  Every object is looked up by a stable name derived from record
//! identities (see [`names`]), so any process can recompute the name from a
//! record alone.  [`sim::SimHypervisor`] provides the in-memory
//! implementation used by the test suite and for development.

pub mod sim;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use macaddr::MacAddr6;
use sha2::Digest;
use sha2::Sha256;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Derived stable names for hypervisor objects
pub mod names {
    /// The isolated L2 network for a claimed subnet.
    pub fn network_name(subnet_id: u32) -> String {
        format!("vmnet_{}", subnet_id)
    }

    /// The ingress traffic filter scoped to a claimed subnet.
    pub fn filter_name(subnet_id: u32) -> String {
        format!("vmnetnwfilter_{}", subnet_id)
    }

    /// The compute domain for a VM instance.
    pub fn domain_name(vm_id: u32) -> String {
        format!("vm_{}", vm_id)
    }

    /// The writable copy-on-write overlay volume for a VM instance.
    pub fn volume_name(vm_id: u32) -> String {
        format!("vmimage_{}.qcow2", vm_id)
    }

    /// The immutable content-addressed base volume for a template.
    pub fn backing_volume_name(fingerprint: &str) -> String {
        format!("backing-{}.qcow2", fingerprint)
    }
}

/// Derives a stable UUID for a traffic filter from its name, so that
/// redefining the filter overwrites the previous definition instead of
/// accumulating new ones.
pub fn filter_uuid(filter_name: &str) -> Uuid {
    let digest = Sha256::digest(filter_name.as_bytes());
    let h = hex::encode(digest);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
    .parse()
    .expect("32 hex digits always form a valid UUID")
}

/// One static DHCP lease entry in a network definition
#[derive(Clone, Debug, PartialEq)]
pub struct StaticHost {
    pub name: String,
    pub addr: Ipv4Addr,
    pub mac: MacAddr6,
}

/// Descriptor for defining an isolated L2 network
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkConfig {
    pub name: String,
    pub subnet: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub dhcp_start: Ipv4Addr,
    pub dhcp_end: Ipv4Addr,
    pub hosts: Vec<StaticHost>,
    /// survive a hypervisor restart
    pub autostart: bool,
}

/// Descriptor for defining a traffic filter
///
/// With `allowed_source` unset, the filter denies all external ingress.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterConfig {
    pub name: String,
    pub uuid: Uuid,
    pub subnet: Ipv4Network,
    pub allowed_source: Option<Ipv4Addr>,
}

/// Descriptor for creating a storage volume
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeConfig {
    pub name: String,
    pub capacity: u64,
    /// name of the read-only base volume for a copy-on-write overlay
    pub backing_volume: Option<String>,
}

/// Information about an existing storage volume
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeInfo {
    pub name: String,
    pub capacity: u64,
}

/// Descriptor for defining a compute domain
#[derive(Clone, Debug, PartialEq)]
pub struct DomainConfig {
    pub name: String,
    pub memory_mib: u32,
    /// name of the boot volume
    pub volume: String,
    /// name of the network the single interface attaches to
    pub network: String,
    pub mac: MacAddr6,
    /// name of the traffic filter referenced by the interface
    pub filter: String,
    pub autostart: bool,
}

/// The kinds of hypervisor object, for error reporting
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ObjectKind {
    Network,
    Filter,
    Volume,
    Domain,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ObjectKind::Network => "network",
            ObjectKind::Filter => "filter",
            ObjectKind::Volume => "volume",
            ObjectKind::Domain => "domain",
        })
    }
}

/// Failure from the hypervisor capability
///
/// `NotFound` is distinguishable because teardown paths treat "already gone"
/// as success.  Everything else is an unexpected fault.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum HypervisorError {
    #[error("no such {kind}: \"{name}\"")]
    NotFound { kind: ObjectKind, name: String },

    #[error("{kind} already exists: \"{name}\"")]
    AlreadyExists { kind: ObjectKind, name: String },

    #[error("{kind} \"{name}\" is not running")]
    NotRunning { kind: ObjectKind, name: String },

    #[error("hypervisor fault: {message}")]
    Fault { message: String },
}

impl HypervisorError {
    /// Whether this error means the object is already absent (or already
    /// stopped), which teardown paths treat as success.
    pub fn is_already_gone(&self) -> bool {
        matches!(
            self,
            HypervisorError::NotFound { .. }
                | HypervisorError::NotRunning { .. }
        )
    }
}

/// The capability surface the control plane requires of a hypervisor
///
/// Calls are synchronous from the caller's point of view and potentially
/// slow.  Operations on the same named object are serialized by the record
/// lock that gates them; unrelated calls may be concurrent.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Returns whether a network with this name is defined.
    async fn network_lookup(&self, name: &str)
        -> Result<bool, HypervisorError>;

    /// Defines and starts a network, marking it autostart if requested.
    async fn network_define(
        &self,
        config: &NetworkConfig,
    ) -> Result<(), HypervisorError>;

    /// Stops a running network.
    async fn network_destroy(&self, name: &str)
        -> Result<(), HypervisorError>;

    /// Removes a network's definition.
    async fn network_undefine(
        &self,
        name: &str,
    ) -> Result<(), HypervisorError>;

    /// Defines a traffic filter.  Defining a filter whose name is already
    /// taken replaces the previous definition.
    async fn filter_define(
        &self,
        config: &FilterConfig,
    ) -> Result<(), HypervisorError>;

    /// Removes a traffic filter.
    async fn filter_undefine(&self, name: &str)
        -> Result<(), HypervisorError>;

    /// Looks up a storage volume by name.
    async fn volume_lookup(
        &self,
        name: &str,
    ) -> Result<Option<VolumeInfo>, HypervisorError>;

    /// Creates a storage volume, optionally copy-on-write against a backing
    /// volume.
    async fn volume_create(
        &self,
        config: &VolumeConfig,
    ) -> Result<(), HypervisorError>;

    /// Appends a chunk of content to a volume.
    async fn volume_append(
        &self,
        name: &str,
        chunk: &[u8],
    ) -> Result<(), HypervisorError>;

    /// Deletes a storage volume.
    async fn volume_delete(&self, name: &str)
        -> Result<(), HypervisorError>;

    /// Defines a compute domain, marking it autostart if requested.
    async fn domain_define(
        &self,
        config: &DomainConfig,
    ) -> Result<(), HypervisorError>;

    /// Starts a defined domain.
    async fn domain_start(&self, name: &str) -> Result<(), HypervisorError>;

    /// Forcibly stops a running domain.
    async fn domain_destroy(&self, name: &str)
        -> Result<(), HypervisorError>;

    /// Removes a domain's definition.
    async fn domain_undefine(&self, name: &str)
        -> Result<(), HypervisorError>;
}
