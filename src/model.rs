// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data model for the VM network control plane
//!
//! The first half of this file describes the persisted entities (resources,
//! address ranges and their subnets, templates, allocations, VM instances,
//! assigned IPs).  The second half describes the parameter and view types
//! used on the HTTP surface.  Persisted entities are plain structs: the
//! datastore is the only component that hands them out, and sharing is by
//! clone, not by reference.

use chrono::DateTime;
use chrono::Utc;
use ipnetwork::Ipv4Network;
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::schema::SchemaObject;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Fixed provisioning TTL: how far a start or ping pushes out `expire_time`.
pub const DEFAULT_ALLOCATION_TTL_SECS: u64 = 30 * 60;

/// The closed set of provisionable resource kinds.
///
/// "vmnet" is a bundle of networked VMs and is currently the only member.
#[derive(
    Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Vmnet,
}

/// A provisionable bundle definition, independent of any running instance
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    pub id: u32,
    pub name: String,
    pub kind: ResourceKind,
}

/// An operator-created parent network block, partitioned into fixed-size
/// subnets when the range is created
#[derive(Clone, Debug, PartialEq)]
pub struct AddressRange {
    pub name: String,
    pub network: Ipv4Network,
    pub subnet_prefix: u8,
}

/// One subnet carved out of an [`AddressRange`]
///
/// Subnets are created eagerly alongside their range and never deleted while
/// the range exists; `in_use` flips as allocations claim and release them.
#[derive(Clone, Debug, PartialEq)]
pub struct Subnet {
    pub id: u32,
    pub range_name: String,
    pub network: Ipv4Network,
    pub in_use: bool,
}

/// An immutable backing image plus boot parameters for one VM role within a
/// resource bundle
///
/// The fingerprint is the SHA-256 of the image content, computed once when
/// the template is registered.  Multiple templates may share a fingerprint;
/// the backing volume is deduplicated by content.
#[derive(Clone, Debug, PartialEq)]
pub struct VmTemplate {
    pub id: u32,
    pub resource_id: u32,
    pub name: String,
    pub memory_mib: u32,
    pub fingerprint: String,
    pub order_id: u32,
}

/// Identity of an allocation: at most one live allocation exists per
/// `(resource, user)` pair.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct AllocationKey {
    pub resource: String,
    pub user: String,
}

impl AllocationKey {
    pub fn new(resource: &str, user: &str) -> AllocationKey {
        AllocationKey { resource: resource.to_owned(), user: user.to_owned() }
    }
}

impl std::fmt::Display for AllocationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} for {}", self.resource, self.user)
    }
}

/// One user's running (or stopped-but-remembered) instance of a resource
/// bundle
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveAllocation {
    pub id: u32,
    pub key: AllocationKey,
    /// the claimed subnet; `None` until the allocation has been started once
    pub subnet_id: Option<u32>,
    pub expire_time: DateTime<Utc>,
    pub is_started: bool,
}

/// One running VM, owned by exactly one allocation
///
/// The VM owns one hypervisor domain and one writable copy-on-write volume,
/// both named after `id`; those objects exist only while this record does.
#[derive(Clone, Debug, PartialEq)]
pub struct VmInstance {
    pub id: u32,
    pub allocation_id: u32,
    pub template_id: u32,
    pub backing_fingerprint: String,
}

/*
 * HTTP parameter and view types
 */

/// Identifies an allocation for the lifecycle operations
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct VmOpParams {
    pub resource: String,
    pub username: String,
}

/// Body of an IP-assignment notification from the VPN collaborator
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct AssignIpParams {
    pub username: String,
    pub ip_address: Ipv4Addr,
}

/// Body of an IP-unassignment notification, keyed by username or by address
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct UnassignIpParams {
    pub username: Option<String>,
    pub ip_address: Option<Ipv4Addr>,
}

/// Create a resource bundle definition
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct ResourceCreateParams {
    pub name: String,
}

/// Create an address range (and eagerly materialize its subnets)
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct RangeCreateParams {
    pub name: String,
    /// parent network in CIDR notation, e.g. "10.0.0.0/24"
    pub network: String,
    /// prefix length of each carved subnet, e.g. 30
    pub subnet_prefix: u8,
}

/// Register a VM template from an image file readable by the server
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct TemplateCreateParams {
    pub resource: String,
    pub name: String,
    pub memory_mib: u32,
    pub order_id: u32,
    #[schemars(schema_with = "path_schema")]
    pub image_file: camino::Utf8PathBuf,
}

fn path_schema(gen: &mut SchemaGenerator) -> Schema {
    let mut schema: SchemaObject = <String>::json_schema(gen).into();
    schema.format = Some("Utf8PathBuf".to_owned());
    schema.into()
}

/// One VM within a running allocation, as reported to the user
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct VmView {
    pub name: String,
    pub ip: Ipv4Addr,
}

/// Client view of a running allocation
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct AllocationView {
    pub id: u32,
    pub expire: DateTime<Utc>,
    pub virtual_machines: Vec<VmView>,
}

/// Result of a ping: the refreshed expiration time
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PingView {
    pub id: u32,
    pub expire: DateTime<Utc>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Running,
    NotRunning,
}

/// Client view of an allocation's status, running or not
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct StatusView {
    pub status: AllocationStatus,
    pub resource: Option<AllocationView>,
}

/// Result of creating an address range
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct RangeView {
    pub name: String,
    pub subnets_created: usize,
}

/// Result of registering a VM template
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TemplateView {
    pub id: u32,
    pub name: String,
    pub fingerprint: String,
}
