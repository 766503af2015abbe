// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests for IP assignment notifications and the per-subnet access filters

mod common;

use common::allocation_subnet_id;
use common::populate;
use common::test_setup;
use common::RESOURCE;
use std::net::Ipv4Addr;
use vmnet_server::hypervisor::names;

const ALICE_IP: &str = "192.168.50.10";
const BOB_IP: &str = "192.168.50.11";

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_preassigned_ip_granted_on_start() {
    let ctx = test_setup("test_preassigned_ip_granted_on_start");
    populate(&ctx).await;

    // the VPN notification can arrive before the allocation exists
    ctx.controller.assign_ip("alice", ip(ALICE_IP)).await;

    ctx.controller.start_for(RESOURCE, "alice").await.unwrap();
    let subnet_id = allocation_subnet_id(&ctx, RESOURCE, "alice").await;
    assert_eq!(
        ctx.sim.filter_allowed_source(&names::filter_name(subnet_id)),
        Some(ip(ALICE_IP))
    );

    ctx.cleanup_successful();
}

#[tokio::test]
async fn test_assign_after_start() {
    let ctx = test_setup("test_assign_after_start");
    populate(&ctx).await;

    ctx.controller.start_for(RESOURCE, "alice").await.unwrap();
    let subnet_id = allocation_subnet_id(&ctx, RESOURCE, "alice").await;
    let filter = names::filter_name(subnet_id);
    assert_eq!(ctx.sim.filter_allowed_source(&filter), None);

    ctx.controller.assign_ip("alice", ip(ALICE_IP)).await;
    assert_eq!(ctx.sim.filter_allowed_source(&filter), Some(ip(ALICE_IP)));

    // a fresh assignment replaces the old grant
    ctx.controller.assign_ip("alice", ip("192.168.50.99")).await;
    assert_eq!(
        ctx.sim.filter_allowed_source(&filter),
        Some(ip("192.168.50.99"))
    );

    ctx.cleanup_successful();
}

#[tokio::test]
async fn test_reassignment_displaces_prior_owner() {
    let ctx = test_setup("test_reassignment_displaces_prior_owner");
    populate(&ctx).await;

    ctx.controller.start_for(RESOURCE, "alice").await.unwrap();
    ctx.controller.start_for(RESOURCE, "bob").await.unwrap();
    let alice_filter = names::filter_name(
        allocation_subnet_id(&ctx, RESOURCE, "alice").await,
    );
    let bob_filter =
        names::filter_name(allocation_subnet_id(&ctx, RESOURCE, "bob").await);

    ctx.controller.assign_ip("alice", ip(ALICE_IP)).await;
    assert_eq!(ctx.sim.filter_allowed_source(&alice_filter), Some(ip(ALICE_IP)));

    // bob reconnects and gets alice's old address; her grant must drop
    ctx.controller.assign_ip("bob", ip(ALICE_IP)).await;
    assert_eq!(ctx.sim.filter_allowed_source(&alice_filter), None);
    assert_eq!(ctx.sim.filter_allowed_source(&bob_filter), Some(ip(ALICE_IP)));

    ctx.cleanup_successful();
}

#[tokio::test]
async fn test_self_reassignment_is_not_a_displacement() {
    let ctx = test_setup("test_self_reassignment_is_not_a_displacement");
    populate(&ctx).await;

    ctx.controller.start_for(RESOURCE, "alice").await.unwrap();
    let filter = names::filter_name(
        allocation_subnet_id(&ctx, RESOURCE, "alice").await,
    );

    // a duplicate notification for the same (user, ip) keeps the grant
    ctx.controller.assign_ip("alice", ip(ALICE_IP)).await;
    ctx.controller.assign_ip("alice", ip(ALICE_IP)).await;
    assert_eq!(ctx.sim.filter_allowed_source(&filter), Some(ip(ALICE_IP)));

    ctx.cleanup_successful();
}

#[tokio::test]
async fn test_unassign_by_user() {
    let ctx = test_setup("test_unassign_by_user");
    populate(&ctx).await;

    ctx.controller.start_for(RESOURCE, "alice").await.unwrap();
    let filter = names::filter_name(
        allocation_subnet_id(&ctx, RESOURCE, "alice").await,
    );
    ctx.controller.assign_ip("alice", ip(ALICE_IP)).await;

    ctx.controller.unassign_ip_for_user("alice").await;
    assert_eq!(ctx.sim.filter_allowed_source(&filter), None);

    // unassigning a user with no address of record mutates nothing
    ctx.controller.unassign_ip_for_user("mallory").await;
    assert_eq!(ctx.sim.filter_allowed_source(&filter), None);

    ctx.cleanup_successful();
}

#[tokio::test]
async fn test_unassign_by_address() {
    let ctx = test_setup("test_unassign_by_address");
    populate(&ctx).await;

    ctx.controller.start_for(RESOURCE, "alice").await.unwrap();
    ctx.controller.start_for(RESOURCE, "bob").await.unwrap();
    let alice_filter = names::filter_name(
        allocation_subnet_id(&ctx, RESOURCE, "alice").await,
    );
    let bob_filter =
        names::filter_name(allocation_subnet_id(&ctx, RESOURCE, "bob").await);
    ctx.controller.assign_ip("alice", ip(ALICE_IP)).await;
    ctx.controller.assign_ip("bob", ip(BOB_IP)).await;

    // revoking by address affects only the owner of that address
    ctx.controller.unassign_ip_address(ip(ALICE_IP)).await;
    assert_eq!(ctx.sim.filter_allowed_source(&alice_filter), None);
    assert_eq!(ctx.sim.filter_allowed_source(&bob_filter), Some(ip(BOB_IP)));

    ctx.cleanup_successful();
}

#[tokio::test]
async fn test_grant_spans_all_started_allocations() {
    let ctx = test_setup("test_grant_spans_all_started_allocations");
    populate(&ctx).await;
    ctx.controller.resource_create("crypto-lab").await.unwrap();
    common::register_template(
        &ctx,
        "crypto-lab",
        "server",
        512,
        1,
        b"server image",
    )
    .await;

    ctx.controller.start_for(RESOURCE, "alice").await.unwrap();
    ctx.controller.start_for("crypto-lab", "alice").await.unwrap();
    ctx.controller.assign_ip("alice", ip(ALICE_IP)).await;

    let routing_filter = names::filter_name(
        allocation_subnet_id(&ctx, RESOURCE, "alice").await,
    );
    let crypto_filter = names::filter_name(
        allocation_subnet_id(&ctx, "crypto-lab", "alice").await,
    );
    assert_eq!(
        ctx.sim.filter_allowed_source(&routing_filter),
        Some(ip(ALICE_IP))
    );
    assert_eq!(
        ctx.sim.filter_allowed_source(&crypto_filter),
        Some(ip(ALICE_IP))
    );

    ctx.cleanup_successful();
}
