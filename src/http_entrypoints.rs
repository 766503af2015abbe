// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP entrypoints exposed to the request layer
//!
//! Four lifecycle operations keyed by `(resource, username)`, two IP-binding
//! notifications from the VPN collaborator, and three administrative
//! operations.  Handlers are thin: parameter extraction here, semantics in
//! [`crate::controller`].

use crate::controller::Controller;
use crate::model::AllocationView;
use crate::model::AssignIpParams;
use crate::model::PingView;
use crate::model::RangeCreateParams;
use crate::model::RangeView;
use crate::model::ResourceCreateParams;
use crate::model::StatusView;
use crate::model::TemplateCreateParams;
use crate::model::TemplateView;
use crate::model::UnassignIpParams;
use crate::model::VmOpParams;
use dropshot::endpoint;
use dropshot::ApiDescription;
use dropshot::HttpError;
use dropshot::HttpResponseDeleted;
use dropshot::HttpResponseOk;
use dropshot::HttpResponseUpdatedNoContent;
use dropshot::Query;
use dropshot::RequestContext;
use dropshot::TypedBody;
use std::sync::Arc;

pub struct ServerContext {
    pub controller: Arc<Controller>,
}

pub fn api() -> ApiDescription<Arc<ServerContext>> {
    let mut api = ApiDescription::new();
    api.register(vm_start).expect("registered vm_start");
    api.register(vm_stop).expect("registered vm_stop");
    api.register(vm_ping).expect("registered vm_ping");
    api.register(vm_status).expect("registered vm_status");
    api.register(vpn_assign_ip).expect("registered vpn_assign_ip");
    api.register(vpn_unassign_ip).expect("registered vpn_unassign_ip");
    api.register(resource_create).expect("registered resource_create");
    api.register(range_create).expect("registered range_create");
    api.register(template_create).expect("registered template_create");
    api
}

/// Start the caller's allocation of a resource bundle, or return the
/// already-running one.
#[endpoint {
    method = POST,
    path = "/vm/start",
}]
async fn vm_start(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<VmOpParams>,
) -> Result<HttpResponseOk<AllocationView>, HttpError> {
    let apictx = rqctx.context();
    let params = body.into_inner();
    let view = apictx
        .controller
        .start_for(&params.resource, &params.username)
        .await?;
    Ok(HttpResponseOk(view))
}

/// Destroy the caller's running allocation.
#[endpoint {
    method = POST,
    path = "/vm/stop",
}]
async fn vm_stop(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<VmOpParams>,
) -> Result<HttpResponseDeleted, HttpError> {
    let apictx = rqctx.context();
    let params = body.into_inner();
    apictx.controller.destroy(&params.resource, &params.username).await?;
    Ok(HttpResponseDeleted())
}

/// Keep the caller's running allocation alive.
#[endpoint {
    method = POST,
    path = "/vm/ping",
}]
async fn vm_ping(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<VmOpParams>,
) -> Result<HttpResponseOk<PingView>, HttpError> {
    let apictx = rqctx.context();
    let params = body.into_inner();
    let view =
        apictx.controller.ping(&params.resource, &params.username).await?;
    Ok(HttpResponseOk(view))
}

/// Report whether the caller's allocation is running, and its VMs if so.
#[endpoint {
    method = GET,
    path = "/vm/status",
}]
async fn vm_status(
    rqctx: RequestContext<Arc<ServerContext>>,
    query: Query<VmOpParams>,
) -> Result<HttpResponseOk<StatusView>, HttpError> {
    let apictx = rqctx.context();
    let params = query.into_inner();
    let view =
        apictx.controller.status(&params.resource, &params.username).await?;
    Ok(HttpResponseOk(view))
}

/// Notification from the VPN collaborator that a user's external IP changed.
#[endpoint {
    method = POST,
    path = "/vpn/assign",
}]
async fn vpn_assign_ip(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<AssignIpParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let params = body.into_inner();
    apictx.controller.assign_ip(&params.username, params.ip_address).await;
    Ok(HttpResponseUpdatedNoContent())
}

/// Notification that a user's external IP went away, keyed by username, by
/// address, or both.
#[endpoint {
    method = POST,
    path = "/vpn/unassign",
}]
async fn vpn_unassign_ip(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<UnassignIpParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let params = body.into_inner();
    if params.username.is_none() && params.ip_address.is_none() {
        return Err(HttpError::for_bad_request(
            None,
            String::from("either username or ip_address is required"),
        ));
    }
    if let Some(username) = &params.username {
        apictx.controller.unassign_ip_for_user(username).await;
    }
    if let Some(ip) = params.ip_address {
        apictx.controller.unassign_ip_address(ip).await;
    }
    Ok(HttpResponseUpdatedNoContent())
}

/// Create a resource bundle definition (administrative).
#[endpoint {
    method = POST,
    path = "/resources",
}]
async fn resource_create(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<ResourceCreateParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let apictx = rqctx.context();
    let params = body.into_inner();
    apictx.controller.resource_create(&params.name).await?;
    Ok(HttpResponseUpdatedNoContent())
}

/// Create an address range and materialize its subnets (administrative).
#[endpoint {
    method = POST,
    path = "/ranges",
}]
async fn range_create(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<RangeCreateParams>,
) -> Result<HttpResponseOk<RangeView>, HttpError> {
    let apictx = rqctx.context();
    let params = body.into_inner();
    let view = apictx.controller.range_create(&params).await?;
    Ok(HttpResponseOk(view))
}

/// Register a VM template from an image file readable by the server
/// (administrative).
#[endpoint {
    method = POST,
    path = "/templates",
}]
async fn template_create(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<TemplateCreateParams>,
) -> Result<HttpResponseOk<TemplateView>, HttpError> {
    let apictx = rqctx.context();
    let params = body.into_inner();
    let view = apictx.controller.template_register(&params).await?;
    Ok(HttpResponseOk(view))
}
