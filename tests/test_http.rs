// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests exercising the HTTP surface end to end against a transient server

use camino::Utf8PathBuf;
use dropshot::test_util::read_json;
use dropshot::test_util::ClientTestContext;
use dropshot::test_util::LogContext;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use http::Method;
use http::StatusCode;
use std::io::Write;
use vmnet_server::model::AllocationView;
use vmnet_server::model::AssignIpParams;
use vmnet_server::model::PingView;
use vmnet_server::model::RangeCreateParams;
use vmnet_server::model::RangeView;
use vmnet_server::model::ResourceCreateParams;
use vmnet_server::model::StatusView;
use vmnet_server::model::TemplateCreateParams;
use vmnet_server::model::TemplateView;
use vmnet_server::model::UnassignIpParams;
use vmnet_server::model::VmOpParams;
use vmnet_server::TransientServer;

struct HttpTestContext {
    logctx: LogContext,
    server: TransientServer,
    client: ClientTestContext,
    /// held open so the image files outlive template registration
    #[allow(dead_code)]
    images: Vec<tempfile::NamedTempFile>,
}

async fn http_setup(test_name: &str) -> HttpTestContext {
    let logctx = LogContext::new(
        test_name,
        &ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Warn },
    );
    let server = TransientServer::new(&logctx.log)
        .await
        .expect("started transient server");
    let client = ClientTestContext::new(server.local_addr(), logctx.log.clone());
    HttpTestContext { logctx, server, client, images: Vec::new() }
}

/// Creates the resource, range, and two templates used by most tests.
async fn http_populate(ctx: &mut HttpTestContext) {
    ctx.client
        .make_request(
            Method::POST,
            "/resources",
            Some(ResourceCreateParams { name: String::from("routing-lab") }),
            StatusCode::NO_CONTENT,
        )
        .await
        .expect("created resource");

    let mut response = ctx
        .client
        .make_request(
            Method::POST,
            "/ranges",
            Some(RangeCreateParams {
                name: String::from("default"),
                network: String::from("10.0.0.0/24"),
                subnet_prefix: 30,
            }),
            StatusCode::OK,
        )
        .await
        .expect("created range");
    let range: RangeView = read_json(&mut response).await;
    assert_eq!(range.subnets_created, 64);

    for (name, order_id) in [("gateway", 1), ("target", 2)] {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(name.as_bytes()).unwrap();
        image.flush().unwrap();
        let image_file =
            Utf8PathBuf::from_path_buf(image.path().to_path_buf()).unwrap();
        let mut response = ctx
            .client
            .make_request(
                Method::POST,
                "/templates",
                Some(TemplateCreateParams {
                    resource: String::from("routing-lab"),
                    name: String::from(name),
                    memory_mib: 512,
                    order_id,
                    image_file,
                }),
                StatusCode::OK,
            )
            .await
            .expect("registered template");
        let template: TemplateView = read_json(&mut response).await;
        assert_eq!(template.name, name);
        ctx.images.push(image);
    }
}

fn op_params(username: &str) -> VmOpParams {
    VmOpParams {
        resource: String::from("routing-lab"),
        username: String::from(username),
    }
}

#[tokio::test]
async fn test_http_lifecycle_round_trip() {
    let mut ctx = http_setup("test_http_lifecycle_round_trip").await;
    http_populate(&mut ctx).await;

    // status before anything: not running
    let mut response = ctx
        .client
        .make_request(
            Method::GET,
            "/vm/status?resource=routing-lab&username=alice",
            None as Option<()>,
            StatusCode::OK,
        )
        .await
        .unwrap();
    let status: StatusView = read_json(&mut response).await;
    assert!(status.resource.is_none());

    // start
    let mut response = ctx
        .client
        .make_request(
            Method::POST,
            "/vm/start",
            Some(op_params("alice")),
            StatusCode::OK,
        )
        .await
        .unwrap();
    let view: AllocationView = read_json(&mut response).await;
    assert_eq!(view.virtual_machines.len(), 2);
    assert_eq!(view.virtual_machines[0].name, "gateway");
    assert_eq!(view.virtual_machines[0].ip.to_string(), "10.0.0.1");
    assert_eq!(view.virtual_machines[1].ip.to_string(), "10.0.0.2");

    // a second start returns the same allocation
    let mut response = ctx
        .client
        .make_request(
            Method::POST,
            "/vm/start",
            Some(op_params("alice")),
            StatusCode::OK,
        )
        .await
        .unwrap();
    let again: AllocationView = read_json(&mut response).await;
    assert_eq!(again.id, view.id);

    // status reflects the running allocation
    let mut response = ctx
        .client
        .make_request(
            Method::GET,
            "/vm/status?resource=routing-lab&username=alice",
            None as Option<()>,
            StatusCode::OK,
        )
        .await
        .unwrap();
    let status: StatusView = read_json(&mut response).await;
    let resource = status.resource.expect("running allocation");
    assert_eq!(resource.id, view.id);

    // ping pushes the expiration forward
    let mut response = ctx
        .client
        .make_request(
            Method::POST,
            "/vm/ping",
            Some(op_params("alice")),
            StatusCode::OK,
        )
        .await
        .unwrap();
    let ping: PingView = read_json(&mut response).await;
    assert_eq!(ping.id, view.id);
    assert!(ping.expire >= view.expire);

    // stop tears everything down
    ctx.client
        .make_request(
            Method::POST,
            "/vm/stop",
            Some(op_params("alice")),
            StatusCode::NO_CONTENT,
        )
        .await
        .unwrap();
    assert!(ctx.server.sim.domain_names().is_empty());

    // and the allocation is gone
    let error = ctx
        .client
        .make_request(
            Method::POST,
            "/vm/ping",
            Some(op_params("alice")),
            StatusCode::NOT_FOUND,
        )
        .await
        .expect_err("expected error");
    assert!(error.message.contains("routing-lab for alice"));

    ctx.logctx.cleanup_successful();
}

#[tokio::test]
async fn test_http_errors() {
    let mut ctx = http_setup("test_http_errors").await;
    http_populate(&mut ctx).await;

    // unknown resource
    let error = ctx
        .client
        .make_request(
            Method::POST,
            "/vm/start",
            Some(VmOpParams {
                resource: String::from("no-such-lab"),
                username: String::from("alice"),
            }),
            StatusCode::NOT_FOUND,
        )
        .await
        .expect_err("expected error");
    assert_eq!(error.message, "not found: resource \"no-such-lab\"");

    // stop without a running allocation
    ctx.client
        .make_request(
            Method::POST,
            "/vm/stop",
            Some(op_params("alice")),
            StatusCode::NOT_FOUND,
        )
        .await
        .expect_err("expected error");

    // malformed range
    let error = ctx
        .client
        .make_request(
            Method::POST,
            "/ranges",
            Some(RangeCreateParams {
                name: String::from("bogus"),
                network: String::from("not-a-network"),
                subnet_prefix: 30,
            }),
            StatusCode::BAD_REQUEST,
        )
        .await
        .expect_err("expected error");
    assert!(error.message.contains("network"));

    // duplicate resource
    let error = ctx
        .client
        .make_request(
            Method::POST,
            "/resources",
            Some(ResourceCreateParams { name: String::from("routing-lab") }),
            StatusCode::BAD_REQUEST,
        )
        .await
        .expect_err("expected error");
    assert!(error.message.contains("already exists"));

    ctx.logctx.cleanup_successful();
}

#[tokio::test]
async fn test_http_vpn_notifications() {
    let mut ctx = http_setup("test_http_vpn_notifications").await;
    http_populate(&mut ctx).await;

    ctx.client
        .make_request(
            Method::POST,
            "/vm/start",
            Some(op_params("alice")),
            StatusCode::OK,
        )
        .await
        .unwrap();

    ctx.client
        .make_request(
            Method::POST,
            "/vpn/assign",
            Some(AssignIpParams {
                username: String::from("alice"),
                ip_address: "192.168.50.10".parse().unwrap(),
            }),
            StatusCode::NO_CONTENT,
        )
        .await
        .unwrap();

    // alice has exactly one subnet, so exactly one filter carries her grant
    let granted = ctx
        .server
        .sim
        .network_names()
        .iter()
        .map(|name| name.replace("vmnet_", "vmnetnwfilter_"))
        .filter(|filter| {
            ctx.server.sim.filter_allowed_source(filter).is_some()
        })
        .count();
    assert_eq!(granted, 1);

    ctx.client
        .make_request(
            Method::POST,
            "/vpn/unassign",
            Some(UnassignIpParams {
                username: Some(String::from("alice")),
                ip_address: None,
            }),
            StatusCode::NO_CONTENT,
        )
        .await
        .unwrap();

    // unassign with neither key is rejected
    let error = ctx
        .client
        .make_request(
            Method::POST,
            "/vpn/unassign",
            Some(UnassignIpParams { username: None, ip_address: None }),
            StatusCode::BAD_REQUEST,
        )
        .await
        .expect_err("expected error");
    assert!(error.message.contains("username or ip_address"));

    ctx.logctx.cleanup_successful();
}
